use std::process::Command;

fn callscope(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_callscope"))
        .args(args)
        .output()
        .expect("Failed to run callscope")
}

#[test]
fn test_missing_probe_is_usage_error() {
    let pid = std::process::id().to_string();
    let output = callscope(&["--pid", &pid]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--entry, --return or --call"), "stderr: {stderr}");
}

#[test]
fn test_missing_target_is_usage_error() {
    let output = callscope(&["--call", "dummy_SSL_write"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("PROCESS or --pid"), "stderr: {stderr}");
}

#[test]
fn test_unknown_process_name_fails() {
    let output = callscope(&["no-such-process-callscope-test", "--call", "f"]);

    assert_eq!(output.status.code(), Some(1));
}
