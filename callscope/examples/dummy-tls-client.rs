//! Demo target - two exported functions standing in for a TLS library
//!
//! ```bash
//! cargo run --example dummy-tls-client
//! # in another terminal, with the printed PID:
//! sudo callscope --pid <PID> --entry dummy_SSL_read --call dummy_SSL_write
//! ```
//!
//! `dummy_SSL_write` takes ~15ms per call, so its records should report
//! durations just above that.

#![allow(non_snake_case, unsafe_code)]

use std::hint::black_box;
use std::io::BufRead;
use std::time::Duration;

const ITERATIONS: u32 = 5;

#[no_mangle]
#[inline(never)]
pub extern "C" fn dummy_SSL_read(len: u64) -> u64 {
    std::thread::sleep(Duration::from_millis(10));
    black_box(len)
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn dummy_SSL_write(len: u64) -> u64 {
    std::thread::sleep(Duration::from_millis(15));
    black_box(len)
}

fn main() {
    println!("dummy-tls-client pid: {}", std::process::id());
    println!("Attach callscope, then press Enter to start");

    let mut line = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
        eprintln!("stdin: {e}");
    }

    for i in 0..ITERATIONS {
        let n = u64::from(i) + 5;
        let written = dummy_SSL_write(black_box(n));
        let read = dummy_SSL_read(black_box(n));
        println!("[{i}] wrote {written}, read {read}");
        std::thread::sleep(Duration::from_secs(2));
    }

    println!("done");
}
