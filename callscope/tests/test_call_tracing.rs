//! End-to-end tracing through the in-process backend: probes, capture,
//! transport, correlator and sink, with no kernel support required.

use crossbeam_channel::Receiver;
use std::sync::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callscope::capture::Capture;
use callscope::correlator::{CallRecord, Completion, Diagnostic, IncompleteReason, Output, ProbeHit};
use callscope::domain::{AttachError, AttachKind, Pid, ResolutionError, Timestamp};
use callscope::probes::{InProcessBackend, InProcessTarget, ProbeHandle, ProbeManager, ProbeSpec};
use callscope::session::{Session, SessionSummary};
use callscope::sink::ChannelSink;
use callscope::symbolization::SymbolResolver;
use callscope::transport::{self, Drain};

const WRITE: &str = "dummy_SSL_write";
const READ: &str = "dummy_SSL_read";

struct Harness {
    target: Arc<InProcessTarget>,
    manager: ProbeManager<InProcessBackend>,
    drain: Drain,
}

fn harness(capacity: usize) -> Harness {
    let (buffer, drain) = transport::bounded(capacity);
    let target = InProcessTarget::new(Capture::new(buffer));
    target.register(WRITE);
    target.register(READ);
    target.register("recurse");

    let resolver: Arc<dyn SymbolResolver> = target.clone();
    let manager = ProbeManager::new(InProcessBackend::new(Arc::clone(&target)), resolver);
    Harness { target, manager, drain }
}

fn start(h: Harness) -> (Arc<InProcessTarget>, Session<InProcessBackend>, Receiver<Output>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let session = Session::start(h.manager, h.drain, ChannelSink::new(tx)).unwrap();
    (h.target, session, rx)
}

fn spec(target: &InProcessTarget, symbol: &str, kind: AttachKind) -> ProbeSpec {
    ProbeSpec::new(target.pid(), symbol, kind)
}

/// Attach return then entry, the order the CLI uses
fn trace_calls(session: &mut Session<InProcessBackend>, target: &InProcessTarget, symbol: &str) -> [ProbeHandle; 2] {
    let ret = session.attach(spec(target, symbol, AttachKind::Return)).unwrap();
    let entry = session.attach(spec(target, symbol, AttachKind::Entry)).unwrap();
    [ret, entry]
}

fn finish(session: Session<InProcessBackend>, rx: &Receiver<Output>) -> (SessionSummary, Vec<Output>) {
    let summary = session.finish().unwrap();
    (summary, rx.iter().collect())
}

fn calls(outputs: &[Output]) -> Vec<&CallRecord> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Output::Call(record) => Some(record),
            _ => None,
        })
        .collect()
}

fn hits(outputs: &[Output]) -> Vec<&ProbeHit> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Output::Hit(hit) => Some(hit),
            _ => None,
        })
        .collect()
}

fn sleep_then(ms: u64, value: u64) -> u64 {
    std::thread::sleep(Duration::from_millis(ms));
    value
}

#[test]
fn test_sequential_calls_report_durations() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    trace_calls(&mut session, &target, WRITE);

    for n in 0..5u64 {
        let ret = target.invoke(WRITE, &[n, 0x10], || sleep_then(15, n));
        assert_eq!(ret, n);
    }

    let (summary, outputs) = finish(session, &rx);
    let records = calls(&outputs);
    assert_eq!(records.len(), 5);

    for (n, record) in (0u64..).zip(&records) {
        assert_eq!(record.completion, Completion::Returned);
        assert_eq!(&*record.symbol, WRITE);
        assert_eq!(record.entry_payload.0[..2], [n, 0x10]);
        assert_eq!(record.exit_payload.map(|p| p.0[0]), Some(n));

        let ms = record.duration().as_millis();
        assert!((14.0..=20.0).contains(&ms), "call {n} took {ms}ms");
    }

    assert_eq!(summary.stats.calls, 5);
    assert_eq!(summary.stats.orphans, 0);
    assert_eq!(summary.stats.incomplete, 0);
    assert_eq!(summary.dropped, 0);
    assert_eq!(summary.accepted, 10);
}

#[test]
fn test_overlapping_threads_pair_by_thread() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    trace_calls(&mut session, &target, WRITE);

    std::thread::scope(|s| {
        for arg in [1u64, 2] {
            let target = &target;
            s.spawn(move || target.invoke(WRITE, &[arg], || sleep_then(30, arg * 10)));
        }
    });

    let (_, outputs) = finish(session, &rx);
    let records = calls(&outputs);
    assert_eq!(records.len(), 2);
    assert_ne!(records[0].tid, records[1].tid);
    for record in records {
        assert_eq!(record.completion, Completion::Returned);
        assert_eq!(record.exit_payload.map(|p| p.0[0]), Some(record.entry_payload.0[0] * 10));
    }
}

fn recurse(target: &InProcessTarget, depth: u64) -> u64 {
    target.invoke("recurse", &[depth], || if depth == 0 { 0 } else { recurse(target, depth - 1) + 1 })
}

#[test]
fn test_recursion_completes_innermost_first() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    trace_calls(&mut session, &target, "recurse");

    assert_eq!(recurse(&target, 3), 3);

    let (_, outputs) = finish(session, &rx);
    let records = calls(&outputs);
    let depths: Vec<u64> = records.iter().map(|r| r.entry_payload.0[0]).collect();
    assert_eq!(depths, vec![0, 1, 2, 3]);

    for pair in records.windows(2) {
        let (inner, outer) = (pair[0], pair[1]);
        assert!(outer.start <= inner.start);
        assert!(outer.end >= inner.end);
        assert_eq!(outer.exit_payload.map(|p| p.0[0]), inner.exit_payload.map(|p| p.0[0] + 1));
    }
}

/// Run one call of WRITE on another thread, doing `during` while it is in progress
fn with_call_in_progress(target: &Arc<InProcessTarget>, during: impl FnOnce()) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    std::thread::scope(|s| {
        s.spawn(move || {
            target.invoke(WRITE, &[7], || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                7
            })
        });
        entered_rx.recv().unwrap();
        during();
        release_tx.send(()).unwrap();
    });
}

#[test]
fn test_detach_mid_call_then_exit_reports_one_incomplete() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    let [ret, _entry] = trace_calls(&mut session, &target, WRITE);

    let pid = target.pid();
    with_call_in_progress(&target, || {
        session.detach(ret).unwrap();
        target.exit();
        assert_eq!(session.process_exited(pid), 1);
    });

    let (summary, outputs) = finish(session, &rx);
    let records = calls(&outputs);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].completion, Completion::Incomplete(IncompleteReason::Detached));
    assert_eq!(records[0].exit_payload, None);
    assert_eq!(records[0].entry_payload.0[0], 7);
    assert!(records[0].end >= records[0].start);
    assert_eq!(summary.stats.orphans, 0);
}

#[test]
fn test_process_exit_mid_call_reports_incomplete() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    trace_calls(&mut session, &target, WRITE);

    let pid = target.pid();
    with_call_in_progress(&target, || {
        target.exit();
        assert_eq!(session.process_exited(pid), 2);
    });

    assert_eq!(session.manager().live_count(), 0);
    let (summary, outputs) = finish(session, &rx);
    let records = calls(&outputs);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].completion, Completion::Incomplete(IncompleteReason::ProcessExit));
    assert_eq!(summary.stats.calls, 0);
    assert_eq!(summary.stats.incomplete, 1);
}

#[test]
fn test_return_without_entry_is_orphan() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    session.attach(spec(&target, WRITE, AttachKind::Return)).unwrap();

    // The entry probe arrives after this call was entered
    target.invoke(WRITE, &[1], || {
        let _entry = session.attach(spec(&target, WRITE, AttachKind::Entry)).unwrap();
        1
    });
    target.invoke(WRITE, &[2], || 2);

    let (summary, outputs) = finish(session, &rx);
    assert_eq!(summary.stats.orphans, 1);
    assert_eq!(summary.stats.calls, 1);

    let orphan = outputs.iter().find_map(|o| match o {
        Output::Diagnostic(Diagnostic::OrphanReturn { symbol, exit_payload, .. }) => Some((symbol, exit_payload)),
        _ => None,
    });
    let (symbol, exit_payload) = orphan.unwrap();
    assert_eq!(&**symbol, WRITE);
    assert_eq!(exit_payload.0[0], 1);
    assert_eq!(calls(&outputs)[0].entry_payload.0[0], 2);
}

#[test]
fn test_entry_only_reports_hits_until_detached() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    let entry = session.attach(spec(&target, READ, AttachKind::Entry)).unwrap();

    for n in 0..3 {
        target.invoke(READ, &[n], || 0);
    }
    session.detach(entry).unwrap();
    for n in 3..5 {
        target.invoke(READ, &[n], || 0);
    }

    let (summary, outputs) = finish(session, &rx);
    let words: Vec<u64> = hits(&outputs).iter().map(|h| h.payload.0[0]).collect();
    assert_eq!(words, vec![0, 1, 2]);
    assert!(calls(&outputs).is_empty());
    assert_eq!(summary.stats.hits, 3);
}

#[test]
fn test_overflow_drops_oldest_and_reports() {
    let mut h = harness(4);
    h.manager.attach(spec(&h.target, READ, AttachKind::Entry)).unwrap();

    // Nothing consumes yet: six of ten events must go
    for n in 0..10 {
        h.target.invoke(READ, &[n], || 0);
    }
    let (_target, session, rx) = start(h);

    let (summary, outputs) = finish(session, &rx);
    let words: Vec<u64> = hits(&outputs).iter().map(|h| h.payload.0[0]).collect();
    assert_eq!(words, vec![6, 7, 8, 9]);
    assert!(outputs.contains(&Output::Diagnostic(Diagnostic::EventsDropped { count: 6, total: 6 })));
    assert_eq!(summary.dropped, 6);
    assert_eq!(summary.stats.dropped, 6);
}

#[test]
fn test_attach_failures() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    let _entry = session.attach(spec(&target, WRITE, AttachKind::Entry)).unwrap();

    assert!(matches!(
        session.attach(spec(&target, WRITE, AttachKind::Entry)),
        Err(AttachError::AlreadyAttached { kind: AttachKind::Entry, .. })
    ));
    assert!(matches!(
        session.attach(spec(&target, "no_such_function", AttachKind::Entry)),
        Err(AttachError::Resolution(ResolutionError::SymbolNotFound { .. }))
    ));
    assert!(matches!(
        session.attach(ProbeSpec::new(Pid(u32::MAX - 1), WRITE, AttachKind::Entry)),
        Err(AttachError::NoSuchProcess(_))
    ));

    target.deny_instrumentation(true);
    assert!(matches!(
        session.attach(spec(&target, READ, AttachKind::Entry)),
        Err(AttachError::PermissionDenied { .. })
    ));
    target.deny_instrumentation(false);
    let _read = session.attach(spec(&target, READ, AttachKind::Entry)).unwrap();
    assert_eq!(session.manager().live_count(), 2);

    target.exit();
    assert!(matches!(
        session.attach(spec(&target, READ, AttachKind::Return)),
        Err(AttachError::NoSuchProcess(_))
    ));

    let (summary, outputs) = finish(session, &rx);
    assert!(outputs.is_empty());
    assert_eq!(summary.accepted, 0);
}

/// Call `symbol` from `threads` threads in a tight loop while `during` runs
fn under_load(target: &InProcessTarget, symbol: &str, threads: usize, during: impl FnOnce()) {
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    target.invoke(symbol, &[n], || n);
                    n += 1;
                }
            });
        }
        during();
        stop.store(true, Ordering::Relaxed);
    });
}

#[test]
fn test_denied_return_attach_leaves_entries_as_hits() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    let _entry = session.attach(spec(&target, WRITE, AttachKind::Entry)).unwrap();

    target.deny_instrumentation(true);
    under_load(&target, WRITE, 4, || {
        for _ in 0..5_000 {
            let err = session.attach(spec(&target, WRITE, AttachKind::Return)).unwrap_err();
            assert!(matches!(err, AttachError::PermissionDenied { .. }));
        }
    });

    let (summary, outputs) = finish(session, &rx);
    assert!(summary.stats.hits > 0);
    assert_eq!(summary.stats.incomplete, 0, "incomplete calls for a function never armed for returns");
    assert_eq!(summary.stats.calls, 0);
    assert!(calls(&outputs).is_empty());
}

#[test]
fn test_return_attach_under_load_never_strands_entries() {
    for _ in 0..20 {
        let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
        let _entry = session.attach(spec(&target, WRITE, AttachKind::Entry)).unwrap();

        under_load(&target, WRITE, 4, || {
            std::thread::sleep(Duration::from_millis(2));
            let _ret = session.attach(spec(&target, WRITE, AttachKind::Return)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        });

        // Every call has returned; only calls entered before arming may lack a pair
        let (summary, _) = finish(session, &rx);
        assert_eq!(summary.stats.incomplete, 0);
        assert!(summary.stats.calls > 0);
    }
}

#[test]
fn test_no_event_after_detach_returns() {
    let (target, mut session, rx) = start(harness(transport::DEFAULT_CAPACITY));
    let entry = session.attach(spec(&target, READ, AttachKind::Entry)).unwrap();

    let mut detached_at = None;
    under_load(&target, READ, 4, || {
        std::thread::sleep(Duration::from_millis(20));
        session.detach(entry).unwrap();
        detached_at = Some(Timestamp::now());
        std::thread::sleep(Duration::from_millis(10));
    });
    let detached_at = detached_at.unwrap();

    let (_, outputs) = finish(session, &rx);
    let fired = hits(&outputs);
    assert!(!fired.is_empty());
    for hit in fired {
        assert!(hit.at <= detached_at, "hit at {:?} after detach at {detached_at:?}", hit.at);
    }
}
