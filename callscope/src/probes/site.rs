//! Probe state shared with firing contexts
//!
//! A [`ProbeSite`] is the only piece of a probe that a firing context ever
//! touches. Firing takes a [`FiringGuard`]; detaching deactivates the site
//! and waits until every guard is gone.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::domain::{AttachKind, FunctionId, Pid, ProbeId};

#[derive(Debug)]
pub struct ProbeSite {
    probe: ProbeId,
    function: FunctionId,
    kind: AttachKind,
    pid: Pid,
    symbol: Arc<str>,
    active: AtomicBool,
    in_flight: AtomicUsize,
}

impl ProbeSite {
    #[must_use]
    pub fn new(probe: ProbeId, function: FunctionId, kind: AttachKind, pid: Pid, symbol: Arc<str>) -> Self {
        Self {
            probe,
            function,
            kind,
            pid,
            symbol,
            active: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn probe(&self) -> ProbeId {
        self.probe
    }

    #[must_use]
    pub fn function(&self) -> FunctionId {
        self.function
    }

    #[must_use]
    pub fn kind(&self) -> AttachKind {
        self.kind
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn symbol(&self) -> &Arc<str> {
        &self.symbol
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Begin a firing, `None` once the site has been deactivated
    ///
    /// The in-flight count is raised before `active` is checked, so a
    /// concurrent [`quiesce`](Self::quiesce) either sees this firing or this
    /// firing sees the site inactive.
    pub fn enter(&self) -> Option<FiringGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.active.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(FiringGuard { site: self })
    }

    /// Deactivate and block until no firing holds a guard
    pub fn quiesce(&self) {
        self.active.store(false, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }

    /// Firings currently between `enter` and guard drop
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Proof that a firing is in progress on a site
#[must_use]
pub struct FiringGuard<'a> {
    site: &'a ProbeSite,
}

impl FiringGuard<'_> {
    #[must_use]
    pub fn site(&self) -> &ProbeSite {
        self.site
    }
}

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        self.site.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn site() -> Arc<ProbeSite> {
        Arc::new(ProbeSite::new(ProbeId(1), FunctionId(1), AttachKind::Entry, Pid(1), Arc::from("f")))
    }

    #[test]
    fn test_enter_counts_in_flight() {
        let site = site();
        let guard = site.enter().expect("active site");
        assert_eq!(site.in_flight(), 1);
        drop(guard);
        assert_eq!(site.in_flight(), 0);
    }

    #[test]
    fn test_enter_after_quiesce_is_refused() {
        let site = site();
        site.quiesce();
        assert!(!site.is_active());
        assert!(site.enter().is_none());
        assert_eq!(site.in_flight(), 0);
    }

    #[test]
    fn test_quiesce_waits_for_guard() {
        let site = site();
        let (entered_tx, entered_rx) = mpsc::channel();
        let holder = {
            let site = Arc::clone(&site);
            thread::spawn(move || {
                let _guard = site.enter().expect("active site");
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            })
        };

        entered_rx.recv().unwrap();
        let started = Instant::now();
        site.quiesce();
        assert!(started.elapsed() >= Duration::from_millis(30), "quiesce returned while a firing was in flight");
        assert_eq!(site.in_flight(), 0);
        holder.join().unwrap();
    }
}
