//! # Transport Buffer
//!
//! Bounded multi-producer / single-consumer hand-off between firing
//! contexts and the correlator.
//!
//! ## Lanes
//!
//! - **Events**: fixed-capacity `ArrayQueue`. A push into a full queue evicts
//!   the oldest event (`force_push`) and counts exactly one drop. Producers
//!   never block and never allocate.
//! - **Notices**: unbounded `SegQueue`, never dropped. Only the probe
//!   manager writes here, never a firing context.
//!
//! Every message takes a number from one global sequence. [`Drain::next`]
//! merges the two lanes by that number, so a detach notice is seen after
//! every event its probe produced and an attach notice before the first.
//!
//! ## Wake-ups
//!
//! The consumer parks on a `crossbeam-utils` `Parker`; producers unpark it
//! after each push. Unparking only takes a lock when the consumer is
//! actually parked.

use crossbeam_queue::{ArrayQueue, SegQueue};
use crossbeam_utils::sync::{Parker, Unparker};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::events::{Event, Message, Notice};

/// Default event capacity
pub const DEFAULT_CAPACITY: usize = 4096;

struct Sequenced<T> {
    seq: u64,
    item: T,
}

/// Producer side, shared by every firing context
pub struct TransportBuffer {
    events: ArrayQueue<Sequenced<Event>>,
    notices: SegQueue<Sequenced<Notice>>,
    seq: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    waker: Unparker,
}

/// Create a buffer holding at most `capacity` events (minimum 1)
#[must_use]
pub fn bounded(capacity: usize) -> (Arc<TransportBuffer>, Drain) {
    let parker = Parker::new();
    let buffer = Arc::new(TransportBuffer {
        events: ArrayQueue::new(capacity.max(1)),
        notices: SegQueue::new(),
        seq: AtomicU64::new(0),
        accepted: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        waker: parker.unparker().clone(),
    });
    let drain = Drain { buffer: Arc::clone(&buffer), parker, held_event: None, held_notice: None };
    (buffer, drain)
}

impl TransportBuffer {
    /// Enqueue an event, evicting the oldest one when full
    ///
    /// Returns `false` when an older event was dropped to make room.
    pub fn push(&self, event: Event) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        let evicted = self.events.force_push(Sequenced { seq, item: event });
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.waker.unpark();
        evicted.is_none()
    }

    /// Enqueue a notice; notices are never dropped
    pub fn announce(&self, notice: Notice) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        self.notices.push(Sequenced { seq, item: notice });
        self.waker.unpark();
    }

    /// Account for events lost before they reached this buffer
    /// (kernel ring buffer overflow)
    pub fn count_upstream_drops(&self, count: u64) {
        if count > 0 {
            self.dropped.fetch_add(count, Ordering::Relaxed);
            self.waker.unpark();
        }
    }

    /// Events dropped so far, here or upstream
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events pushed so far, including ones later evicted
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Events currently queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.notices.is_empty()
    }

    /// Signal the consumer that no more messages will be produced
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waker.unpark();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Consumer side. Not `Clone`: exactly one correlator drains a buffer.
pub struct Drain {
    buffer: Arc<TransportBuffer>,
    parker: Parker,
    held_event: Option<Sequenced<Event>>,
    held_notice: Option<Sequenced<Notice>>,
}

impl Drain {
    /// Next message in sequence order, `None` when both lanes are empty
    pub fn next(&mut self) -> Option<Message> {
        // Events first: a notice published before an event was pushed is
        // guaranteed visible once that event has been popped.
        if self.held_event.is_none() {
            self.held_event = self.buffer.events.pop();
        }
        if self.held_notice.is_none() {
            self.held_notice = self.buffer.notices.pop();
        }

        let take_notice = match (&self.held_event, &self.held_notice) {
            (Some(event), Some(notice)) => notice.seq < event.seq,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => return None,
        };

        if take_notice {
            self.held_notice.take().map(|n| Message::Notice(n.item))
        } else {
            self.held_event.take().map(|e| Message::Event(e.item))
        }
    }

    /// Park until a producer pushes, the buffer closes, or `timeout` passes
    pub fn wait(&self, timeout: Duration) {
        if self.buffer.is_empty() && !self.buffer.is_closed() {
            self.parker.park_timeout(timeout);
        }
    }

    /// Closed and fully drained
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.buffer.is_closed()
            && self.held_event.is_none()
            && self.held_notice.is_none()
            && self.buffer.is_empty()
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<TransportBuffer> {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttachKind, FunctionId, Payload, Pid, ProbeId, Tid, Timestamp};
    use std::thread;

    fn event(probe: u32, ts: u64) -> Event {
        Event {
            probe: ProbeId(probe),
            function: FunctionId(1),
            pid: Pid(10),
            tid: Tid(11),
            timestamp: Timestamp(ts),
            kind: AttachKind::Entry,
            payload: Payload::default(),
        }
    }

    fn next_event(drain: &mut Drain) -> Option<Event> {
        match drain.next()? {
            Message::Event(e) => Some(e),
            Message::Notice(n) => panic!("unexpected notice {n:?}"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let (buffer, mut drain) = bounded(8);
        for ts in 0..5 {
            assert!(buffer.push(event(1, ts)));
        }
        for ts in 0..5 {
            assert_eq!(next_event(&mut drain).unwrap().timestamp, Timestamp(ts));
        }
        assert!(drain.next().is_none());
    }

    #[test]
    fn test_full_buffer_drops_oldest_and_counts() {
        let (buffer, mut drain) = bounded(4);
        let mut evictions = 0;
        for ts in 0..10 {
            if !buffer.push(event(1, ts)) {
                evictions += 1;
            }
        }

        assert_eq!(evictions, 6);
        assert_eq!(buffer.dropped(), 6);
        assert_eq!(buffer.accepted(), 10);

        // The newest four survive
        let kept: Vec<u64> = std::iter::from_fn(|| next_event(&mut drain)).map(|e| e.timestamp.0).collect();
        assert_eq!(kept, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (buffer, _drain) = bounded(0);
        assert_eq!(buffer.capacity(), 1);
    }

    #[test]
    fn test_notices_merge_by_sequence() {
        let (buffer, mut drain) = bounded(8);
        buffer.push(event(1, 1));
        buffer.announce(Notice::ProcessExited { pid: Pid(10), at: Timestamp(2) });
        buffer.push(event(1, 3));

        assert!(matches!(drain.next(), Some(Message::Event(e)) if e.timestamp == Timestamp(1)));
        assert!(matches!(drain.next(), Some(Message::Notice(Notice::ProcessExited { .. }))));
        assert!(matches!(drain.next(), Some(Message::Event(e)) if e.timestamp == Timestamp(3)));
        assert!(drain.next().is_none());
    }

    #[test]
    fn test_notices_survive_event_overflow() {
        let (buffer, mut drain) = bounded(1);
        buffer.announce(Notice::ProcessExited { pid: Pid(1), at: Timestamp(0) });
        for ts in 0..3 {
            buffer.push(event(1, ts));
        }
        assert!(matches!(drain.next(), Some(Message::Notice(_))));
        assert_eq!(next_event(&mut drain).unwrap().timestamp, Timestamp(2));
        assert_eq!(buffer.dropped(), 2);
    }

    #[test]
    fn test_upstream_drops_are_added() {
        let (buffer, _drain) = bounded(4);
        buffer.count_upstream_drops(0);
        buffer.count_upstream_drops(3);
        assert_eq!(buffer.dropped(), 3);
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_fifo() {
        let (buffer, mut drain) = bounded(4096);
        let handles: Vec<_> = (0..4u32)
            .map(|producer| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for ts in 0..500 {
                        buffer.push(event(producer, ts));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = [None::<u64>; 4];
        let mut total = 0;
        while let Some(e) = next_event(&mut drain) {
            let slot = &mut last[e.probe.0 as usize];
            assert!(slot.map_or(true, |prev| e.timestamp.0 > prev), "producer order violated");
            *slot = Some(e.timestamp.0);
            total += 1;
        }
        assert_eq!(total, 2000);
        assert_eq!(buffer.dropped(), 0);
    }

    #[test]
    fn test_overflow_accounting_under_contention() {
        const PRODUCERS: u32 = 4;
        const PUSHES: u64 = 50_000;

        let (buffer, mut drain) = bounded(8);
        let consumer = thread::spawn(move || {
            let mut consumed = 0u64;
            while !drain.is_finished() {
                match drain.next() {
                    Some(_) => consumed += 1,
                    None => drain.wait(Duration::from_millis(1)),
                }
            }
            consumed
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for ts in 0..PUSHES {
                        buffer.push(event(producer, ts));
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }
        buffer.close();
        let consumed = consumer.join().unwrap();

        // Every push is either delivered or evicted, never both
        assert_eq!(buffer.accepted(), u64::from(PRODUCERS) * PUSHES);
        assert_eq!(consumed + buffer.dropped(), buffer.accepted());
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let (buffer, mut drain) = bounded(4);
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.push(event(1, 1));
            })
        };

        let started = std::time::Instant::now();
        while drain.next().is_none() {
            drain.wait(Duration::from_secs(5));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        producer.join().unwrap();
    }

    #[test]
    fn test_finished_after_close_and_drain() {
        let (buffer, mut drain) = bounded(4);
        buffer.push(event(1, 1));
        buffer.close();
        assert!(!drain.is_finished());
        assert!(drain.next().is_some());
        assert!(drain.is_finished());
    }
}
