//! Process-wide counters and gauges.
//!
//! These are plain atomics rather than tacho instruments because their
//! values are part of the monitor's contract: the fetch counters and the
//! timer-failure count are readable in-process at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering, ATOMIC_USIZE_INIT};

/// A monotonically increasing counter.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Counter {
        Counter::default()
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst) as u64
    }
}

/// A gauge that may rise and fall.
#[derive(Clone, Debug, Default)]
pub struct Gauge(Arc<AtomicUsize>);

impl Gauge {
    pub fn new() -> Gauge {
        Gauge::default()
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst) as u64
    }
}

/// The fetch bookkeeping shared by every fetcher in the process.
///
/// `pending` is incremented when a fetch begins and decremented when its
/// handler has been invoked, regardless of outcome.
#[derive(Clone, Debug, Default)]
pub struct Counters {
    pub success: Counter,
    pub fail: Counter,
    pub pending: Gauge,
}

impl Counters {
    pub fn new() -> Counters {
        Counters::default()
    }
}

static POLL_NUM: AtomicUsize = ATOMIC_USIZE_INIT;

/// Returns the next process-wide poll id. Never resets.
pub fn next_poll_id() -> u64 {
    POLL_NUM.fetch_add(1, Ordering::SeqCst) as u64 + 1
}

#[test]
fn counters_count() {
    let c = Counters::new();
    c.success.incr();
    c.success.incr();
    c.fail.incr();
    c.pending.incr();
    c.pending.incr();
    c.pending.decr();
    assert_eq!(c.success.get(), 2);
    assert_eq!(c.fail.get(), 1);
    assert_eq!(c.pending.get(), 1);
}

#[test]
fn poll_ids_strictly_increase() {
    let a = next_poll_id();
    let b = next_poll_id();
    let c = next_poll_id();
    assert!(a < b && b < c);
}
