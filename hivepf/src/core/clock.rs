use std::sync::atomic::{AtomicU64, Ordering};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Monotonic nanosecond time source.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;

    fn now_secs(&self) -> u64 {
        self.now_ns() / NSEC_PER_SEC
    }
}

/// `CLOCK_MONOTONIC`, the same base `bpf_ktime_get_ns()` uses, so site timestamps
/// and user-space reads are directly comparable.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        (ts.tv_sec as u64)
            .wrapping_mul(NSEC_PER_SEC)
            .wrapping_add(ts.tv_nsec as u64)
    }
}

/// Hand-driven clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn advance_ns(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_ns(ms * 1_000_000);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}
