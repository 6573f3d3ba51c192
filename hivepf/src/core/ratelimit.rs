//! Windowed admission control.
//!
//! A limiter admits at most `burst` events per `interval`-second window and counts the
//! rest as missed. `admit` returns `true` when the caller should skip its work.
//!
//! Window rollover is not serialised against concurrent admits: a context racing the
//! rollover may have its admission counted in the window being discarded. That costs at
//! most a handful of extra admissions at a window edge.

use std::sync::atomic::{AtomicU64, Ordering};

use hivepf_common::RateLimitState;
use log::info;
use serde::Deserialize;
use thiserror::Error;

use super::channel::EventChannel;
use super::clock::Clock;
use crate::records::EmittedRecord;

const UNSET: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LimiterConfig {
    /// Window length in seconds.
    pub interval: u64,
    /// Admissions per window, 0 for unlimited.
    pub burst: u64,
    /// Missed-event ceiling that triggers a second notice, 0 to disable.
    #[serde(default)]
    pub max_burst: u64,
}

impl LimiterConfig {
    pub const fn new(interval: u64, burst: u64) -> Self {
        Self {
            interval,
            burst,
            max_burst: 0,
        }
    }

    pub const fn with_max_burst(mut self, max_burst: u64) -> Self {
        self.max_burst = max_burst;
        self
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::ZeroInterval {
                name: name.to_string(),
            });
        }
        if self.max_burst != 0 && self.max_burst < self.burst {
            return Err(ConfigError::MaxBurstBelowBurst {
                name: name.to_string(),
                burst: self.burst,
                max_burst: self.max_burst,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("limiter {name}: interval must be at least one second")]
    ZeroInterval { name: String },

    #[error("limiter {name}: max_burst {max_burst} is below burst {burst}")]
    MaxBurstBelowBurst {
        name: String,
        burst: u64,
        max_burst: u64,
    },

    #[error("limiter {0} is already registered")]
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Admitted,
    Limited { missed_before: u64 },
}

/// Atomic limiter cell. Field order mirrors [`RateLimitState`].
#[derive(Debug)]
pub(crate) struct LimiterState {
    interval: AtomicU64,
    window_start: AtomicU64,
    burst: AtomicU64,
    max_burst: AtomicU64,
    events: AtomicU64,
    missed: AtomicU64,
    total_events: AtomicU64,
    total_missed: AtomicU64,
    total_interval: AtomicU64,
}

impl LimiterState {
    /// A cell with no configuration yet; it admits everything until initialised.
    fn unconfigured() -> Self {
        Self {
            interval: AtomicU64::new(0),
            window_start: AtomicU64::new(UNSET),
            burst: AtomicU64::new(0),
            max_burst: AtomicU64::new(0),
            events: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            total_events: AtomicU64::new(0),
            total_missed: AtomicU64::new(0),
            total_interval: AtomicU64::new(0),
        }
    }

    fn configured(config: &LimiterConfig) -> Self {
        let state = Self::unconfigured();
        state.init_from(config);
        state
    }

    /// Copies the template in on first use. Concurrent initialisers write the same values.
    fn init_from(&self, config: &LimiterConfig) {
        self.burst.store(config.burst, Ordering::Relaxed);
        self.max_burst.store(config.max_burst, Ordering::Relaxed);
        self.interval.store(config.interval, Ordering::Release);
    }

    fn is_configured(&self) -> bool {
        self.interval.load(Ordering::Acquire) != 0
    }

    pub(crate) fn check(&self, now_secs: u64) -> Verdict {
        let interval = self.interval.load(Ordering::Acquire);
        if interval == 0 {
            return Verdict::Admitted;
        }

        let mut start = self.window_start.load(Ordering::Acquire);
        if start == UNSET {
            start = match self.window_start.compare_exchange(
                UNSET,
                now_secs,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => now_secs,
                Err(seen) => seen,
            };
        }

        if now_secs > start.saturating_add(interval)
            && self
                .window_start
                .compare_exchange(start, now_secs, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.total_interval
                .fetch_add(now_secs - start, Ordering::Relaxed);
            self.events.store(0, Ordering::Relaxed);
            self.missed.store(0, Ordering::Relaxed);
        }

        let burst = self.burst.load(Ordering::Relaxed);
        let admitted = burst == 0
            || self
                .events
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
                    (n < burst).then_some(n + 1)
                })
                .is_ok();

        if admitted {
            if burst == 0 {
                self.events.fetch_add(1, Ordering::Relaxed);
            }
            self.total_events.fetch_add(1, Ordering::Relaxed);
            return Verdict::Admitted;
        }

        let missed_before = self.missed.fetch_add(1, Ordering::Relaxed);
        self.total_missed.fetch_add(1, Ordering::Relaxed);
        Verdict::Limited { missed_before }
    }

    /// Whether a limited call should produce a breach notice: once when the window
    /// starts dropping, and on every drop past `max_burst - burst`.
    fn should_notify(&self, missed_before: u64) -> bool {
        if missed_before == 0 {
            return true;
        }
        let max_burst = self.max_burst.load(Ordering::Relaxed);
        let burst = self.burst.load(Ordering::Relaxed);
        max_burst > 0 && missed_before >= max_burst.saturating_sub(burst)
    }

    pub(crate) fn snapshot(&self) -> RateLimitState {
        let window_start = self.window_start.load(Ordering::Relaxed);
        RateLimitState {
            interval: self.interval.load(Ordering::Relaxed),
            window_start: if window_start == UNSET { 0 } else { window_start },
            burst: self.burst.load(Ordering::Relaxed),
            max_burst: self.max_burst.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            total_events: self.total_events.load(Ordering::Relaxed),
            total_missed: self.total_missed.load(Ordering::Relaxed),
            total_interval: self.total_interval.load(Ordering::Relaxed),
        }
    }
}

/// A single limiter with its own clock.
pub struct RateLimiter<C: Clock> {
    state: LimiterState,
    clock: C,
}

impl<C: Clock> RateLimiter<C> {
    pub fn new(name: &str, config: LimiterConfig, clock: C) -> Result<Self, ConfigError> {
        config.validate(name)?;
        Ok(Self {
            state: LimiterState::configured(&config),
            clock,
        })
    }

    /// `true` when the event is over the limit and should be skipped.
    pub fn admit(&self) -> bool {
        matches!(
            self.state.check(self.clock.now_secs()),
            Verdict::Limited { .. }
        )
    }

    pub fn snapshot(&self) -> RateLimitState {
        self.state.snapshot()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimiterId(u32);

impl LimiterId {
    pub fn index(self) -> u32 {
        self.0
    }
}

struct RegistryEntry {
    name: String,
    template: LimiterConfig,
    state: LimiterState,
}

/// Named limiters that report their own breaches through an [`EventChannel`].
///
/// Limiters are registered up front; the registry is then shared read-only and each
/// limiter cell is initialised from its template the first time it is consulted.
pub struct RateLimiterRegistry<C: Clock> {
    entries: Vec<RegistryEntry>,
    clock: C,
}

impl<C: Clock> RateLimiterRegistry<C> {
    pub fn new(clock: C) -> Self {
        Self {
            entries: Vec::new(),
            clock,
        }
    }

    pub fn register(&mut self, name: &str, config: LimiterConfig) -> Result<LimiterId, ConfigError> {
        config.validate(name)?;
        if self.lookup(name).is_some() {
            return Err(ConfigError::Duplicate(name.to_string()));
        }

        let id = LimiterId(self.entries.len() as u32);
        self.entries.push(RegistryEntry {
            name: name.to_string(),
            template: config,
            state: LimiterState::unconfigured(),
        });
        info!(
            "Registered limiter {} (interval={}s burst={} max_burst={})",
            name, config.interval, config.burst, config.max_burst
        );
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<LimiterId> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| LimiterId(i as u32))
    }

    /// `true` when the event is over the limit. The first drop of a window, and every
    /// drop past the `max_burst` ceiling, push a limiter-state record into
    /// `channel`. Unknown ids are never limited.
    pub fn admit(&self, id: LimiterId, channel: &EventChannel<EmittedRecord>) -> bool {
        let Some(entry) = self.entries.get(id.0 as usize) else {
            return false;
        };
        if !entry.state.is_configured() {
            entry.state.init_from(&entry.template);
        }

        match entry.state.check(self.clock.now_secs()) {
            Verdict::Admitted => false,
            Verdict::Limited { missed_before } => {
                if entry.state.should_notify(missed_before) {
                    channel.emit(EmittedRecord::RateLimit {
                        limiter: id.0,
                        state: entry.state.snapshot(),
                    });
                }
                true
            }
        }
    }

    pub fn snapshot(&self, id: LimiterId) -> Option<RateLimitState> {
        self.entries.get(id.0 as usize).map(|e| e.state.snapshot())
    }

    pub fn name(&self, id: LimiterId) -> Option<&str> {
        self.entries.get(id.0 as usize).map(|e| e.name.as_str())
    }

    pub fn snapshots(&self) -> impl Iterator<Item = (&str, RateLimitState)> + '_ {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.state.snapshot()))
    }
}
