//! Hung-task and softlockup notices, gated by a shared notifying limiter.

use std::sync::Arc;

use crate::core::{Clock, EventChannel, LimiterId, RateLimiterRegistry};
use crate::records::EmittedRecord;

pub mod hungtask;
pub mod softlockup;

pub use hungtask::HungTaskProbe;
pub use softlockup::SoftlockupProbe;

/// Limiter slot plus the channel its records and breach notices go to.
#[derive(Clone)]
pub struct GatedEmitter<C: Clock> {
    limiters: Arc<RateLimiterRegistry<C>>,
    limiter: LimiterId,
    channel: EventChannel<EmittedRecord>,
}

impl<C: Clock> GatedEmitter<C> {
    pub fn new(
        limiters: Arc<RateLimiterRegistry<C>>,
        limiter: LimiterId,
        channel: EventChannel<EmittedRecord>,
    ) -> Self {
        Self {
            limiters,
            limiter,
            channel,
        }
    }

    /// Emits `record` unless the limiter is over its burst. Returns whether it was sent.
    pub fn emit(&self, record: EmittedRecord) -> bool {
        if self.limiters.admit(self.limiter, &self.channel) {
            return false;
        }
        self.channel.emit(record);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LimiterConfig, ManualClock};
    use crate::records::comm_bytes;
    use hivepf_common::HungTaskEvent;

    #[test]
    fn test_gate_suppresses_past_burst_with_one_notice() {
        let clock = Arc::new(ManualClock::new(7 * 1_000_000_000));
        let channel = EventChannel::with_capacity(64);
        let mut registry = RateLimiterRegistry::new(clock);
        let id = registry.register("hungtask", LimiterConfig::new(1, 3)).unwrap();
        let gate = GatedEmitter::new(Arc::new(registry), id, channel.clone());

        let sent = (0..10)
            .filter(|i| {
                gate.emit(EmittedRecord::HungTask(HungTaskEvent {
                    pid: *i,
                    comm: comm_bytes("khungtaskd"),
                }))
            })
            .count();
        assert_eq!(sent, 3);

        let records = channel.drain(64);
        let notices = records
            .iter()
            .filter(|r| matches!(r, EmittedRecord::RateLimit { .. }))
            .count();
        assert_eq!(notices, 1);
        assert_eq!(records.len(), 4);
    }
}
