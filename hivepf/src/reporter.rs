//! Periodic histogram and limiter snapshots.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hivepf_common::{LatencyStat, RateLimitState};
use log::{debug, info};

use crate::core::{ChannelStats, Clock, EventChannel, RateLimiterRegistry};
use crate::probes::builtin::SchedulerLatencyTracker;
use crate::probes::shutdown_flag;
use crate::records::EmittedRecord;
use crate::telemetry;

/// Everything the reporter reads in one pass.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub global: Option<LatencyStat>,
    pub groups: Vec<(u64, LatencyStat)>,
    pub limiters: Vec<(String, RateLimitState)>,
    pub channel: ChannelStats,
}

pub struct Reporter<C: Clock + Clone> {
    tracker: Option<Arc<SchedulerLatencyTracker<C>>>,
    limiters: Arc<RateLimiterRegistry<C>>,
    channel: EventChannel<EmittedRecord>,
}

impl<C: Clock + Clone> Reporter<C> {
    pub fn new(
        tracker: Option<Arc<SchedulerLatencyTracker<C>>>,
        limiters: Arc<RateLimiterRegistry<C>>,
        channel: EventChannel<EmittedRecord>,
    ) -> Self {
        Self {
            tracker,
            limiters,
            channel,
        }
    }

    /// Reads every record once and publishes the figures to telemetry.
    pub fn collect(&self) -> Report {
        let (global, groups) = match &self.tracker {
            Some(t) => (Some(t.global()), t.groups()),
            None => (None, Vec::new()),
        };
        let limiters: Vec<_> = self
            .limiters
            .snapshots()
            .map(|(name, state)| (name.to_string(), state))
            .collect();
        let channel = self.channel.stats();

        if let Some(global) = global {
            telemetry::publish_runqlat(global, groups.clone());
        }
        for (name, state) in &limiters {
            telemetry::publish_limiter(name, *state);
        }
        telemetry::publish_channel(channel);

        Report {
            global,
            groups,
            limiters,
            channel,
        }
    }

    fn log(report: &Report) {
        if let Some(g) = report.global {
            info!(
                "RUNQLAT global nvcsw={} nivcsw={} lat=[{} {} {} {}] groups={}",
                g.nvcsw,
                g.nivcsw,
                g.nlat[0],
                g.nlat[1],
                g.nlat[2],
                g.nlat[3],
                report.groups.len()
            );
        }
        for (group, s) in &report.groups {
            debug!(
                "RUNQLAT group={:#x} nvcsw={} nivcsw={} lat=[{} {} {} {}]",
                group, s.nvcsw, s.nivcsw, s.nlat[0], s.nlat[1], s.nlat[2], s.nlat[3]
            );
        }
        if report.channel.dropped > 0 {
            info!(
                "Channel emitted={} consumed={} dropped={}",
                report.channel.emitted, report.channel.consumed, report.channel.dropped
            );
        }
    }

    pub async fn run(self, period: Duration) {
        let shutdown = shutdown_flag();
        let mut ticker = tokio::time::interval(period);
        while !shutdown.load(Ordering::Relaxed) {
            ticker.tick().await;
            Self::log(&self.collect());
        }
    }
}
