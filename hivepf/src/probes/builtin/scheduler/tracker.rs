//! Wake-to-run latency state machine.
//!
//! A thread's clock starts when it is woken (or preempted while still runnable) and
//! stops when it is switched in. The span lands in the histogram of the thread's
//! scheduling group and in the global record. Every lookup failure is a skipped
//! sample.

use std::time::Duration;

use hivepf_common::{
    LatencyStat, NSEC_PER_MSEC, RunqueueSample, SchedEvent, SchedEventKind, TASK_RUNNING,
};

use crate::core::{
    Clock, ConfigError, EventChannel, HistogramAggregator, LatencyCorrelator, LimiterConfig,
    RateLimiter, SwitchKind,
};
use crate::records::EmittedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub correlation_capacity: usize,
    pub entity_capacity: usize,
    /// Global record shards, normally the number of possible CPUs.
    pub shards: usize,
    /// Wakeups at or above this latency are also emitted individually.
    pub slow_threshold_ns: u64,
    pub sample_limit: LimiterConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            correlation_capacity: 10_000,
            entity_capacity: 10_000,
            shards: 1,
            slow_threshold_ns: 10 * NSEC_PER_MSEC,
            sample_limit: LimiterConfig::new(1, 100),
        }
    }
}

pub struct SchedulerLatencyTracker<C: Clock + Clone> {
    correlator: LatencyCorrelator<C>,
    histograms: HistogramAggregator,
    sample_limiter: RateLimiter<C>,
    slow_threshold_ns: u64,
    channel: EventChannel<EmittedRecord>,
}

impl<C: Clock + Clone> SchedulerLatencyTracker<C> {
    pub fn new(
        config: TrackerConfig,
        clock: C,
        channel: EventChannel<EmittedRecord>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            correlator: LatencyCorrelator::new(config.correlation_capacity, clock.clone()),
            histograms: HistogramAggregator::new(config.entity_capacity, config.shards),
            sample_limiter: RateLimiter::new("runqlat_sample", config.sample_limit, clock)?,
            slow_threshold_ns: config.slow_threshold_ns,
            channel,
        })
    }

    /// Dispatches a raw site event. Unknown kinds are ignored.
    pub fn handle(&self, event: &SchedEvent) {
        match SchedEventKind::try_from(event.kind) {
            Ok(SchedEventKind::Wakeup) => self.on_wakeup(event.next_pid, event.timestamp),
            Ok(SchedEventKind::Switch) => self.on_switch(event),
            Ok(SchedEventKind::Exit) => self.on_exit(event.prev_pid),
            Ok(SchedEventKind::GroupFree) => self.on_group_destroyed(event.prev_group),
            Err(_) => {}
        }
    }

    /// `pid` was enqueued. A repeated wakeup only refreshes the start time.
    pub fn on_wakeup(&self, pid: u32, ts_ns: u64) {
        if pid == 0 {
            return;
        }
        self.correlator.begin_at(pid as u64, ts_ns);
    }

    pub fn on_switch(&self, ev: &SchedEvent) {
        let kind = if ev.prev_state == TASK_RUNNING {
            // preempted while runnable: it is queued again from now
            if ev.prev_pid != 0 {
                self.correlator.begin_at(ev.prev_pid as u64, ev.timestamp);
            }
            SwitchKind::Involuntary
        } else {
            SwitchKind::Voluntary
        };

        if ev.prev_group != 0 && ev.prev_pid != 0 {
            self.histograms.record_switch(ev.cpu, ev.prev_group, kind);
        }

        if ev.next_pid == 0 {
            return;
        }
        let next = ev.next_pid as u64;
        let Some(latency) = self.correlator.end_at(next, ev.timestamp) else {
            return;
        };
        self.correlator.destroy(next);

        if ev.next_group != 0 {
            self.histograms.observe_on(ev.cpu, ev.next_group, latency);
        }
        self.maybe_emit_sample(ev, latency);
    }

    /// Reaps the correlation slot of an exiting thread, queued or not.
    pub fn on_exit(&self, pid: u32) {
        self.correlator.destroy(pid as u64);
    }

    pub fn on_group_destroyed(&self, group: u64) {
        self.histograms.delete(group);
    }

    fn maybe_emit_sample(&self, ev: &SchedEvent, latency: Duration) {
        let latency_ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        if latency_ns < self.slow_threshold_ns || self.sample_limiter.admit() {
            return;
        }
        self.channel.emit(EmittedRecord::RunqueueSample(RunqueueSample {
            pid: ev.next_pid,
            cpu: ev.cpu,
            latency_ns,
            group: ev.next_group,
        }));
    }

    pub fn global(&self) -> LatencyStat {
        self.histograms.global()
    }

    pub fn group(&self, group: u64) -> Option<LatencyStat> {
        self.histograms.get(group)
    }

    pub fn groups(&self) -> Vec<(u64, LatencyStat)> {
        self.histograms.entities()
    }

    /// Threads with a live correlation slot.
    pub fn queued(&self) -> usize {
        self.correlator.len()
    }

    pub fn is_queued(&self, pid: u32) -> bool {
        self.correlator.contains(pid as u64)
    }

    pub fn correlator(&self) -> &LatencyCorrelator<C> {
        &self.correlator
    }

    pub fn histograms(&self) -> &HistogramAggregator {
        &self.histograms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use std::sync::Arc;

    const MS: u64 = NSEC_PER_MSEC;
    const GROUP_A: u64 = 0xffff_8880_0000_1000;
    const GROUP_B: u64 = 0xffff_8880_0000_2000;
    const TASK_INTERRUPTIBLE: u64 = 1;

    fn tracker() -> (
        SchedulerLatencyTracker<Arc<ManualClock>>,
        EventChannel<EmittedRecord>,
    ) {
        let channel = EventChannel::with_capacity(64);
        let clock = Arc::new(ManualClock::new(1_000 * 1_000_000_000));
        let tracker = SchedulerLatencyTracker::new(
            TrackerConfig {
                shards: 2,
                ..Default::default()
            },
            clock,
            channel.clone(),
        )
        .unwrap();
        (tracker, channel)
    }

    fn switch(prev: (u32, u64, u64), next: (u32, u64), ts: u64) -> SchedEvent {
        SchedEvent {
            kind: SchedEventKind::Switch as u32,
            cpu: 1,
            prev_pid: prev.0,
            prev_state: prev.1,
            prev_group: prev.2,
            next_pid: next.0,
            next_group: next.1,
            timestamp: ts,
        }
    }

    #[test]
    fn test_wakeup_then_switch_records_latency() {
        let (tracker, _) = tracker();
        tracker.on_wakeup(42, 100 * MS);
        tracker.on_switch(&switch((7, TASK_INTERRUPTIBLE, GROUP_B), (42, GROUP_A), 112 * MS));

        assert_eq!(tracker.group(GROUP_A).unwrap().nlat, [0, 1, 0, 0]);
        assert_eq!(tracker.group(GROUP_B).unwrap().nvcsw, 1);
        let global = tracker.global();
        assert_eq!(global.nlat, [0, 1, 0, 0]);
        assert_eq!(global.nvcsw, 1);
        assert!(!tracker.is_queued(42));
    }

    #[test]
    fn test_preempted_task_is_requeued() {
        let (tracker, _) = tracker();
        tracker.on_switch(&switch((5, TASK_RUNNING, GROUP_A), (9, GROUP_A), 10 * MS));
        assert!(tracker.is_queued(5));
        assert_eq!(tracker.group(GROUP_A).unwrap().nivcsw, 1);

        tracker.on_switch(&switch((9, TASK_INTERRUPTIBLE, GROUP_A), (5, GROUP_A), 65 * MS));
        let stat = tracker.group(GROUP_A).unwrap();
        assert_eq!(stat.nlat, [0, 0, 0, 1]);
        assert_eq!((stat.nvcsw, stat.nivcsw), (1, 1));
    }

    #[test]
    fn test_missed_enqueue_and_idle_are_skipped() {
        let (tracker, _) = tracker();
        tracker.on_switch(&switch((3, TASK_INTERRUPTIBLE, GROUP_A), (4, GROUP_A), MS));
        tracker.on_switch(&switch((4, TASK_INTERRUPTIBLE, GROUP_A), (0, 0), 2 * MS));
        assert_eq!(tracker.global().total_samples(), 0);
        assert_eq!(tracker.global().nvcsw, 2);
    }

    #[test]
    fn test_idle_prev_is_not_counted() {
        let (tracker, _) = tracker();
        tracker.on_switch(&switch((0, TASK_RUNNING, GROUP_A), (0, 0), MS));
        assert_eq!(tracker.global(), LatencyStat::default());
        assert_eq!(tracker.queued(), 0);
    }

    #[test]
    fn test_exit_reaps_queued_thread() {
        let (tracker, _) = tracker();
        tracker.on_wakeup(11, MS);
        assert_eq!(tracker.queued(), 1);
        tracker.handle(&SchedEvent {
            kind: SchedEventKind::Exit as u32,
            prev_pid: 11,
            ..Default::default()
        });
        assert_eq!(tracker.queued(), 0);
        // exit of a thread never seen is harmless
        tracker.on_exit(12);
    }

    #[test]
    fn test_group_free_deletes_record() {
        let (tracker, _) = tracker();
        tracker.on_wakeup(1, MS);
        tracker.on_switch(&switch((2, TASK_INTERRUPTIBLE, GROUP_A), (1, GROUP_A), 3 * MS));
        assert!(tracker.group(GROUP_A).is_some());

        tracker.handle(&SchedEvent {
            kind: SchedEventKind::GroupFree as u32,
            prev_group: GROUP_A,
            ..Default::default()
        });
        assert!(tracker.group(GROUP_A).is_none());
        assert_eq!(tracker.global().nlat[0], 1);
    }

    #[test]
    fn test_slow_wakeups_are_emitted() {
        let (tracker, channel) = tracker();
        tracker.on_wakeup(20, MS);
        tracker.on_switch(&switch((1, TASK_INTERRUPTIBLE, GROUP_A), (20, GROUP_B), 31 * MS));
        tracker.on_wakeup(21, MS);
        tracker.on_switch(&switch((20, TASK_INTERRUPTIBLE, GROUP_B), (21, GROUP_B), 2 * MS));

        assert_eq!(channel.len(), 1);
        match channel.try_recv() {
            Some(EmittedRecord::RunqueueSample(s)) => {
                assert_eq!(s.pid, 20);
                assert_eq!(s.latency_ns, 30 * MS);
                assert_eq!(s.group, GROUP_B);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_kind_is_ignored() {
        let (tracker, _) = tracker();
        tracker.handle(&SchedEvent {
            kind: 99,
            next_pid: 5,
            ..Default::default()
        });
        assert_eq!(tracker.queued(), 0);
    }
}
