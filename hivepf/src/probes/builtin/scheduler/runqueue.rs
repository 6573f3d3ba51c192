//! Run-queue latency probe.
//!
//! The kernel side only stamps and forwards scheduler sites; correlation and
//! aggregation happen in [`SchedulerLatencyTracker`].

use std::sync::Arc;

use anyhow::{Context, Result};
use aya::Ebpf;
use aya::maps::Array;
use hivepf_common::{SchedEvent, TaskLayout};
use log::info;

use super::tracker::SchedulerLatencyTracker;
use crate::core::MonotonicClock;
use crate::probes::{
    Probe, TracepointConfig, attach_kprobe, attach_raw_tracepoint, attach_tracepoint,
    spawn_ringbuf_handler,
};
use crate::settings::TaskLayoutSettings;
use crate::telemetry;

pub struct RunqueueLatencyProbe {
    tracker: Arc<SchedulerLatencyTracker<MonotonicClock>>,
    layout: TaskLayoutSettings,
}

impl RunqueueLatencyProbe {
    pub fn new(
        tracker: Arc<SchedulerLatencyTracker<MonotonicClock>>,
        layout: TaskLayoutSettings,
    ) -> Self {
        Self { tracker, layout }
    }

    fn set_task_layout(&self, bpf: &mut Ebpf) -> Result<()> {
        let mut layout_map: Array<_, TaskLayout> = bpf
            .map_mut("TASK_LAYOUT")
            .context("Failed to find TASK_LAYOUT map")?
            .try_into()
            .context("TASK_LAYOUT is not an Array")?;

        layout_map.set(
            0,
            TaskLayout {
                pid_offset: self.layout.pid_offset,
                state_offset: self.layout.state_offset,
                group_offset: self.layout.group_offset,
                _pad: 0,
            },
            0,
        )?;
        info!(
            "Set task layout pid@{} state@{} sched_task_group@{}",
            self.layout.pid_offset, self.layout.state_offset, self.layout.group_offset
        );
        Ok(())
    }
}

impl Probe for RunqueueLatencyProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        self.set_task_layout(bpf)?;

        for (program_name, name) in [
            ("sched_wakeup", "sched_wakeup"),
            ("sched_wakeup_new", "sched_wakeup_new"),
            ("sched_process_exit", "sched_process_exit"),
        ] {
            attach_tracepoint(
                bpf,
                TracepointConfig {
                    program_name,
                    category: "sched",
                    name,
                },
            )?;
        }
        attach_raw_tracepoint(bpf, "sched_switch", "sched_switch")?;
        attach_kprobe(bpf, "sched_free_group", "sched_free_group", 0)?;

        let tracker = Arc::clone(&self.tracker);
        spawn_ringbuf_handler(bpf, "SCHED_EVENTS", move |event: SchedEvent| {
            tracker.handle(&event);
        })?;

        telemetry::record_active_probe("runqlat", 1);
        info!("RunqueueLatencyProbe attached");
        Ok(())
    }
}
