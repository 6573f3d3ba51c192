use anyhow::Result;
use aya::Ebpf;
use hivepf_common::SoftlockupEvent;
use log::{debug, info};

use super::GatedEmitter;
use crate::core::MonotonicClock;
use crate::probes::{Probe, attach_kprobe, spawn_ringbuf_handler};
use crate::records::{EmittedRecord, comm_str};
use crate::telemetry;

/// Offset into `watchdog_timer_fn` of the soft-lockup report path.
pub const DEFAULT_WATCHDOG_OFFSET: u64 = 442;

pub struct SoftlockupProbe {
    gate: GatedEmitter<MonotonicClock>,
    offset: u64,
}

impl SoftlockupProbe {
    pub fn new(gate: GatedEmitter<MonotonicClock>, offset: Option<u64>) -> Self {
        Self {
            gate,
            offset: offset.unwrap_or(DEFAULT_WATCHDOG_OFFSET),
        }
    }
}

impl Probe for SoftlockupProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        attach_kprobe(bpf, "watchdog_timer_fn", "watchdog_timer_fn", self.offset)?;

        let gate = self.gate.clone();
        spawn_ringbuf_handler(bpf, "SOFTLOCKUP_EVENTS", move |event: SoftlockupEvent| {
            if !gate.emit(EmittedRecord::Softlockup(event)) {
                debug!(
                    "SOFTLOCKUP suppressed cpu={} pid={} comm={}",
                    event.cpu,
                    event.pid,
                    comm_str(&event.comm)
                );
            }
        })?;

        telemetry::record_active_probe("softlockup", 1);
        info!("SoftlockupProbe attached (watchdog_timer_fn+{})", self.offset);
        Ok(())
    }
}
