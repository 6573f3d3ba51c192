use anyhow::Result;
use aya::Ebpf;
use hivepf_common::HungTaskEvent;
use log::{debug, info};

use super::GatedEmitter;
use crate::core::MonotonicClock;
use crate::probes::{Probe, TracepointConfig, attach_tracepoint, spawn_ringbuf_handler};
use crate::records::{EmittedRecord, comm_str};
use crate::telemetry;

pub struct HungTaskProbe {
    gate: GatedEmitter<MonotonicClock>,
}

impl HungTaskProbe {
    pub fn new(gate: GatedEmitter<MonotonicClock>) -> Self {
        Self { gate }
    }
}

impl Probe for HungTaskProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        let attached = attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "sched_process_hang",
                category: "sched",
                name: "sched_process_hang",
            },
        )?;
        if !attached {
            return Ok(());
        }

        let gate = self.gate.clone();
        spawn_ringbuf_handler(bpf, "HUNGTASK_EVENTS", move |event: HungTaskEvent| {
            if !gate.emit(EmittedRecord::HungTask(event)) {
                debug!(
                    "HUNGTASK suppressed pid={} comm={}",
                    event.pid,
                    comm_str(&event.comm)
                );
            }
        })?;

        telemetry::record_active_probe("hungtask", 1);
        info!("HungTaskProbe attached");
        Ok(())
    }
}
