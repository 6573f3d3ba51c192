//! Drains the event channel: logs each record, optionally appends its frame to a file,
//! and keeps per-kind counts.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use hivepf_common::DropKind;
use log::{info, warn};

use crate::core::EventChannel;
use crate::probes::{POLL_INTERVAL_MS, shutdown_flag};
use crate::records::{EmittedRecord, RecordKind, comm_str};
use crate::telemetry;

pub const BATCH_SIZE: usize = 256;

pub struct RecordConsumer {
    channel: EventChannel<EmittedRecord>,
    limiter_names: Vec<String>,
    output: Option<BufWriter<File>>,
    scratch: BytesMut,
    counts: HashMap<RecordKind, u64>,
}

impl RecordConsumer {
    /// `limiter_names[i]` names the limiter with registry index `i` in breach notices.
    pub fn new(channel: EventChannel<EmittedRecord>, limiter_names: Vec<String>) -> Self {
        Self {
            channel,
            limiter_names,
            output: None,
            scratch: BytesMut::new(),
            counts: HashMap::new(),
        }
    }

    /// Appends every consumed frame to `path`.
    pub fn with_output(mut self, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open record output {}", path.display()))?;
        info!("Writing records to {}", path.display());
        self.output = Some(BufWriter::new(file));
        Ok(self)
    }

    /// Processes one batch. Returns the number of records consumed.
    pub fn poll(&mut self) -> Result<usize> {
        let batch = self.channel.drain(BATCH_SIZE);
        if batch.is_empty() {
            return Ok(0);
        }

        let mut per_kind: HashMap<RecordKind, u64> = HashMap::new();
        for record in &batch {
            self.log_record(record);
            *per_kind.entry(record.kind()).or_default() += 1;
            if let Some(out) = self.output.as_mut() {
                self.scratch.clear();
                record.encode(&mut self.scratch);
                out.write_all(&self.scratch)
                    .context("Failed to write record frame")?;
            }
        }
        if let Some(out) = self.output.as_mut() {
            out.flush().context("Failed to flush record output")?;
        }

        for (kind, n) in per_kind {
            *self.counts.entry(kind).or_default() += n;
            telemetry::record_consumed(kind, n);
        }
        Ok(batch.len())
    }

    pub fn count(&self, kind: RecordKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    fn log_record(&self, record: &EmittedRecord) {
        match record {
            EmittedRecord::RateLimit { limiter, state } => {
                let name = self
                    .limiter_names
                    .get(*limiter as usize)
                    .map(String::as_str)
                    .unwrap_or("unknown");
                warn!(
                    "RATELIMIT limiter={} burst={} events={} missed={} total_events={} total_missed={}",
                    name,
                    state.burst,
                    state.events,
                    state.missed,
                    state.total_events,
                    state.total_missed,
                );
            }
            EmittedRecord::Softlockup(ev) => warn!(
                "SOFTLOCKUP cpu={} pid={} comm={}",
                ev.cpu,
                ev.pid,
                comm_str(&ev.comm)
            ),
            EmittedRecord::HungTask(ev) => {
                warn!("HUNGTASK pid={} comm={}", ev.pid, comm_str(&ev.comm))
            }
            EmittedRecord::DropWatch(ev) => info!(
                "DROPWATCH kind={} pid={} comm={} {}:{} -> {}:{} len={} state={} stack_depth={}",
                drop_kind_str(ev.kind),
                ev.tgid_pid & 0xffff_ffff,
                comm_str(&ev.comm),
                std::net::Ipv4Addr::from(u32::from_be(ev.saddr)),
                ev.sport,
                std::net::Ipv4Addr::from(u32::from_be(ev.daddr)),
                ev.dport,
                ev.pkt_len,
                ev.state,
                ev.stack_depth(),
            ),
            EmittedRecord::RunqueueSample(s) => info!(
                "RUNQUEUE_LATENCY pid={} cpu={} latency={}ms group={:#x}",
                s.pid,
                s.cpu,
                s.latency_ns / 1_000_000,
                s.group,
            ),
        }
    }

    /// Polls until shutdown is requested, then drains what is left.
    pub fn run(mut self) -> Result<()> {
        let shutdown = shutdown_flag();
        while !shutdown.load(Ordering::Relaxed) {
            if self.poll()? == 0 {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
        while self.poll()? > 0 {}

        let summary: Vec<String> = RecordKind::ALL
            .iter()
            .map(|k| format!("{}={}", k.as_str(), self.count(*k)))
            .collect();
        info!(
            "Consumer stopped: {} dropped={}",
            summary.join(" "),
            self.channel.stats().dropped
        );
        Ok(())
    }
}

fn drop_kind_str(kind: u8) -> &'static str {
    DropKind::try_from(kind)
        .map(DropKind::as_str)
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::comm_bytes;
    use hivepf_common::{HungTaskEvent, RateLimitState, RunqueueSample};

    fn hang(pid: u32) -> EmittedRecord {
        EmittedRecord::HungTask(HungTaskEvent {
            pid,
            comm: comm_bytes("dd"),
        })
    }

    #[test]
    fn test_poll_counts_by_kind() {
        let channel = EventChannel::with_capacity(16);
        channel.emit(hang(1));
        channel.emit(hang(2));
        channel.emit(EmittedRecord::RateLimit {
            limiter: 0,
            state: RateLimitState::default(),
        });
        channel.emit(EmittedRecord::RunqueueSample(RunqueueSample::default()));

        let mut consumer = RecordConsumer::new(channel.clone(), vec!["hungtask".into()]);
        assert_eq!(consumer.poll().unwrap(), 4);
        assert_eq!(consumer.poll().unwrap(), 0);
        assert_eq!(consumer.count(RecordKind::HungTask), 2);
        assert_eq!(consumer.count(RecordKind::RateLimit), 1);
        assert_eq!(consumer.count(RecordKind::Softlockup), 0);
    }

    #[test]
    fn test_output_file_holds_decodable_frames() {
        let path = std::env::temp_dir().join(format!("hivepf-records-{}.bin", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let channel = EventChannel::with_capacity(16);
        channel.emit(hang(41));
        channel.emit(hang(42));
        let mut consumer = RecordConsumer::new(channel, Vec::new())
            .with_output(&path)
            .unwrap();
        consumer.poll().unwrap();
        drop(consumer);

        let data = std::fs::read(&path).unwrap();
        let mut buf = &data[..];
        assert_eq!(EmittedRecord::decode(&mut buf), Ok(hang(41)));
        assert_eq!(EmittedRecord::decode(&mut buf), Ok(hang(42)));
        assert!(buf.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_drop_kind_names() {
        assert_eq!(drop_kind_str(DropKind::SynFlood as u8), "syn_flood");
        assert_eq!(drop_kind_str(4), "listen_overflow_handshake3");
        assert_eq!(drop_kind_str(0), "unknown");
    }
}
