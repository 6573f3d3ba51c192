pub mod consumer;
pub mod core;
pub mod probes;
pub mod records;
pub mod reporter;
pub mod settings;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{error, info, warn};
use tokio::signal;
use tokio::task::JoinHandle;

use crate::consumer::RecordConsumer;
use crate::core::{EventChannel, MonotonicClock, RateLimiterRegistry};
use crate::probes::{
    Probe,
    builtin::{
        GatedEmitter, HungTaskProbe, RunqueueLatencyProbe, SchedulerLatencyTracker,
        SoftlockupProbe, TrackerConfig,
    },
    request_shutdown,
};
use crate::records::EmittedRecord;
use crate::reporter::Reporter;
use crate::settings::{Settings, SubstrateConfig, watchdog_limit};

pub const DEFAULT_BPF_OBJECT: &str = "/usr/lib/hivepf/hivepf.bpf.o";

pub struct HiveEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl HiveEngine {
    pub fn new(settings: Settings) -> Result<Self> {
        bump_memlock_rlimit()?;
        let path = settings
            .bpf_object
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BPF_OBJECT));
        let mut bpf = load_object(&path)?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        let substrate = self.settings.to_substrate_config();
        let clock = MonotonicClock;
        let channel = EventChannel::<EmittedRecord>::with_capacity(substrate.channel_capacity);

        let mut limiters = RateLimiterRegistry::new(clock);
        let watchdog = watchdog_limit(online_cpu_count());
        let hungtask_id = limiters.register("hungtask", watchdog)?;
        let softlockup_id = limiters.register("softlockup", watchdog)?;
        let limiter_names = limiters
            .snapshots()
            .map(|(name, _)| name.to_string())
            .collect();
        let limiters = Arc::new(limiters);

        let tracker = self.attach_probes(
            &substrate,
            clock,
            &channel,
            GatedEmitter::new(Arc::clone(&limiters), hungtask_id, channel.clone()),
            GatedEmitter::new(Arc::clone(&limiters), softlockup_id, channel.clone()),
        )?;

        let mut consumer = RecordConsumer::new(channel.clone(), limiter_names);
        if let Some(path) = self.settings.record_output.as_deref() {
            consumer = consumer.with_output(Path::new(path))?;
        }
        let consumer = tokio::task::spawn_blocking(move || consumer.run());

        let period = Duration::from_secs(self.settings.report_interval_secs() as u64);
        let reporter = tokio::spawn(Reporter::new(tracker, limiters, channel).run(period));

        info!("Monitoring active. Press Ctrl-C to exit.");
        let result = supervise(consumer, signal::ctrl_c()).await;
        reporter.abort();
        result
    }

    fn attach_probes(
        &mut self,
        substrate: &SubstrateConfig,
        clock: MonotonicClock,
        channel: &EventChannel<EmittedRecord>,
        hungtask: GatedEmitter<MonotonicClock>,
        softlockup: GatedEmitter<MonotonicClock>,
    ) -> Result<Option<Arc<SchedulerLatencyTracker<MonotonicClock>>>> {
        let probes = &self.settings.builtin_probes;
        let mut tracker = None;

        if probes.scheduler.runqlat.unwrap_or(false) {
            match self.settings.task_layout {
                Some(layout) => {
                    let config = TrackerConfig {
                        correlation_capacity: substrate.correlation_capacity,
                        entity_capacity: substrate.entity_capacity,
                        shards: possible_cpu_count(),
                        slow_threshold_ns: self.settings.runqlat_threshold_ns(),
                        sample_limit: self.settings.runqlat_sample_limit(),
                    };
                    let t = Arc::new(SchedulerLatencyTracker::new(
                        config,
                        clock,
                        channel.clone(),
                    )?);
                    RunqueueLatencyProbe::new(Arc::clone(&t), layout).attach(&mut self.bpf)?;
                    tracker = Some(t);
                }
                None => warn!("TASK_LAYOUT__* not configured; skipping run-queue latency probe"),
            }
        }

        if probes.hungtask.unwrap_or(false) {
            HungTaskProbe::new(hungtask).attach(&mut self.bpf)?;
        }

        if probes.softlockup.unwrap_or(false) {
            SoftlockupProbe::new(softlockup, probes.softlockup_offset).attach(&mut self.bpf)?;
        }

        Ok(tracker)
    }
}

/// Runs until `shutdown` resolves or the consumer stops on its own. Either way the
/// shutdown flag is raised; a consumer that stopped early is an error.
async fn supervise<F>(mut consumer: JoinHandle<Result<()>>, shutdown: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        signal = shutdown => {
            info!("Exiting...");
            request_shutdown();
            signal.context("Failed to wait for Ctrl-C")?;
            consumer.await.context("Consumer task panicked")?
        }
        finished = &mut consumer => {
            request_shutdown();
            let err = match finished.context("Consumer task panicked") {
                Ok(Ok(())) => anyhow!("Record consumer stopped unexpectedly"),
                Ok(Err(e)) | Err(e) => e,
            };
            error!("Record consumer failed: {:#}", err);
            Err(err)
        }
    }
}

fn load_object(path: &Path) -> Result<Ebpf> {
    info!("Loading eBPF object {}", path.display());
    Ebpf::load_file(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn online_cpu_count() -> usize {
    aya::util::online_cpus().map(|c| c.len()).unwrap_or(1)
}

fn possible_cpu_count() -> usize {
    aya::util::nr_cpus().unwrap_or_else(|_| online_cpu_count())
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
