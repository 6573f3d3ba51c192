use config::{Config, ConfigError, Environment};
use log::debug;
use serde::Deserialize;

use crate::core::LimiterConfig;

const DEFAULT_REPORT_INTERVAL_SECONDS: u32 = 2;
const DEFAULT_RUNQLAT_THRESHOLD_MS: u32 = 10;
const DEFAULT_CORRELATION_CAPACITY: usize = 10_000;
const DEFAULT_ENTITY_CAPACITY: usize = 10_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 8_192;
const DEFAULT_SAMPLE_BURST: u64 = 100;

/// Per-CPU allowance of hung-task and softlockup notices per second.
pub const WATCHDOG_BURST_PER_CPU: u64 = 10_000;

/// Scheduler probe configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct SchedulerProbes {
    pub runqlat: Option<bool>,
    pub runqlat_threshold_ms: Option<u32>,
    pub runqlat_sample_burst: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct BuiltinProbes {
    #[serde(default)]
    pub scheduler: SchedulerProbes,
    pub hungtask: Option<bool>,
    pub softlockup: Option<bool>,
    /// Offset of the lockup report path inside `watchdog_timer_fn`.
    pub softlockup_offset: Option<u64>,
    /// Histogram report period in seconds.
    pub interval: Option<u32>,
}

/// `task_struct` field offsets for the running kernel.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskLayoutSettings {
    pub pid_offset: u32,
    pub state_offset: u32,
    pub group_offset: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct SubstrateSettings {
    pub correlation_capacity: Option<usize>,
    pub entity_capacity: Option<usize>,
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub builtin_probes: BuiltinProbes,
    #[serde(default)]
    pub substrate: SubstrateSettings,
    pub task_layout: Option<TaskLayoutSettings>,
    pub bpf_object: Option<String>,
    pub record_output: Option<String>,
}

/// Sizes of the shared substrate tables, rounded up to powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstrateConfig {
    pub correlation_capacity: usize,
    pub entity_capacity: usize,
    pub channel_capacity: usize,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn report_interval_secs(&self) -> u32 {
        self.builtin_probes
            .interval
            .filter(|&s| s > 0)
            .unwrap_or(DEFAULT_REPORT_INTERVAL_SECONDS)
    }

    pub fn runqlat_threshold_ns(&self) -> u64 {
        self.builtin_probes
            .scheduler
            .runqlat_threshold_ms
            .unwrap_or(DEFAULT_RUNQLAT_THRESHOLD_MS) as u64
            * hivepf_common::NSEC_PER_MSEC
    }

    pub fn runqlat_sample_limit(&self) -> LimiterConfig {
        let burst = self
            .builtin_probes
            .scheduler
            .runqlat_sample_burst
            .unwrap_or(DEFAULT_SAMPLE_BURST);
        LimiterConfig::new(1, burst)
    }

    pub fn to_substrate_config(&self) -> SubstrateConfig {
        let sub = &self.substrate;
        SubstrateConfig {
            correlation_capacity: sub
                .correlation_capacity
                .unwrap_or(DEFAULT_CORRELATION_CAPACITY)
                .max(1)
                .next_power_of_two(),
            entity_capacity: sub
                .entity_capacity
                .unwrap_or(DEFAULT_ENTITY_CAPACITY)
                .max(1)
                .next_power_of_two(),
            channel_capacity: sub
                .channel_capacity
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY)
                .max(1)
                .next_power_of_two(),
        }
    }
}

/// Limiter shared by the hung-task and softlockup probes.
pub fn watchdog_limit(online_cpus: usize) -> LimiterConfig {
    LimiterConfig::new(1, online_cpus.max(1) as u64 * WATCHDOG_BURST_PER_CPU)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_settings() {
        unsafe {
            std::env::set_var("BUILTIN_PROBES__SCHEDULER__RUNQLAT", "true");
            std::env::set_var("BUILTIN_PROBES__SCHEDULER__RUNQLAT_THRESHOLD_MS", "25");
            std::env::set_var("BUILTIN_PROBES__INTERVAL", "5");
            std::env::set_var("SUBSTRATE__CHANNEL_CAPACITY", "1000");
            std::env::set_var("BPF_OBJECT", "/opt/hivepf/hivepf.bpf.o");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert_eq!(settings.builtin_probes.scheduler.runqlat, Some(true));
        assert_eq!(settings.runqlat_threshold_ns(), 25_000_000);
        assert_eq!(settings.report_interval_secs(), 5);
        assert_eq!(settings.to_substrate_config().channel_capacity, 1024);
        assert_eq!(settings.bpf_object.as_deref(), Some("/opt/hivepf/hivepf.bpf.o"));

        unsafe {
            std::env::remove_var("BUILTIN_PROBES__SCHEDULER__RUNQLAT");
            std::env::remove_var("BUILTIN_PROBES__SCHEDULER__RUNQLAT_THRESHOLD_MS");
            std::env::remove_var("BUILTIN_PROBES__INTERVAL");
            std::env::remove_var("SUBSTRATE__CHANNEL_CAPACITY");
            std::env::remove_var("BPF_OBJECT");
        }
    }

    #[test]
    #[serial]
    fn test_task_layout_from_env() {
        unsafe {
            std::env::set_var("TASK_LAYOUT__PID_OFFSET", "2456");
            std::env::set_var("TASK_LAYOUT__STATE_OFFSET", "24");
            std::env::set_var("TASK_LAYOUT__GROUP_OFFSET", "1496");
        }

        let settings = Settings::new().expect("Failed to load settings");
        assert_eq!(
            settings.task_layout,
            Some(TaskLayoutSettings {
                pid_offset: 2456,
                state_offset: 24,
                group_offset: 1496,
            })
        );

        unsafe {
            std::env::remove_var("TASK_LAYOUT__PID_OFFSET");
            std::env::remove_var("TASK_LAYOUT__STATE_OFFSET");
            std::env::remove_var("TASK_LAYOUT__GROUP_OFFSET");
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.report_interval_secs(), 2);
        assert_eq!(settings.runqlat_threshold_ns(), 10_000_000);
        assert_eq!(settings.runqlat_sample_limit(), LimiterConfig::new(1, 100));
        assert_eq!(
            settings.to_substrate_config(),
            SubstrateConfig {
                correlation_capacity: 16_384,
                entity_capacity: 16_384,
                channel_capacity: 8_192,
            }
        );
    }

    #[test]
    fn test_watchdog_limit_scales_with_cpus() {
        assert_eq!(watchdog_limit(8).burst, 80_000);
        assert_eq!(watchdog_limit(0).burst, WATCHDOG_BURST_PER_CPU);
    }
}
