pub mod scheduler;
pub mod watchdog;

pub use scheduler::{RunqueueLatencyProbe, SchedulerLatencyTracker, TrackerConfig};
pub use watchdog::{GatedEmitter, HungTaskProbe, SoftlockupProbe};
