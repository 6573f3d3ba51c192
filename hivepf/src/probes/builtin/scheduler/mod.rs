pub mod runqueue;
pub mod tracker;

pub use runqueue::RunqueueLatencyProbe;
pub use tracker::{SchedulerLatencyTracker, TrackerConfig};
