//! Shared telemetry substrate: admission control, begin/end correlation, banded
//! histograms and a lossy record channel. Every hot-path call is lock-free and
//! reports failure as a skipped sample, never as an error.

pub mod channel;
pub mod clock;
pub mod correlator;
pub mod histogram;
pub mod ratelimit;
pub mod table;

pub use channel::{ChannelStats, EventChannel};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use correlator::LatencyCorrelator;
pub use histogram::{HistogramAggregator, SwitchKind};
pub use ratelimit::{ConfigError, LimiterConfig, LimiterId, RateLimiter, RateLimiterRegistry};
