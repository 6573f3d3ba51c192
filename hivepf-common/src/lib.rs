#![cfg_attr(not(test), no_std)]

//! Record layouts shared between the eBPF trigger shims and user space.
//!
//! Everything here is `#[repr(C)]` and plain-old-data so the same bytes can be
//! written into a ring buffer by the kernel side and read back with
//! `read_unaligned` on the user side.

pub const TASK_COMM_LEN: usize = 16;
pub const PERF_MAX_STACK_DEPTH: usize = 127;
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Number of run-queue latency bands kept per record.
pub const LATENCY_BANDS: usize = 4;

/// Exclusive upper bounds of the first three bands: [0,10)ms, [10,20)ms, [20,50)ms.
/// Everything at or above the last bound lands in the final band.
pub const LATENCY_BOUNDS_NS: [u64; LATENCY_BANDS - 1] =
    [10 * NSEC_PER_MSEC, 20 * NSEC_PER_MSEC, 50 * NSEC_PER_MSEC];

/// Raw `task_struct::__state` value of a runnable task.
pub const TASK_RUNNING: u64 = 0;

#[inline(always)]
pub fn latency_band(delta_ns: u64) -> usize {
    let mut band = 0;
    while band < LATENCY_BOUNDS_NS.len() {
        if delta_ns < LATENCY_BOUNDS_NS[band] {
            return band;
        }
        band += 1;
    }
    LATENCY_BANDS - 1
}

// ============================================================
// Scheduler trigger sites
// ============================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEventKind {
    /// `sched_wakeup` / `sched_wakeup_new`: `next_pid` was enqueued.
    Wakeup = 1,
    /// `sched_switch`: `prev_*` leaves the CPU, `next_*` starts running.
    Switch = 2,
    /// `sched_process_exit`: `prev_pid` is exiting.
    Exit = 3,
    /// `sched_free_group`: `prev_group` is being torn down.
    GroupFree = 4,
}

impl TryFrom<u32> for SchedEventKind {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(SchedEventKind::Wakeup),
            2 => Ok(SchedEventKind::Switch),
            3 => Ok(SchedEventKind::Exit),
            4 => Ok(SchedEventKind::GroupFree),
            other => Err(other),
        }
    }
}

/// One scheduler site occurrence, already decoded from kernel memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedEvent {
    pub kind: u32,
    pub cpu: u32,
    pub prev_pid: u32,
    pub next_pid: u32,
    pub prev_state: u64,
    /// Scheduling group (task_group address) of the previous task.
    pub prev_group: u64,
    pub next_group: u64,
    /// `bpf_ktime_get_ns()` at the site.
    pub timestamp: u64,
}

/// `task_struct` field offsets pushed into the shim by user space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskLayout {
    pub pid_offset: u32,
    pub state_offset: u32,
    pub group_offset: u32,
    pub _pad: u32,
}

// ============================================================
// Emitted records
// ============================================================

/// Limiter state as reported on a breach (same field order as the kernel-side limiter).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub interval: u64,
    pub window_start: u64,
    pub burst: u64,
    pub max_burst: u64,
    pub events: u64,
    pub missed: u64,
    pub total_events: u64,
    pub total_missed: u64,
    pub total_interval: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftlockupEvent {
    pub cpu: u32,
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HungTaskEvent {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

/// A single wake-to-run latency sample above the reporting threshold.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunqueueSample {
    pub pid: u32,
    pub cpu: u32,
    pub latency_ns: u64,
    pub group: u64,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    CommonDrop = 1,
    SynFlood = 2,
    ListenOverflowHandshake1 = 3,
    ListenOverflowHandshake3 = 4,
}

impl DropKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            DropKind::CommonDrop => "common_drop",
            DropKind::SynFlood => "syn_flood",
            DropKind::ListenOverflowHandshake1 => "listen_overflow_handshake1",
            DropKind::ListenOverflowHandshake3 => "listen_overflow_handshake3",
        }
    }
}

impl TryFrom<u8> for DropKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(DropKind::CommonDrop),
            2 => Ok(DropKind::SynFlood),
            3 => Ok(DropKind::ListenOverflowHandshake1),
            4 => Ok(DropKind::ListenOverflowHandshake3),
            other => Err(other),
        }
    }
}

/// TCP packet drop notice with a bounded kernel stack snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropWatchEvent {
    pub tgid_pid: u64,
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack_seq: u32,
    pub queue_mapping: u32,
    pub pkt_len: u64,
    /// Bytes of `stack` filled by `bpf_get_stack`, negative on failure.
    pub stack_size: i64,
    pub stack: [u64; PERF_MAX_STACK_DEPTH],
    pub sk_max_ack_backlog: u32,
    pub state: u8,
    pub kind: u8,
    pub comm: [u8; TASK_COMM_LEN],
}

impl DropWatchEvent {
    pub const fn zeroed() -> Self {
        Self {
            tgid_pid: 0,
            saddr: 0,
            daddr: 0,
            sport: 0,
            dport: 0,
            seq: 0,
            ack_seq: 0,
            queue_mapping: 0,
            pkt_len: 0,
            stack_size: 0,
            stack: [0; PERF_MAX_STACK_DEPTH],
            sk_max_ack_backlog: 0,
            state: 0,
            kind: 0,
            comm: [0; TASK_COMM_LEN],
        }
    }

    /// Number of valid frames in `stack`.
    pub fn stack_depth(&self) -> usize {
        if self.stack_size <= 0 {
            return 0;
        }
        let frames = self.stack_size as usize / core::mem::size_of::<u64>();
        if frames > PERF_MAX_STACK_DEPTH {
            PERF_MAX_STACK_DEPTH
        } else {
            frames
        }
    }
}

impl Default for DropWatchEvent {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Histogram record snapshot. Identical for the global record and every group.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStat {
    pub nvcsw: u64,
    pub nivcsw: u64,
    pub nlat: [u64; LATENCY_BANDS],
}

impl LatencyStat {
    pub fn total_samples(&self) -> u64 {
        self.nlat.iter().sum()
    }

    pub fn merge(&mut self, other: &LatencyStat) {
        self.nvcsw += other.nvcsw;
        self.nivcsw += other.nivcsw;
        for (mine, theirs) in self.nlat.iter_mut().zip(other.nlat.iter()) {
            *mine += *theirs;
        }
    }
}

#[cfg(feature = "user")]
mod pod {
    use super::*;

    unsafe impl aya::Pod for SchedEvent {}
    unsafe impl aya::Pod for TaskLayout {}
    unsafe impl aya::Pod for RateLimitState {}
    unsafe impl aya::Pod for SoftlockupEvent {}
    unsafe impl aya::Pod for HungTaskEvent {}
    unsafe impl aya::Pod for RunqueueSample {}
    unsafe impl aya::Pod for DropWatchEvent {}
    unsafe impl aya::Pod for LatencyStat {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_band_edges() {
        assert_eq!(latency_band(0), 0);
        assert_eq!(latency_band(10 * NSEC_PER_MSEC - 1), 0);
        assert_eq!(latency_band(10 * NSEC_PER_MSEC), 1);
        assert_eq!(latency_band(12 * NSEC_PER_MSEC), 1);
        assert_eq!(latency_band(20 * NSEC_PER_MSEC), 2);
        assert_eq!(latency_band(49 * NSEC_PER_MSEC), 2);
        assert_eq!(latency_band(50 * NSEC_PER_MSEC), 3);
        assert_eq!(latency_band(u64::MAX), 3);
    }

    #[test]
    fn test_sched_event_kind_roundtrip() {
        assert_eq!(SchedEventKind::try_from(2), Ok(SchedEventKind::Switch));
        assert_eq!(SchedEventKind::try_from(9), Err(9));
    }

    #[test]
    fn test_drop_stack_depth_is_bounded() {
        let mut ev = DropWatchEvent::zeroed();
        assert_eq!(ev.stack_depth(), 0);
        ev.stack_size = 3 * 8;
        assert_eq!(ev.stack_depth(), 3);
        ev.stack_size = i64::MAX;
        assert_eq!(ev.stack_depth(), PERF_MAX_STACK_DEPTH);
        ev.stack_size = -14;
        assert_eq!(ev.stack_depth(), 0);
    }

    #[test]
    fn test_latency_stat_merge() {
        let mut a = LatencyStat { nvcsw: 1, nivcsw: 2, nlat: [1, 0, 0, 4] };
        let b = LatencyStat { nvcsw: 3, nivcsw: 0, nlat: [0, 5, 0, 1] };
        a.merge(&b);
        assert_eq!(a, LatencyStat { nvcsw: 4, nivcsw: 2, nlat: [1, 5, 0, 5] });
        assert_eq!(a.total_samples(), 11);
    }
}
