//! Hung-task and softlockup sites.

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_smp_processor_id},
    macros::{kprobe, map, tracepoint},
    maps::RingBuf,
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::warn;
use hivepf_common::{HungTaskEvent, SoftlockupEvent, TASK_COMM_LEN};

const WATCHDOG_RINGBUF_SIZE: u32 = 256 * 1024;

/// sched_process_hang record: comm[16] at 8, pid at 24.
const HANG_COMM_OFFSET: usize = 8;
const HANG_PID_OFFSET: usize = 24;

#[map]
pub static HUNGTASK_EVENTS: RingBuf = RingBuf::with_byte_size(WATCHDOG_RINGBUF_SIZE, 0);

#[map]
pub static SOFTLOCKUP_EVENTS: RingBuf = RingBuf::with_byte_size(WATCHDOG_RINGBUF_SIZE, 0);

#[tracepoint]
pub fn sched_process_hang(ctx: TracePointContext) -> u32 {
    match try_hang(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_hang(ctx: &TracePointContext) -> Result<u32, i64> {
    let pid: i32 = unsafe { ctx.read_at(HANG_PID_OFFSET)? };
    let comm: [u8; TASK_COMM_LEN] = unsafe { ctx.read_at(HANG_COMM_OFFSET)? };
    warn!(ctx, "hung task pid {}", pid);
    let _ = HUNGTASK_EVENTS.output(
        &HungTaskEvent {
            pid: pid as u32,
            comm,
        },
        0,
    );
    Ok(0)
}

#[kprobe]
pub fn watchdog_timer_fn(_ctx: ProbeContext) -> u32 {
    let event = SoftlockupEvent {
        cpu: unsafe { bpf_get_smp_processor_id() },
        pid: (bpf_get_current_pid_tgid() & 0xFFFFFFFF) as u32,
        comm: bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN]),
    };
    let _ = SOFTLOCKUP_EVENTS.output(&event, 0);
    0
}
