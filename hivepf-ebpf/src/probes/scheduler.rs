//! Scheduler sites feeding the run-queue latency tracker.
//!
//! `task_struct` offsets come from user space through `TASK_LAYOUT`; with no layout
//! set the switch site stays silent.

use aya_ebpf::{
    EbpfContext,
    helpers::{bpf_get_smp_processor_id, bpf_ktime_get_ns, bpf_probe_read_kernel},
    macros::{kprobe, map, raw_tracepoint, tracepoint},
    maps::{Array, RingBuf},
    programs::{ProbeContext, RawTracePointContext, TracePointContext},
};
use hivepf_common::{SchedEvent, SchedEventKind, TaskLayout};

const SCHED_RINGBUF_SIZE: u32 = 4 * 1024 * 1024;

/// `pid` offset in the sched_wakeup / sched_process_exit tracepoint records.
const TP_PID_OFFSET: usize = 24;

#[map]
pub static SCHED_EVENTS: RingBuf = RingBuf::with_byte_size(SCHED_RINGBUF_SIZE, 0);

#[map]
pub static TASK_LAYOUT: Array<TaskLayout> = Array::with_max_entries(1, 0);

#[inline(always)]
fn submit(event: SchedEvent) {
    let _ = SCHED_EVENTS.output(&event, 0);
}

#[inline(always)]
fn base_event(kind: SchedEventKind) -> SchedEvent {
    SchedEvent {
        kind: kind as u32,
        cpu: unsafe { bpf_get_smp_processor_id() },
        timestamp: unsafe { bpf_ktime_get_ns() },
        ..SchedEvent::default()
    }
}

#[inline(always)]
fn tracepoint_pid(ctx: &TracePointContext) -> Result<u32, i64> {
    let pid: i32 = unsafe { ctx.read_at(TP_PID_OFFSET)? };
    Ok(pid as u32)
}

// ============================================================
// Enqueue
// ============================================================

#[tracepoint]
pub fn sched_wakeup(ctx: TracePointContext) -> u32 {
    try_wakeup(&ctx).unwrap_or(0)
}

#[tracepoint]
pub fn sched_wakeup_new(ctx: TracePointContext) -> u32 {
    try_wakeup(&ctx).unwrap_or(0)
}

fn try_wakeup(ctx: &TracePointContext) -> Result<u32, i64> {
    let pid = tracepoint_pid(ctx)?;
    if pid == 0 {
        return Ok(0);
    }
    let mut event = base_event(SchedEventKind::Wakeup);
    event.next_pid = pid;
    submit(event);
    Ok(0)
}

// ============================================================
// Switch
// ============================================================

/// TP_PROTO(bool preempt, struct task_struct *prev, struct task_struct *next)
#[raw_tracepoint(tracepoint = "sched_switch")]
pub fn sched_switch(ctx: RawTracePointContext) -> i32 {
    let _ = try_switch(&ctx);
    0
}

fn try_switch(ctx: &RawTracePointContext) -> Result<(), i64> {
    let Some(layout) = TASK_LAYOUT.get(0) else {
        return Ok(());
    };
    if layout.pid_offset == 0 {
        return Ok(());
    }

    let args = ctx.as_ptr() as *const u64;
    let prev = unsafe { *args.add(1) } as *const u8;
    let next = unsafe { *args.add(2) } as *const u8;

    let mut event = base_event(SchedEventKind::Switch);
    unsafe {
        event.prev_pid = bpf_probe_read_kernel(prev.add(layout.pid_offset as usize) as *const i32)?
            as u32;
        event.prev_state =
            bpf_probe_read_kernel(prev.add(layout.state_offset as usize) as *const u32)? as u64;
        event.prev_group =
            bpf_probe_read_kernel(prev.add(layout.group_offset as usize) as *const u64)?;
        event.next_pid = bpf_probe_read_kernel(next.add(layout.pid_offset as usize) as *const i32)?
            as u32;
        event.next_group =
            bpf_probe_read_kernel(next.add(layout.group_offset as usize) as *const u64)?;
    }
    submit(event);
    Ok(())
}

// ============================================================
// Teardown
// ============================================================

#[tracepoint]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    if let Ok(pid) = tracepoint_pid(&ctx) {
        let mut event = base_event(SchedEventKind::Exit);
        event.prev_pid = pid;
        submit(event);
    }
    0
}

/// void sched_free_group(struct task_group *tg)
#[kprobe]
pub fn sched_free_group(ctx: ProbeContext) -> u32 {
    let Some(group) = ctx.arg::<u64>(0) else {
        return 0;
    };
    let mut event = base_event(SchedEventKind::GroupFree);
    event.prev_group = group;
    submit(event);
    0
}
