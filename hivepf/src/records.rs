//! Records handed to the consumer and their on-the-wire framing.
//!
//! A frame is a one-byte kind followed by the record's fixed little-endian body.
//! Frames are self-contained: a reader needs nothing but the bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hivepf_common::{
    DropWatchEvent, HungTaskEvent, PERF_MAX_STACK_DEPTH, RateLimitState, RunqueueSample,
    SoftlockupEvent, TASK_COMM_LEN,
};
use thiserror::Error;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    RateLimit = 1,
    Softlockup = 2,
    HungTask = 3,
    DropWatch = 4,
    RunqueueSample = 5,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::RateLimit,
        RecordKind::Softlockup,
        RecordKind::HungTask,
        RecordKind::DropWatch,
        RecordKind::RunqueueSample,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::RateLimit => "ratelimit",
            RecordKind::Softlockup => "softlockup",
            RecordKind::HungTask => "hungtask",
            RecordKind::DropWatch => "dropwatch",
            RecordKind::RunqueueSample => "runqlat_sample",
        }
    }

    /// Body length in bytes, excluding the kind byte.
    pub const fn body_len(self) -> usize {
        match self {
            RecordKind::RateLimit => 4 + 9 * 8,
            RecordKind::Softlockup => 4 + 4 + TASK_COMM_LEN,
            RecordKind::HungTask => 4 + TASK_COMM_LEN,
            RecordKind::DropWatch => {
                8 + 4 + 4 + 2 + 2 + 4 + 4 + 4 + 8 + 8 + PERF_MAX_STACK_DEPTH * 8 + 4 + 1 + 1
                    + TASK_COMM_LEN
            }
            RecordKind::RunqueueSample => 4 + 4 + 8 + 8,
        }
    }
}

impl TryFrom<u8> for RecordKind {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(RecordKind::RateLimit),
            2 => Ok(RecordKind::Softlockup),
            3 => Ok(RecordKind::HungTask),
            4 => Ok(RecordKind::DropWatch),
            5 => Ok(RecordKind::RunqueueSample),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unknown record kind {0}")]
    UnknownKind(u8),

    #[error("{kind:?} record needs {expected} bytes, got {actual}")]
    Truncated {
        kind: RecordKind,
        expected: usize,
        actual: usize,
    },
}

/// Immutable snapshot pushed through the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmittedRecord {
    /// Breach notice. `limiter` is the registry index of the reporting limiter.
    RateLimit { limiter: u32, state: RateLimitState },
    Softlockup(SoftlockupEvent),
    HungTask(HungTaskEvent),
    DropWatch(Box<DropWatchEvent>),
    RunqueueSample(RunqueueSample),
}

impl EmittedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            EmittedRecord::RateLimit { .. } => RecordKind::RateLimit,
            EmittedRecord::Softlockup(_) => RecordKind::Softlockup,
            EmittedRecord::HungTask(_) => RecordKind::HungTask,
            EmittedRecord::DropWatch(_) => RecordKind::DropWatch,
            EmittedRecord::RunqueueSample(_) => RecordKind::RunqueueSample,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.kind().body_len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind() as u8);
        match self {
            EmittedRecord::RateLimit { limiter, state } => {
                buf.put_u32_le(*limiter);
                for v in [
                    state.interval,
                    state.window_start,
                    state.burst,
                    state.max_burst,
                    state.events,
                    state.missed,
                    state.total_events,
                    state.total_missed,
                    state.total_interval,
                ] {
                    buf.put_u64_le(v);
                }
            }
            EmittedRecord::Softlockup(ev) => {
                buf.put_u32_le(ev.cpu);
                buf.put_u32_le(ev.pid);
                buf.put_slice(&ev.comm);
            }
            EmittedRecord::HungTask(ev) => {
                buf.put_u32_le(ev.pid);
                buf.put_slice(&ev.comm);
            }
            EmittedRecord::DropWatch(ev) => {
                buf.put_u64_le(ev.tgid_pid);
                buf.put_u32_le(ev.saddr);
                buf.put_u32_le(ev.daddr);
                buf.put_u16_le(ev.sport);
                buf.put_u16_le(ev.dport);
                buf.put_u32_le(ev.seq);
                buf.put_u32_le(ev.ack_seq);
                buf.put_u32_le(ev.queue_mapping);
                buf.put_u64_le(ev.pkt_len);
                buf.put_i64_le(ev.stack_size);
                for frame in ev.stack {
                    buf.put_u64_le(frame);
                }
                buf.put_u32_le(ev.sk_max_ack_backlog);
                buf.put_u8(ev.state);
                buf.put_u8(ev.kind);
                buf.put_slice(&ev.comm);
            }
            EmittedRecord::RunqueueSample(s) => {
                buf.put_u32_le(s.pid);
                buf.put_u32_le(s.cpu);
                buf.put_u64_le(s.latency_ns);
                buf.put_u64_le(s.group);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Reads one frame off the front of `buf`, leaving any following frames in place.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if !buf.has_remaining() {
            return Err(DecodeError::Empty);
        }
        let kind = RecordKind::try_from(buf.chunk()[0])?;
        let expected = kind.body_len();
        if buf.remaining() - 1 < expected {
            return Err(DecodeError::Truncated {
                kind,
                expected,
                actual: buf.remaining() - 1,
            });
        }
        buf.advance(1);

        let record = match kind {
            RecordKind::RateLimit => EmittedRecord::RateLimit {
                limiter: buf.get_u32_le(),
                state: RateLimitState {
                    interval: buf.get_u64_le(),
                    window_start: buf.get_u64_le(),
                    burst: buf.get_u64_le(),
                    max_burst: buf.get_u64_le(),
                    events: buf.get_u64_le(),
                    missed: buf.get_u64_le(),
                    total_events: buf.get_u64_le(),
                    total_missed: buf.get_u64_le(),
                    total_interval: buf.get_u64_le(),
                },
            },
            RecordKind::Softlockup => EmittedRecord::Softlockup(SoftlockupEvent {
                cpu: buf.get_u32_le(),
                pid: buf.get_u32_le(),
                comm: get_comm(buf),
            }),
            RecordKind::HungTask => EmittedRecord::HungTask(HungTaskEvent {
                pid: buf.get_u32_le(),
                comm: get_comm(buf),
            }),
            RecordKind::DropWatch => {
                let mut ev = Box::new(DropWatchEvent::zeroed());
                ev.tgid_pid = buf.get_u64_le();
                ev.saddr = buf.get_u32_le();
                ev.daddr = buf.get_u32_le();
                ev.sport = buf.get_u16_le();
                ev.dport = buf.get_u16_le();
                ev.seq = buf.get_u32_le();
                ev.ack_seq = buf.get_u32_le();
                ev.queue_mapping = buf.get_u32_le();
                ev.pkt_len = buf.get_u64_le();
                ev.stack_size = buf.get_i64_le();
                for frame in ev.stack.iter_mut() {
                    *frame = buf.get_u64_le();
                }
                ev.sk_max_ack_backlog = buf.get_u32_le();
                ev.state = buf.get_u8();
                ev.kind = buf.get_u8();
                ev.comm = get_comm(buf);
                EmittedRecord::DropWatch(ev)
            }
            RecordKind::RunqueueSample => EmittedRecord::RunqueueSample(RunqueueSample {
                pid: buf.get_u32_le(),
                cpu: buf.get_u32_le(),
                latency_ns: buf.get_u64_le(),
                group: buf.get_u64_le(),
            }),
        };
        Ok(record)
    }
}

fn get_comm(buf: &mut impl Buf) -> [u8; TASK_COMM_LEN] {
    let mut comm = [0u8; TASK_COMM_LEN];
    buf.copy_to_slice(&mut comm);
    comm
}

/// Task name up to the first NUL.
pub fn comm_str(comm: &[u8]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

/// Fixed-width, NUL-padded task name.
pub fn comm_bytes(name: &str) -> [u8; TASK_COMM_LEN] {
    let mut comm = [0u8; TASK_COMM_LEN];
    let len = name.len().min(TASK_COMM_LEN - 1);
    comm[..len].copy_from_slice(&name.as_bytes()[..len]);
    comm
}
