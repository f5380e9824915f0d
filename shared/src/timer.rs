//! Timer protocol
//!
//! Contexts open one-shot or repeating timers on the scheduler's timer
//! server; expiry arrives as a `Tick` reply carrying the caller's timer id.

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const TIMER_FIXED_UDP_PORT: u16 = 4000;
pub const TIMER_PROTOCOL_VERSION: u16 = 1;

/// Timer server resolution in microseconds
pub const TIMER_TICK_USEC: u32 = 100_000;

pub mod cmd {
    pub const INVALID: u16 = 0;
    pub const OPEN: u16 = 1;
    pub const CLOSE: u16 = 2;
    pub const TICK: u16 = 3;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct TimerOpenArgs {
    pub sec: U32,
    pub usec: U32,
    pub repeat: u8,
    pub _pad: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct TimerRequest {
    /// Caller-chosen id, echoed in every tick
    pub id: U32,
    pub version: U16,
    pub cmd: U16,
    pub request_id: U16,
    pub reserved: U16,
    pub open: TimerOpenArgs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct TimerReply {
    pub id: U32,
    pub cmd: U16,
    pub request_id: U16,
    pub error: U32,
}

impl TimerRequest {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn open(id: u32, request_id: u16, sec: u32, usec: u32, repeat: bool) -> Self {
        TimerRequest {
            id: U32::new(id),
            version: U16::new(TIMER_PROTOCOL_VERSION),
            cmd: U16::new(cmd::OPEN),
            request_id: U16::new(request_id),
            reserved: U16::new(0),
            open: TimerOpenArgs {
                sec: U32::new(sec),
                usec: U32::new(usec),
                repeat: repeat as u8,
                _pad: [0; 3],
            },
        }
    }

    pub fn close(id: u32, request_id: u16) -> Self {
        let mut req = Self::open(id, request_id, 0, 0, false);
        req.cmd = U16::new(cmd::CLOSE);
        req
    }
}

impl TimerReply {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(id: u32, cmd: u16, request_id: u16, error: u32) -> Self {
        TimerReply {
            id: U32::new(id),
            cmd: U16::new(cmd),
            request_id: U16::new(request_id),
            error: U32::new(error),
        }
    }
}

/// Number of server ticks for a duration, rounded to the nearest tick
pub fn time_to_ticks(sec: u32, usec: u32) -> u32 {
    sec.saturating_mul(10)
        .saturating_add(usec.saturating_add(TIMER_TICK_USEC / 2 - 1) / TIMER_TICK_USEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_round_to_nearest_tenth() {
        assert_eq!(time_to_ticks(1, 0), 10);
        assert_eq!(time_to_ticks(0, 49_999), 0);
        assert_eq!(time_to_ticks(0, 50_001), 1);
        assert_eq!(time_to_ticks(2, 250_000), 22);
    }
}
