//! Scheduler control protocol
//!
//! A context reports that it finished initialising; the scheduler then
//! starts handing slots to the contexts that depend on it.

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const CONTROL_FIXED_UDP_PORT: u16 = 4001;
pub const CONTROL_PROTOCOL_VERSION: u16 = 1;

/// Control command codes
pub mod cmd {
    pub const INVALID: u16 = 0;
    pub const REPORT_INITED: u16 = 1;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct ControlRequest {
    pub version: U16,
    pub cmd: U16,
    pub request_id: U16,
    pub reserved: U16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct ControlReply {
    pub version: U16,
    pub cmd: U16,
    pub request_id: U16,
    pub reserved: U16,
    /// Zero on success, otherwise a kernel error code
    pub error: U32,
}

impl ControlRequest {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(cmd: u16, request_id: u16) -> Self {
        ControlRequest {
            version: U16::new(CONTROL_PROTOCOL_VERSION),
            cmd: U16::new(cmd),
            request_id: U16::new(request_id),
            reserved: U16::new(0),
        }
    }
}

impl ControlReply {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn to(request: &ControlRequest, error: u32) -> Self {
        ControlReply {
            version: U16::new(CONTROL_PROTOCOL_VERSION),
            cmd: request.cmd,
            request_id: request.request_id,
            reserved: U16::new(0),
            error: U32::new(error),
        }
    }
}
