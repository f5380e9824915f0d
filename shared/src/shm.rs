//! Shared-memory segment layout
//!
//! Two single-slot channels, one per direction. A slot is owned by the
//! producer while `valid == 0` and by the consumer while `valid != 0`;
//! each transition is announced with the channel's signal.

use zerocopy::byteorder::native_endian::I32;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Well-known SysV key of the segment
pub const SHM_KEY: i32 = 0xfeed2460_u32 as i32;

/// Bytes one slot can carry (IPv6 header plus payload)
pub const SHM_MTU: usize = 1500;

/// Interrupt ports the kernel side listens on
pub const SHM_SEND_INTERRUPT_PORT: u16 = 65000;
pub const SHM_RECEIVE_INTERRUPT_PORT: u16 = 65001;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct ShmBuff {
    pub data: [u8; SHM_MTU],
    pub valid: u8,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct ShmChannel {
    pub buff: ShmBuff,
    /// Signal the outside party raises towards the kernel
    pub signum_to_kernel: I32,
    /// Signal the kernel raises towards the outside party
    pub signum_to_outside: I32,
}

/// `send` carries kernel -> outside traffic, `receive` the reverse
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct ShmBlock {
    pub send: ShmChannel,
    pub receive: ShmChannel,
    pub kernel_pid: I32,
    pub outside_pid: I32,
}

impl ShmBuff {
    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }
}

impl ShmBlock {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}
