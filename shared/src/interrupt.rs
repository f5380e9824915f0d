//! Interrupt notification payload

use zerocopy::byteorder::network_endian::I16;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Interrupt identifier as seen by contexts
pub type InterruptId = i16;

/// Public alias for the clock interrupt
pub const INTERRUPT_ALIAS_CLOCK: i32 = 1024;

/// Body of the UDP datagram the kernel sends when an interrupt fires
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct InterruptMsg {
    pub id: I16,
}

impl InterruptMsg {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(id: InterruptId) -> Self {
        InterruptMsg { id: I16::new(id) }
    }

    pub fn id(&self) -> InterruptId {
        self.id.get()
    }
}
