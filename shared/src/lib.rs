//! Wire layouts shared between the kernel and the parties it talks to
//!
//! Everything here is plain data: fixed-size `#[repr(C)]` records that are
//! copied in and out of packet payloads or a shared-memory segment. Packet
//! payloads use network byte order; the shared-memory block lives on one
//! host and uses native order.

#![cfg_attr(not(test), no_std)]

pub mod control;
pub mod interrupt;
pub mod shm;
pub mod timer;
