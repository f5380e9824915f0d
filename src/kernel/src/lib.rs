//! PKTOS kernel runtime
//!
//! Isolated contexts that talk only by exchanging fixed-size packets. The
//! runtime is one explicitly constructed [`core::Kernel`] object: it owns
//! memory bookkeeping, the packet pool, the interrupt table and the
//! context table. Network stacks, sockets and scheduler services are owned
//! by the contexts that use them and reach the kernel through `&mut Kernel`.

#[macro_use]
pub mod console;

pub mod config;
pub mod core;
pub mod error;
pub mod memory;
pub mod network;
pub mod process;

#[cfg(test)]
mod testing;

pub use crate::core::Kernel;
pub use crate::error::{Bounced, KernelError, Result};
