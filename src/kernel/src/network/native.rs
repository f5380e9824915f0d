//! Native transport: packets to and from other contexts via the kernel

use crate::core::Kernel;
use crate::error::{Bounced, Result};
use crate::network::interface::Transport;
use crate::network::packet::Packet;
use crate::process::ContextId;

pub struct NativeIface {
    yield_to_recipient: bool,
    next_yield_to: Option<ContextId>,
}

impl Default for NativeIface {
    fn default() -> Self {
        NativeIface { yield_to_recipient: true, next_yield_to: None }
    }
}

impl NativeIface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a send lets a waiting recipient run straight away
    pub fn set_yield_to_recipient(&mut self, yield_to_recipient: bool) {
        self.yield_to_recipient = yield_to_recipient;
    }

    /// Make the next receive give `target` a turn when nothing is queued
    pub fn set_next_yield_to(&mut self, target: Option<ContextId>) {
        self.next_yield_to = target;
    }

    /// Target set for the next receive and not used yet
    pub fn next_yield_to(&self) -> Option<ContextId> {
        self.next_yield_to
    }
}

impl Transport for NativeIface {
    fn send(&mut self, kernel: &mut Kernel, packet: Packet) -> core::result::Result<(), Bounced> {
        kernel.send(packet, self.yield_to_recipient)
    }

    fn receive(&mut self, kernel: &mut Kernel) -> Result<Packet> {
        kernel.dispatch_interrupts();
        let queued = kernel
            .current()
            .and_then(|id| kernel.context(id).ok())
            .map_or(0, |c| c.pending_packets());
        match self.next_yield_to {
            // the target keeps its turn until a receive actually yields
            Some(target) if queued == 0 => {
                self.next_yield_to = None;
                kernel.receive_or_yield_to(target)
            }
            _ => kernel.receive(),
        }
    }

    fn close(&mut self, _kernel: &mut Kernel) -> Result<()> {
        self.next_yield_to = None;
        Ok(())
    }
}
