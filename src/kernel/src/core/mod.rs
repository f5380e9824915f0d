//! Kernel runtime object
//!
//! [`Kernel`] is constructed once per system and passed by `&mut` to every
//! context body. It owns:
//! - **Memory**: the range tracker, the packet pool window and each
//!   context's backing arena
//! - **Contexts**: the context table, the current context and the idle
//!   context
//! - **Interrupts**: registrations, allocations and pending events
//!
//! Packet transfer between contexts happens here: `send` moves a packet into
//! the recipient's queue, `receive` takes from the caller's queue, and
//! `switch_to` resumes another context's body on the spot.

pub mod interrupts;
pub mod scheduler;

use zerocopy::byteorder::network_endian::U16;
use zerocopy::AsBytes;

use crate::config::KernelConfig;
use crate::error::{Bounced, KernelError, Result};
use crate::memory::{LogicalId, MemoryFlags, MemoryOwner, MemoryTracker, PhysicalType, PAGE_SIZE};
use crate::network::addr::Address;
use crate::network::checksum;
use crate::network::packet::{HeaderKind, Packet, PacketPool, UdpHeader};
use crate::network::queue::ANY_PROTOCOL;
use crate::process::{Context, ContextBody, ContextId, ContextTable, SchedulerMetadata, Step};

use interrupts::{host, InterruptId, InterruptMsg, InterruptState, InterruptTable, Registration, SignalLine};

pub struct Kernel {
    config: KernelConfig,
    memory: MemoryTracker,
    pool: PacketPool,
    pool_window: LogicalId,
    interrupts: InterruptTable,
    contexts: ContextTable,
    current: Option<ContextId>,
    idle: Option<ContextId>,
    next_address: u128,
    clock_running: bool,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Result<Self> {
        let mut memory = MemoryTracker::new();
        memory.define(config.memory.ram_base, config.memory.ram_size, PhysicalType::Ram)?;
        let pool_bytes = config.packets.pool_size as u64 * PAGE_SIZE;
        let pool_range = memory.alloc(PhysicalType::Ram, pool_bytes, PAGE_SIZE)?;
        let pool_window = memory.map(
            pool_range,
            MemoryOwner::Kernel,
            0,
            0,
            MemoryFlags::WRITABLE | MemoryFlags::GLOBAL,
        )?;
        let pool_base = memory.physical(pool_range)?.addr();
        let pool = PacketPool::new(config.packets.pool_size, pool_base);
        let interrupts =
            InterruptTable::new(&config.interrupts.signals, config.interrupts.host_signals);

        let mut kernel = Kernel {
            config,
            memory,
            pool,
            pool_window,
            interrupts,
            contexts: ContextTable::new(),
            current: None,
            idle: None,
            next_address: 1,
            clock_running: false,
        };
        let clock = kernel.config.interrupts.clock_interval_us;
        if clock > 0 && kernel.config.interrupts.host_signals {
            host::start_clock(clock)?;
            kernel.clock_running = true;
        }
        crate::info!(
            "kernel: {} packet buffers at {:#x}, system mask {}",
            kernel.pool.capacity(),
            pool_base,
            kernel.config.network.system_mask
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryTracker {
        &mut self.memory
    }

    /// Kernel window onto the packet buffers
    pub fn pool_window(&self) -> LogicalId {
        self.pool_window
    }

    pub fn packet_alloc(&self) -> Result<Packet> {
        self.pool.alloc()
    }

    pub fn packets_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Next unused address inside the system mask
    pub fn address_generate(&mut self) -> Address {
        let base = self.config.network.system_mask.addr().as_u128();
        loop {
            let addr = Address::from_u128(base + self.next_address);
            self.next_address += 1;
            if self.contexts.find(&addr).is_none() {
                return addr;
            }
        }
    }

    // ---- contexts ----

    /// Create a context that runs `body` when switched to
    pub fn spawn(
        &mut self,
        name: &str,
        body: Box<dyn ContextBody>,
        metadata: SchedulerMetadata,
    ) -> Result<ContextId> {
        self.create(name, Some(body), metadata)
    }

    /// Create a context driven by host code through [`enter`](Self::enter)
    pub fn spawn_host(&mut self, name: &str, metadata: SchedulerMetadata) -> Result<ContextId> {
        self.create(name, None, metadata)
    }

    fn create(
        &mut self,
        name: &str,
        body: Option<Box<dyn ContextBody>>,
        metadata: SchedulerMetadata,
    ) -> Result<ContextId> {
        let address = self.address_generate();
        let scheduler = self.my_address();
        let mut context = Context::new(name, address, scheduler, self.config.packets.queue_len, body);
        context.metadata = metadata;
        let id = self.contexts.insert(context);

        let size = self.config.memory.context_arena_size;
        if size > 0 {
            if let Err(e) = self.attach_arena(id, size) {
                self.contexts.remove(id);
                return Err(e);
            }
        }
        crate::debug!("context: created {} at {}", name, address);
        Ok(id)
    }

    /// Give a host-driven context a body; from then on it is resumed by
    /// [`switch_to`](Self::switch_to)
    pub fn set_body(&mut self, id: ContextId, body: Box<dyn ContextBody>) -> Result<()> {
        let context = self.context_mut(id)?;
        if context.is_finished() {
            return Err(KernelError::ContextFinished);
        }
        context.body = Some(body);
        Ok(())
    }

    fn attach_arena(&mut self, id: ContextId, size: u64) -> Result<()> {
        let physical = self.memory.alloc(PhysicalType::Ram, size, PAGE_SIZE)?;
        let logical = match self.memory.map(
            physical,
            MemoryOwner::Context(id),
            0,
            0,
            MemoryFlags::WRITABLE | MemoryFlags::GROWABLE_UP,
        ) {
            Ok(l) => l,
            Err(e) => {
                self.memory.free(physical)?;
                return Err(e);
            }
        };
        self.context_mut(id)?.set_arena((physical, logical));
        Ok(())
    }

    /// Tear a context down: its queue, memory and interrupt bindings go
    /// with it
    pub fn destroy(&mut self, id: ContextId) -> Result<()> {
        if self.current == Some(id) {
            return Err(KernelError::InvalidArg);
        }
        let context = self.contexts.remove(id).ok_or(KernelError::DoesNotExist)?;
        self.interrupts.unregister_all(context.address());
        self.memory.release_owner(MemoryOwner::Context(id))?;
        if let Some((physical, _)) = context.arena() {
            self.memory.free(physical)?;
        }
        if self.idle == Some(id) {
            self.idle = None;
        }
        crate::debug!(
            "context: destroyed {} ({} packets dropped)",
            context.name(),
            context.pending_packets()
        );
        Ok(())
    }

    pub fn context(&self, id: ContextId) -> Result<&Context> {
        self.contexts.get(id).ok_or(KernelError::DoesNotExist)
    }

    pub fn context_mut(&mut self, id: ContextId) -> Result<&mut Context> {
        self.contexts.get_mut(id).ok_or(KernelError::DoesNotExist)
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.contexts.ids()
    }

    pub fn find_context(&self, address: &Address) -> Option<ContextId> {
        self.contexts.find(address)
    }

    pub fn current(&self) -> Option<ContextId> {
        self.current
    }

    /// Make `id` current for host-driven code; returns the previous one
    /// for [`leave`](Self::leave)
    pub fn enter(&mut self, id: ContextId) -> Result<Option<ContextId>> {
        if self.context(id)?.is_finished() {
            return Err(KernelError::ContextFinished);
        }
        Ok(self.current.replace(id))
    }

    pub fn leave(&mut self, previous: Option<ContextId>) {
        self.current = previous;
    }

    /// Address of the current context; the kernel's own outside any
    pub fn my_address(&self) -> Address {
        self.current
            .and_then(|id| self.contexts.get(id))
            .map_or(Address::KERNEL, |c| c.address())
    }

    pub fn scheduler_address(&self) -> Address {
        self.current
            .and_then(|id| self.contexts.get(id))
            .map_or(Address::KERNEL, |c| c.scheduler())
    }

    pub fn set_idle(&mut self, id: ContextId) -> Result<()> {
        self.context(id)?;
        self.idle = Some(id);
        Ok(())
    }

    pub fn idle(&self) -> Option<ContextId> {
        self.idle
    }

    /// Resume `target` until its body gives the CPU back
    ///
    /// A context whose body is absent (host-driven) or already running
    /// further up the stack is left alone.
    pub fn switch_to(&mut self, target: ContextId) -> Result<()> {
        let context = self.context_mut(target)?;
        if context.is_finished() {
            return Err(KernelError::ContextFinished);
        }
        let Some(mut body) = context.body.take() else {
            return Ok(());
        };

        let previous = self.current.replace(target);
        let step = body.resume(self);
        self.current = previous;

        let Some(context) = self.contexts.get_mut(target) else {
            return Ok(());
        };
        match step {
            Ok(Step::Yield) => {
                context.set_blocking(false);
                context.body = Some(body);
            }
            Ok(Step::Blocked) => {
                let idle = context.queue.is_empty();
                context.set_blocking(idle);
                context.body = Some(body);
            }
            Ok(Step::Exit) => {
                crate::debug!("context: {} exited", context.name());
                context.finish();
            }
            Err(e) => {
                crate::warn!("context: {} failed: {}", context.name(), e);
                context.finish();
            }
        }
        Ok(())
    }

    pub fn yield_to(&mut self, target: ContextId) -> Result<()> {
        self.switch_to(target)
    }

    // ---- packets ----

    /// Send from the current context. With `yield_to_recipient`, a
    /// recipient waiting for a packet runs before this returns.
    pub fn send(&mut self, mut packet: Packet, yield_to_recipient: bool) -> core::result::Result<(), Bounced> {
        packet.routing.src = self.my_address();
        self.deliver(packet, yield_to_recipient)
    }

    /// Send with the kernel as source; never switches contexts
    pub fn send_from_kernel(&mut self, mut packet: Packet) -> core::result::Result<(), Bounced> {
        packet.routing.src = Address::KERNEL;
        self.deliver(packet, false)
    }

    fn deliver(&mut self, packet: Packet, yield_to_recipient: bool) -> core::result::Result<(), Bounced> {
        let Some(id) = self.contexts.find(&packet.routing.dest) else {
            return Err(Bounced::new(KernelError::AddressUnreachable, packet));
        };

        let state = self.interrupts.block();
        let queued = match self.contexts.get_mut(id) {
            Some(context) if !context.is_finished() => {
                context.queue.enqueue(packet).map(|()| {
                    let was_blocking = context.is_blocking();
                    context.set_blocking(false);
                    was_blocking
                })
            }
            _ => Err(Bounced::new(KernelError::AddressUnreachable, packet)),
        };
        self.interrupts.restore(state);

        let was_blocking = queued?;
        if was_blocking && yield_to_recipient && self.current != Some(id) {
            if let Err(e) = self.switch_to(id) {
                crate::debug!("kernel: yield to recipient failed: {}", e);
            }
        }
        Ok(())
    }

    fn take_own(&mut self) -> Result<Option<Packet>> {
        let id = self.current.ok_or(KernelError::InvalidArg)?;
        Ok(self.context_mut(id)?.queue.dequeue(ANY_PROTOCOL))
    }

    /// Oldest packet queued for the current context
    pub fn receive(&mut self) -> Result<Packet> {
        self.dispatch_interrupts();
        match self.take_own()? {
            Some(packet) => Ok(packet),
            None => {
                if let Some(id) = self.current {
                    self.context_mut(id)?.set_blocking(true);
                }
                Err(KernelError::NoPacketAvailable)
            }
        }
    }

    /// Receive, and if nothing is queued give `target` a turn first
    pub fn receive_or_yield_to(&mut self, target: ContextId) -> Result<Packet> {
        self.dispatch_interrupts();
        if let Some(packet) = self.take_own()? {
            return Ok(packet);
        }
        let other = self.context(target)?;
        if other.is_finished() {
            return Err(KernelError::ContextFinished);
        }
        if other.is_blocking() {
            return Err(KernelError::YieldedToBlocked);
        }

        let me = self.current.ok_or(KernelError::InvalidArg)?;
        self.context_mut(me)?.set_blocking(true);
        let switched = self.switch_to(target);
        if let Ok(context) = self.context_mut(me) {
            context.set_blocking(false);
        }
        switched?;

        self.dispatch_interrupts();
        self.take_own()?.ok_or(KernelError::ContextYieldedBack)
    }

    // ---- interrupts ----

    /// Bind the interrupt behind public `alias` to `port` at the current
    /// context's address
    pub fn register_for(&mut self, alias: i32, port: u16) -> Result<InterruptId> {
        let id = interrupts::resolve(alias)?;
        self.register_interrupt(id, port)?;
        Ok(id)
    }

    /// Bind interrupt `id`, typically one from [`Kernel::allocate_interrupt`],
    /// to `port` at the current context's address
    pub fn register_interrupt(&mut self, id: InterruptId, port: u16) -> Result<()> {
        let address = self.my_address();
        self.interrupts.register(id, address, port)?;
        crate::debug!("interrupts: id {} -> {} port {}", id, address, port);
        Ok(())
    }

    pub fn unregister_for(&mut self, id: InterruptId) -> Result<()> {
        let address = self.my_address();
        self.interrupts.unregister(id, address)
    }

    pub fn interrupt_for(&self, id: InterruptId) -> Option<Registration> {
        self.interrupts.registration(id)
    }

    pub fn allocate_interrupt(&mut self) -> Result<(InterruptId, i32)> {
        self.interrupts.allocate()
    }

    pub fn deallocate_interrupt(&mut self, id: InterruptId) -> Result<()> {
        self.interrupts.deallocate(id)
    }

    pub fn raise_interrupt(&mut self, id: InterruptId) -> Result<()> {
        self.interrupts.raise(id)
    }

    pub fn raise_signal(&mut self, signum: i32) {
        self.interrupts.raise_signal(signum)
    }

    pub fn block_interrupts(&mut self) -> InterruptState {
        self.interrupts.block()
    }

    pub fn restore_interrupts(&mut self, state: InterruptState) {
        self.interrupts.restore(state)
    }

    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.pending()
    }

    pub fn signal_line(&self) -> SignalLine {
        self.interrupts.signal_line()
    }

    /// Whether a host timer drives the clock interrupt
    pub fn clock_running(&self) -> bool {
        self.clock_running
    }

    /// Turn pending interrupt events into packets for their registrants
    pub fn dispatch_interrupts(&mut self) {
        self.interrupts.collect_signals();
        while let Some(id) = self.interrupts.take_pending() {
            let Some(registration) = self.interrupts.registration(id) else {
                crate::trace!("interrupts: id {} has no registrant", id);
                continue;
            };
            let packet = match self.interrupt_packet(id, registration) {
                Ok(p) => p,
                Err(e) => {
                    crate::warn!("interrupts: cannot build packet for id {}: {}", id, e);
                    self.interrupts.requeue(id);
                    break;
                }
            };
            match self.deliver(packet, false) {
                Ok(()) => {}
                Err(bounced) if bounced.error == KernelError::QueueFull => {
                    // retried at the next dispatch point, once the registrant drains
                    crate::debug!("interrupts: {} full, holding id {}", registration.address, id);
                    self.interrupts.requeue(id);
                    break;
                }
                Err(bounced) => {
                    crate::debug!("interrupts: id {} to {} bounced: {}", id, registration.address, bounced);
                }
            }
        }
    }

    fn interrupt_packet(&self, id: InterruptId, to: Registration) -> Result<Packet> {
        let mut packet = self.pool.alloc()?;
        packet.routing.src = Address::KERNEL;
        packet.routing.dest = to.address;
        packet.ipv6.src = Address::KERNEL;
        packet.ipv6.dest = to.address;
        packet.append_header(HeaderKind::Udp, UdpHeader::SIZE)?;
        packet.set_data_len(InterruptMsg::SIZE)?;
        packet.data_mut().copy_from_slice(InterruptMsg::new(id).as_bytes());
        let udp = packet.udp_mut()?;
        udp.src_port = U16::new(0);
        udp.dest_port = U16::new(to.port);
        udp.length = U16::new((UdpHeader::SIZE + InterruptMsg::SIZE) as u16);
        checksum::fill(&mut packet, HeaderKind::Udp)?;
        Ok(packet)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if self.clock_running {
            if let Err(e) = host::stop_clock() {
                crate::warn!("kernel: stopping clock: {}", e);
            }
        }
    }
}
