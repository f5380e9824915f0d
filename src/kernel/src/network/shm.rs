//! Shared-memory interface
//!
//! Packets leave and enter the system through a segment shared with an
//! outside party. Each direction is a single slot guarded by its `valid`
//! flag: the producer writes only while the slot is invalid and raises a
//! signal once it is valid, the consumer copies the slot out, clears the
//! flag and signals back. Both signals reach the kernel side as interrupts
//! on two UDP ports, which the owning context services through
//! [`ShmIface::on_send_interrupt`] and [`ShmIface::on_receive_interrupt`].

use std::cell::RefCell;
use std::rc::Rc;

use pktos_shared::shm::{ShmBlock, SHM_MTU, SHM_RECEIVE_INTERRUPT_PORT, SHM_SEND_INTERRUPT_PORT};
use zerocopy::FromZeroes;

use crate::core::interrupts::{host, InterruptId, SignalLine};
use crate::core::Kernel;
use crate::error::{Bounced, KernelError, Result};
use crate::network::addr::{Address, AddressMask};
use crate::network::interface::{IfaceId, IfaceVariant, IpIface, Transport};
use crate::network::packet::{Ipv6Header, Packet};
use crate::network::queue::{PacketQueue, ANY_PROTOCOL};
use crate::network::stack::NetStack;
use crate::network::udp::UdpSocket;

/// Wire length of the datagram at the start of `data`
fn datagram_len(data: &[u8]) -> usize {
    let payload = u16::from_be_bytes([data[4], data[5]]) as usize;
    (Ipv6Header::SIZE + payload).min(SHM_MTU)
}

/// Segment living in host shared memory, attached for the interface's
/// lifetime
pub struct HostSegment {
    shmid: i32,
    block: *mut ShmBlock,
}

impl HostSegment {
    pub fn attach(key: i32) -> Result<Self> {
        // SAFETY: shmget has no memory-safety preconditions.
        let shmid = unsafe { libc::shmget(key as libc::key_t, ShmBlock::SIZE, libc::IPC_CREAT | 0o600) };
        if shmid < 0 {
            return Err(KernelError::last_os_error());
        }
        // SAFETY: shmid names a segment of at least ShmBlock::SIZE bytes.
        let ptr = unsafe { libc::shmat(shmid, core::ptr::null(), 0) };
        if ptr as isize == -1 {
            let err = KernelError::last_os_error();
            // SAFETY: removing a segment we just created.
            unsafe { libc::shmctl(shmid, libc::IPC_RMID, core::ptr::null_mut()) };
            return Err(err);
        }
        crate::info!("shm: attached segment {:#x} (id {})", key as u32, shmid);
        Ok(HostSegment { shmid, block: ptr.cast() })
    }
}

impl Drop for HostSegment {
    fn drop(&mut self) {
        // SAFETY: block was returned by shmat and is detached exactly once.
        unsafe {
            libc::shmdt(self.block as *const libc::c_void);
            libc::shmctl(self.shmid, libc::IPC_RMID, core::ptr::null_mut());
        }
    }
}

/// Segment shared with a [`ShmPeer`] in the same process
pub struct LocalSegment {
    block: Rc<RefCell<ShmBlock>>,
    /// Signals raised towards the peer
    outside: SignalLine,
}

pub enum ShmSegment {
    Host(HostSegment),
    Local(LocalSegment),
}

impl ShmSegment {
    pub fn host(key: i32) -> Result<Self> {
        HostSegment::attach(key).map(ShmSegment::Host)
    }

    /// In-process segment and the peer that plays the outside party.
    /// The peer signals the kernel on `kernel`'s signal line.
    pub fn local(kernel: &Kernel) -> (Self, ShmPeer) {
        let block = Rc::new(RefCell::new(ShmBlock::new_zeroed()));
        let outside = SignalLine::new();
        let peer = ShmPeer {
            block: Rc::clone(&block),
            kernel: kernel.signal_line(),
            inbox: outside.clone(),
        };
        (ShmSegment::Local(LocalSegment { block, outside }), peer)
    }

    fn with_block<R>(&mut self, f: impl FnOnce(&mut ShmBlock) -> R) -> R {
        match self {
            // SAFETY: the segment stays attached while `self` lives and the
            // kernel side only touches it from this thread.
            ShmSegment::Host(h) => f(unsafe { &mut *h.block }),
            ShmSegment::Local(l) => f(&mut l.block.borrow_mut()),
        }
    }

    fn signal_outside(&mut self, signum: i32) -> Result<()> {
        if let ShmSegment::Local(l) = self {
            l.outside.raise(signum);
            return Ok(());
        }
        let pid = self.with_block(|b| b.outside_pid.get());
        if pid == 0 {
            crate::trace!("shm: no outside party to signal");
            return Ok(());
        }
        host::send(pid, signum)
    }
}

/// The outside party of a [`LocalSegment`]
pub struct ShmPeer {
    block: Rc<RefCell<ShmBlock>>,
    kernel: SignalLine,
    inbox: SignalLine,
}

impl ShmPeer {
    /// Whether the kernel has published a datagram not yet taken
    pub fn outgoing_ready(&self) -> bool {
        self.block.borrow().send.buff.is_valid()
    }

    /// Take the published datagram, free the slot and tell the kernel
    pub fn take_outgoing(&self) -> Option<Vec<u8>> {
        let (bytes, signum) = {
            let mut block = self.block.borrow_mut();
            let channel = &mut block.send;
            if !channel.buff.is_valid() {
                return None;
            }
            let len = datagram_len(&channel.buff.data);
            let bytes = channel.buff.data[..len].to_vec();
            channel.buff.valid = 0;
            (bytes, channel.signum_to_kernel.get())
        };
        self.kernel.raise(signum);
        Some(bytes)
    }

    /// Hand a datagram to the kernel; ResourceInUse while the previous one
    /// is still in the slot
    pub fn push_incoming(&self, datagram: &[u8]) -> Result<()> {
        if datagram.len() < Ipv6Header::SIZE || datagram.len() > SHM_MTU {
            return Err(KernelError::InvalidArg);
        }
        let signum = {
            let mut block = self.block.borrow_mut();
            let channel = &mut block.receive;
            if channel.buff.is_valid() {
                return Err(KernelError::ResourceInUse);
            }
            channel.buff.data[..datagram.len()].copy_from_slice(datagram);
            channel.buff.valid = 1;
            channel.signum_to_kernel.get()
        };
        self.kernel.raise(signum);
        Ok(())
    }

    /// Signals the kernel raised towards this peer
    pub fn signals(&self) -> Vec<i32> {
        self.inbox.drain()
    }
}

struct Half {
    queue: PacketQueue,
    socket: UdpSocket,
    irq: InterruptId,
}

pub struct ShmIface {
    segment: ShmSegment,
    send: Half,
    receive: Half,
    /// The outside party has acknowledged the last published slot
    signalled: bool,
}

fn half_open(stack: &mut NetStack, kernel: &mut Kernel, port: u16) -> Result<(Half, i32)> {
    let socket = UdpSocket::new(stack);
    if let Err(e) = socket.bind(stack, kernel.my_address(), port) {
        release_socket(stack, socket);
        return Err(e);
    }
    let (irq, signum) = match kernel.allocate_interrupt() {
        Ok(found) => found,
        Err(e) => {
            release_socket(stack, socket);
            return Err(e);
        }
    };
    if let Err(e) = kernel.register_interrupt(irq, port) {
        release_irq(kernel, irq);
        release_socket(stack, socket);
        return Err(e);
    }
    let half = Half {
        queue: PacketQueue::new(stack.queue_len()),
        socket,
        irq,
    };
    Ok((half, signum))
}

fn half_close(stack: &mut NetStack, kernel: &mut Kernel, half: &Half) {
    release_irq(kernel, half.irq);
    release_socket(stack, half.socket);
}

fn release_irq(kernel: &mut Kernel, irq: InterruptId) {
    if let Err(e) = kernel.deallocate_interrupt(irq) {
        crate::warn!("shm: releasing interrupt {}: {}", irq, e);
    }
}

fn release_socket(stack: &mut NetStack, socket: UdpSocket) {
    if let Err(e) = socket.close(stack) {
        crate::warn!("shm: closing interrupt socket: {}", e);
    }
}

impl ShmIface {
    /// Open a shared-memory interface at `addr` covering `mask` and
    /// register it with `stack`
    ///
    /// The interrupt sockets bind to the current context's address, so the
    /// stack needs an interface owning that address first.
    pub fn open(
        stack: &mut NetStack,
        kernel: &mut Kernel,
        addr: Address,
        mask: AddressMask,
        mut segment: ShmSegment,
    ) -> Result<IfaceId> {
        let (send, send_signum) = half_open(stack, kernel, SHM_SEND_INTERRUPT_PORT)?;
        let (receive, receive_signum) = match half_open(stack, kernel, SHM_RECEIVE_INTERRUPT_PORT) {
            Ok(found) => found,
            Err(e) => {
                half_close(stack, kernel, &send);
                return Err(e);
            }
        };

        segment.with_block(|b| {
            b.send.signum_to_kernel.set(send_signum);
            b.receive.signum_to_kernel.set(receive_signum);
            if b.send.signum_to_outside.get() == 0 {
                b.send.signum_to_outside.set(libc::SIGUSR1);
            }
            if b.receive.signum_to_outside.get() == 0 {
                b.receive.signum_to_outside.set(libc::SIGUSR2);
            }
            b.kernel_pid.set(std::process::id() as i32);
            b.send.buff.valid = 0;
            b.receive.buff.valid = 0;
        });

        let halves = [(send.irq, send.socket), (receive.irq, receive.socket)];
        let shm = ShmIface { segment, send, receive, signalled: true };
        let iface = IpIface::new("shm", addr, mask, stack.queue_len(), IfaceVariant::Shm(shm));
        stack.register(iface).map_err(|e| {
            for (irq, socket) in halves {
                release_irq(kernel, irq);
                release_socket(stack, socket);
            }
            e
        })
    }

    pub fn send_interrupt_socket(&self) -> UdpSocket {
        self.send.socket
    }

    pub fn receive_interrupt_socket(&self) -> UdpSocket {
        self.receive.socket
    }

    pub(crate) fn interrupt_sockets(&self) -> [UdpSocket; 2] {
        [self.send.socket, self.receive.socket]
    }

    /// Packets waiting for the outside party to free the send slot
    pub fn backlog(&self) -> usize {
        self.send.queue.len()
    }

    /// Copy `packet` into the send slot and signal the outside party
    pub fn publish(&mut self, packet: &Packet) -> Result<()> {
        let datagram = packet.datagram();
        let signum = self.segment.with_block(|b| {
            if b.send.buff.is_valid() {
                return Err(KernelError::ResourceInUse);
            }
            b.send.buff.data[..datagram.len()].copy_from_slice(datagram);
            b.send.buff.valid = 1;
            Ok(b.send.signum_to_outside.get())
        })?;
        self.segment.signal_outside(signum)
    }

    /// The outside party freed the send slot
    pub fn on_send_interrupt(&mut self) -> Result<()> {
        match self.send.queue.dequeue(ANY_PROTOCOL) {
            Some(packet) => self.publish(&packet),
            None => {
                self.signalled = true;
                Ok(())
            }
        }
    }

    /// The outside party filled the receive slot
    pub fn on_receive_interrupt(&mut self, kernel: &Kernel) -> Result<()> {
        let mut packet = kernel.packet_alloc()?;
        let (copied, signum) = self.segment.with_block(|b| {
            if !b.receive.buff.is_valid() {
                return (Ok(false), 0);
            }
            let len = datagram_len(&b.receive.buff.data);
            let copied = packet.set_datagram(&b.receive.buff.data[..len]).map(|()| true);
            b.receive.buff.valid = 0;
            (copied, b.receive.signum_to_outside.get())
        });
        if !copied? {
            crate::trace!("shm: receive interrupt with an empty slot");
            return Ok(());
        }

        packet.routing.src = packet.ipv6.src;
        packet.routing.dest = packet.ipv6.dest;
        if let Err(bounced) = self.receive.queue.enqueue(packet) {
            crate::warn!("shm: receive queue full, dropping datagram");
            return Err(bounced.error);
        }
        self.segment.signal_outside(signum)
    }
}

impl Transport for ShmIface {
    fn send(&mut self, _kernel: &mut Kernel, packet: Packet) -> core::result::Result<(), Bounced> {
        if !self.signalled {
            return self.send.queue.enqueue(packet);
        }
        match self.publish(&packet) {
            Ok(()) => {
                self.signalled = false;
                Ok(())
            }
            Err(e) => Err(Bounced::new(e, packet)),
        }
    }

    fn receive(&mut self, _kernel: &mut Kernel) -> Result<Packet> {
        let mut packet = self
            .receive
            .queue
            .dequeue(ANY_PROTOCOL)
            .ok_or(KernelError::NoPacketAvailable)?;
        packet.ipv6.hop_limit = packet.ipv6.hop_limit.saturating_sub(1);
        if packet.ipv6.hop_limit == 0 {
            return Err(KernelError::HopLimitExceeded);
        }
        Ok(packet)
    }

    fn close(&mut self, kernel: &mut Kernel) -> Result<()> {
        let send = kernel.deallocate_interrupt(self.send.irq);
        let receive = kernel.deallocate_interrupt(self.receive.irq);
        send.and(receive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SchedulerMetadata;
    use crate::testing::{test_kernel, udp_packet};

    fn router_addr() -> Address {
        "7e8f::1".parse().unwrap()
    }

    fn nonnative() -> AddressMask {
        "7e8f::/16".parse().unwrap()
    }

    fn open(kernel: &mut Kernel) -> (NetStack, IfaceId, IfaceId, ShmPeer) {
        let me = kernel.spawn_host("router", SchedulerMetadata::daemon()).unwrap();
        kernel.enter(me).unwrap();
        let mut stack = NetStack::for_kernel(kernel);
        let native = stack.open_native(kernel).unwrap();
        let (segment, peer) = ShmSegment::local(kernel);
        let shm = ShmIface::open(&mut stack, kernel, router_addr(), nonnative(), segment).unwrap();
        (stack, native, shm, peer)
    }

    fn shm(stack: &mut NetStack, id: IfaceId) -> &mut ShmIface {
        stack.iface_mut(id).unwrap().shm_mut().unwrap()
    }

    #[test]
    fn slot_is_never_overwritten() {
        let mut kernel = test_kernel();
        let (mut stack, _, id, peer) = open(&mut kernel);
        let me = kernel.my_address();
        let outside: Address = "7e8f::9".parse().unwrap();
        assert!(!peer.outgoing_ready());

        let first = udp_packet(&kernel, me, outside, 9, b"one");
        stack.send_on(&mut kernel, id, first).unwrap();
        assert!(peer.outgoing_ready());
        assert_eq!(peer.signals(), vec![libc::SIGUSR1]);

        // slot still valid: the second datagram waits
        let second = udp_packet(&kernel, me, outside, 9, b"two");
        stack.send_on(&mut kernel, id, second).unwrap();
        assert_eq!(shm(&mut stack, id).backlog(), 1);
        let third = udp_packet(&kernel, me, outside, 9, b"three");
        assert_eq!(shm(&mut stack, id).publish(&third), Err(KernelError::ResourceInUse));

        let bytes = peer.take_outgoing().unwrap();
        assert!(bytes.ends_with(b"one"));
        assert!(!peer.outgoing_ready());

        // the peer's signal arrives as a packet on the send interrupt port
        let sock = shm(&mut stack, id).send_interrupt_socket();
        let irq = sock.receive(&mut stack, &mut kernel, true).unwrap();
        assert_eq!(irq.udp().unwrap().dest_port.get(), SHM_SEND_INTERRUPT_PORT);
        shm(&mut stack, id).on_send_interrupt().unwrap();
        assert_eq!(shm(&mut stack, id).backlog(), 0);
        assert!(peer.take_outgoing().unwrap().ends_with(b"two"));
    }

    #[test]
    fn incoming_datagrams_are_queued_and_acknowledged() {
        let mut kernel = test_kernel();
        let (mut stack, _, id, peer) = open(&mut kernel);
        let me = kernel.my_address();
        let outside: Address = "7e8f::9".parse().unwrap();
        let wire = udp_packet(&kernel, outside, me, 5, b"in");

        peer.push_incoming(wire.datagram()).unwrap();
        assert_eq!(peer.push_incoming(wire.datagram()), Err(KernelError::ResourceInUse));

        let sock = shm(&mut stack, id).receive_interrupt_socket();
        assert!(sock.receive(&mut stack, &mut kernel, true).is_ok());
        shm(&mut stack, id).on_receive_interrupt(&kernel).unwrap();
        assert_eq!(peer.signals(), vec![libc::SIGUSR2]);
        peer.push_incoming(wire.datagram()).unwrap();

        let got = stack.receive_on_unfiltered(&mut kernel, id).unwrap();
        assert_eq!(got.ipv6.src, outside);
        assert_eq!(got.routing.dest, me);
        assert_eq!(got.ipv6.hop_limit, wire.ipv6.hop_limit - 1);
        assert_eq!(got.data(), b"in");
    }

    #[test]
    fn exhausted_hop_limit_is_refused() {
        let mut kernel = test_kernel();
        let (mut stack, _, id, peer) = open(&mut kernel);
        let me = kernel.my_address();
        let mut wire = udp_packet(&kernel, "7e8f::9".parse().unwrap(), me, 5, b"x");
        wire.ipv6.hop_limit = 1;
        peer.push_incoming(wire.datagram()).unwrap();
        kernel.dispatch_interrupts();
        shm(&mut stack, id).on_receive_interrupt(&kernel).unwrap();
        assert_eq!(
            stack.receive_on_unfiltered(&mut kernel, id).unwrap_err(),
            KernelError::HopLimitExceeded
        );
    }

    #[test]
    fn unregister_releases_interrupts() {
        let mut kernel = test_kernel();
        let (mut stack, _, id, _peer) = open(&mut kernel);
        stack.unregister(&mut kernel, id).unwrap();
        assert!(kernel.interrupt_for(2).is_none());
        let (again, _) = ShmSegment::local(&kernel);
        ShmIface::open(&mut stack, &mut kernel, router_addr(), nonnative(), again).unwrap();
    }

    #[test]
    fn close_releases_both_interrupts_even_after_a_failure() {
        let mut kernel = test_kernel();
        let (mut stack, _, id, _peer) = open(&mut kernel);
        let (send_irq, receive_irq) = {
            let shm = shm(&mut stack, id);
            (shm.send.irq, shm.receive.irq)
        };
        kernel.deallocate_interrupt(send_irq).unwrap();

        assert_eq!(stack.unregister(&mut kernel, id).unwrap_err(), KernelError::ResourceNotInUse);
        assert!(kernel.interrupt_for(receive_irq).is_none());
        assert_eq!(kernel.deallocate_interrupt(receive_irq), Err(KernelError::ResourceNotInUse));
        kernel.allocate_interrupt().unwrap();
        kernel.allocate_interrupt().unwrap();
    }
}
