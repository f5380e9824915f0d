//! UDP sockets
//!
//! Sockets live in their context's [`NetStack`]; a [`UdpSocket`] is a
//! small copyable handle onto one. Receiving on one socket may turn up
//! datagrams for a sibling socket, which are moved to that socket's queue.

use zerocopy::byteorder::network_endian::U16;

use crate::core::Kernel;
use crate::error::{Bounced, KernelError, Result};
use crate::memory::arena::Handle;
use crate::network::addr::Address;
use crate::network::checksum;
use crate::network::icmp::{self, DestUnreachCode, IcmpMessage};
use crate::network::interface::IfaceId;
use crate::network::packet::{HeaderKind, Packet, UdpHeader};
use crate::network::queue::{PacketQueue, ANY_PROTOCOL};
use crate::network::stack::NetStack;

pub struct SocketState {
    pub(crate) iface: Option<IfaceId>,
    addr: Address,
    port: u16,
    queue: PacketQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSocket(Handle<SocketState>);

impl NetStack {
    /// Bound socket for `port` at `addr`; a zero address on either side
    /// matches any
    pub fn seek_socket(&self, addr: &Address, port: u16) -> Option<UdpSocket> {
        if port == 0 {
            return None;
        }
        self.sockets
            .iter()
            .find(|(_, s)| s.port == port && (s.addr.is_zero() || addr.is_zero() || s.addr == *addr))
            .map(|(h, _)| UdpSocket(h))
    }

    fn socket(&self, socket: UdpSocket) -> Result<&SocketState> {
        self.sockets.get(socket.0).ok_or(KernelError::InvalidArg)
    }

    fn socket_mut(&mut self, socket: UdpSocket) -> Result<&mut SocketState> {
        self.sockets.get_mut(socket.0).ok_or(KernelError::InvalidArg)
    }
}

impl UdpSocket {
    pub fn new(stack: &mut NetStack) -> Self {
        let queue = PacketQueue::new(stack.queue_len());
        UdpSocket(stack.sockets.insert(SocketState {
            iface: None,
            addr: Address::ZERO,
            port: 0,
            queue,
        }))
    }

    /// Close the socket; datagrams still queued are dropped
    pub fn close(self, stack: &mut NetStack) -> Result<()> {
        stack.sockets.remove(self.0).map(drop).ok_or(KernelError::InvalidArg)
    }

    /// Bind to `addr` (zero for every interface) and `port` (zero for an
    /// anonymous port)
    pub fn bind(self, stack: &mut NetStack, addr: Address, port: u16) -> Result<()> {
        if stack.socket(self)?.port != 0 {
            return Err(KernelError::InvalidArg);
        }
        let iface = if addr.is_zero() {
            None
        } else {
            Some(stack.lookup_receive(&addr).ok_or(KernelError::DoesNotExist)?)
        };

        let port = if port == 0 {
            let from = iface.or_else(|| stack.first()).ok_or(KernelError::DoesNotExist)?;
            let mut cursor = stack.iface(from)?.anon_ports;
            let port = cursor.next(HeaderKind::Udp, |p| stack.seek_socket(&addr, p).is_some())?;
            stack.iface_mut(from)?.anon_ports = cursor;
            port
        } else {
            if stack.seek_socket(&addr, port).is_some() {
                return Err(KernelError::PortAlreadyBound);
            }
            port
        };

        let state = stack.socket_mut(self)?;
        state.iface = iface;
        state.addr = addr;
        state.port = port;
        crate::trace!("udp: bound {}:{}", addr, port);
        Ok(())
    }

    pub fn local_port(self, stack: &NetStack) -> Result<u16> {
        match stack.socket(self)?.port {
            0 => Err(KernelError::SocketNotBound),
            port => Ok(port),
        }
    }

    pub fn local_addr(self, stack: &NetStack) -> Result<Address> {
        Ok(stack.socket(self)?.addr)
    }

    /// Fresh packet with the UDP header in place and `data_len` bytes of
    /// zeroed data
    pub fn packet_new(self, stack: &NetStack, kernel: &Kernel, data_len: usize) -> Result<Packet> {
        let state = stack.socket(self)?;
        if state.port == 0 {
            return Err(KernelError::SocketNotBound);
        }
        let src = match state.iface {
            Some(iface) => stack.iface(iface)?.addr(),
            None => kernel.my_address(),
        };
        let mut packet = kernel.packet_alloc()?;
        packet.ipv6.src = src;
        packet.append_header(HeaderKind::Udp, UdpHeader::SIZE)?;
        packet.set_data_len(data_len)?;
        let udp = packet.udp_mut()?;
        udp.src_port = U16::new(state.port);
        udp.length = U16::new((UdpHeader::SIZE + data_len) as u16);
        Ok(packet)
    }

    /// Fill in ports, length and checksum and send
    ///
    /// A datagram addressed to its own source is handed straight to the
    /// matching socket.
    pub fn send(self, stack: &mut NetStack, kernel: &mut Kernel, mut packet: Packet) -> core::result::Result<(), Bounced> {
        let (port, iface) = match stack.socket(self) {
            Ok(s) if s.port != 0 => (s.port, s.iface),
            Ok(_) => return Err(Bounced::new(KernelError::SocketNotBound, packet)),
            Err(e) => return Err(Bounced::new(e, packet)),
        };
        let data_len = packet.data_len();
        let dest_port = match packet.udp_mut() {
            Ok(udp) => {
                udp.src_port = U16::new(port);
                udp.length = U16::new((UdpHeader::SIZE + data_len) as u16);
                udp.dest_port.get()
            }
            Err(_) => return Err(Bounced::new(KernelError::WrongProtocol, packet)),
        };
        if dest_port == 0 {
            return Err(Bounced::new(KernelError::NoDestPort, packet));
        }
        if let Err(e) = checksum::fill(&mut packet, HeaderKind::Udp) {
            return Err(Bounced::new(e, packet));
        }

        if packet.ipv6.src == packet.ipv6.dest {
            let Some(other) = stack.seek_socket(&packet.ipv6.dest, dest_port) else {
                return Err(Bounced::new(KernelError::NoDestPort, packet));
            };
            return match stack.socket_mut(other) {
                Ok(s) => s.queue.enqueue(packet),
                Err(e) => Err(Bounced::new(e, packet)),
            };
        }

        match iface {
            Some(iface) => {
                packet.routing.dest = packet.ipv6.dest;
                stack.send_on(kernel, iface, packet)
            }
            None => stack.ip_send(kernel, packet),
        }
    }

    /// Next datagram for this socket
    ///
    /// Datagrams for other ports are moved to their socket or refused with
    /// ICMP Port Unreachable. With `stop`, give up with
    /// `StoppedForOtherSocket` after a round that only turned up such
    /// datagrams.
    pub fn receive(self, stack: &mut NetStack, kernel: &mut Kernel, stop: bool) -> Result<Packet> {
        let (port, bound_iface) = {
            let state = stack.socket_mut(self)?;
            if state.port == 0 {
                return Err(KernelError::SocketNotBound);
            }
            if let Some(packet) = state.queue.dequeue(ANY_PROTOCOL) {
                return Ok(packet);
            }
            (state.port, state.iface)
        };

        let mut first = true;
        loop {
            if !first && stop {
                return Err(KernelError::StoppedForOtherSocket);
            }
            first = false;

            let received = match bound_iface {
                Some(iface) => stack
                    .receive_on(kernel, iface, HeaderKind::Udp as u8)
                    .map(|p| p.map(|p| (p, iface))),
                None => stack.ip_receive(kernel, HeaderKind::Udp as u8, stop).map(Some),
            };
            let (packet, iface) = match received {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(KernelError::ContextYieldedBack | KernelError::PacketFilteredOut) => continue,
                Err(e) => return Err(e),
            };

            let Ok(udp) = packet.udp() else {
                crate::debug!("udp: non-UDP packet from {} dropped", packet.ipv6.src);
                continue;
            };
            let dest_port = udp.dest_port.get();
            let sent_sum = udp.checksum.get();
            if sent_sum != 0 && !checksum::verify(&packet, HeaderKind::Udp).unwrap_or(false) {
                crate::debug!("udp: checksum mismatch from {} (sent {:#06x})", packet.ipv6.src, sent_sum);
            }
            if dest_port == port {
                return Ok(packet);
            }
            self.redirect(stack, kernel, iface, packet, dest_port);
        }
    }

    fn redirect(self, stack: &mut NetStack, kernel: &mut Kernel, iface: IfaceId, packet: Packet, dest_port: u16) {
        match stack.seek_socket(&packet.ipv6.dest, dest_port) {
            Some(other) => {
                let queued = match stack.socket_mut(other) {
                    Ok(s) => s.queue.enqueue(packet).map_err(|b| b.error),
                    Err(e) => Err(e),
                };
                if let Err(e) = queued {
                    crate::debug!("udp: datagram for port {} dropped: {}", dest_port, e);
                }
            }
            None => {
                let unreachable = IcmpMessage::DestinationUnreachable(DestUnreachCode::Port);
                if let Err(e) = icmp::send_error(stack, kernel, iface, &packet, unreachable) {
                    crate::debug!("udp: port unreachable not sent: {}", e);
                }
            }
        }
    }

    pub fn receive_pending(self, stack: &NetStack) -> Result<bool> {
        Ok(stack.socket(self)?.queue.non_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SchedulerMetadata;
    use crate::testing::{test_kernel, udp_packet};

    fn setup(kernel: &mut Kernel) -> (NetStack, IfaceId) {
        let me = kernel.spawn_host("me", SchedulerMetadata::worker()).unwrap();
        kernel.enter(me).unwrap();
        let mut stack = NetStack::for_kernel(kernel);
        let native = stack.open_native(kernel).unwrap();
        (stack, native)
    }

    #[test]
    fn binding_rules() {
        let mut kernel = test_kernel();
        let (mut stack, _) = setup(&mut kernel);
        let a = UdpSocket::new(&mut stack);
        let b = UdpSocket::new(&mut stack);
        assert_eq!(a.local_port(&stack), Err(KernelError::SocketNotBound));
        a.bind(&mut stack, Address::ZERO, 7000).unwrap();
        assert_eq!(b.bind(&mut stack, Address::ZERO, 7000), Err(KernelError::PortAlreadyBound));
        assert_eq!(a.bind(&mut stack, Address::ZERO, 7001), Err(KernelError::InvalidArg));
        b.bind(&mut stack, Address::ZERO, 0).unwrap();
        assert_eq!(b.local_port(&stack), Ok(1025));
        let c = UdpSocket::new(&mut stack);
        c.bind(&mut stack, Address::ZERO, 0).unwrap();
        assert_eq!(c.local_port(&stack), Ok(1026));
        let far: Address = "7e8e::77".parse().unwrap();
        assert_eq!(UdpSocket::new(&mut stack).bind(&mut stack, far, 1), Err(KernelError::DoesNotExist));
    }

    #[test]
    fn send_requires_destination_port() {
        let mut kernel = test_kernel();
        let (mut stack, _) = setup(&mut kernel);
        let s = UdpSocket::new(&mut stack);
        s.bind(&mut stack, Address::ZERO, 0).unwrap();
        let mut p = s.packet_new(&stack, &kernel, 4).unwrap();
        p.ipv6.dest = "7e8e::1".parse().unwrap();
        let bounced = s.send(&mut stack, &mut kernel, p).unwrap_err();
        assert_eq!(bounced.error, KernelError::NoDestPort);
    }

    #[test]
    fn loopback_reaches_the_sibling_socket() {
        let mut kernel = test_kernel();
        let (mut stack, _) = setup(&mut kernel);
        let me = kernel.my_address();
        let server = UdpSocket::new(&mut stack);
        server.bind(&mut stack, Address::ZERO, 4000).unwrap();
        let client = UdpSocket::new(&mut stack);
        client.bind(&mut stack, Address::ZERO, 0).unwrap();

        let mut p = client.packet_new(&stack, &kernel, 3).unwrap();
        p.ipv6.dest = me;
        p.udp_mut().unwrap().dest_port = U16::new(4000);
        p.data_mut().copy_from_slice(b"abc");
        client.send(&mut stack, &mut kernel, p).unwrap();

        assert!(server.receive_pending(&stack).unwrap());
        let got = server.receive(&mut stack, &mut kernel, true).unwrap();
        assert_eq!(got.data(), b"abc");
        assert_eq!(got.udp().unwrap().src_port.get(), 1025);
        assert!(checksum::verify(&got, HeaderKind::Udp).unwrap());
    }

    #[test]
    fn receive_redirects_and_stops() {
        let mut kernel = test_kernel();
        let (mut stack, _) = setup(&mut kernel);
        let me = kernel.my_address();
        let ticks = UdpSocket::new(&mut stack);
        ticks.bind(&mut stack, Address::ZERO, 7000).unwrap();
        let requests = UdpSocket::new(&mut stack);
        requests.bind(&mut stack, Address::ZERO, 4000).unwrap();

        let p = udp_packet(&kernel, me, me, 4000, b"req");
        kernel.send(p, false).unwrap();
        assert_eq!(
            ticks.receive(&mut stack, &mut kernel, true).unwrap_err(),
            KernelError::StoppedForOtherSocket
        );
        assert!(requests.receive_pending(&stack).unwrap());
        assert_eq!(requests.receive(&mut stack, &mut kernel, true).unwrap().data(), b"req");
    }

    #[test]
    fn unknown_port_is_refused_with_icmp() {
        let mut kernel = test_kernel();
        let peer = kernel.spawn_host("peer", SchedulerMetadata::worker()).unwrap();
        let peer_addr = kernel.context(peer).unwrap().address();
        let (mut stack, _) = setup(&mut kernel);
        let me = kernel.my_address();
        let s = UdpSocket::new(&mut stack);
        s.bind(&mut stack, Address::ZERO, 7000).unwrap();

        let prev = kernel.enter(peer).unwrap();
        let p = udp_packet(&kernel, peer_addr, me, 5555, b"?");
        kernel.send(p, false).unwrap();
        kernel.leave(prev);

        assert_eq!(
            s.receive(&mut stack, &mut kernel, true).unwrap_err(),
            KernelError::StoppedForOtherSocket
        );
        kernel.enter(peer).unwrap();
        let report = kernel.receive().unwrap();
        assert_eq!(
            icmp::message(&report),
            Some(IcmpMessage::DestinationUnreachable(DestUnreachCode::Port))
        );
        drop(report);
        assert_eq!(kernel.packets_in_use(), 0);
    }
}
