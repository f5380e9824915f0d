//! IP layer: interface selection, hop limits, validation and filtering

use crate::core::Kernel;
use crate::error::{Bounced, KernelError, Result};
use crate::network::filter::{FilterDirection, Verdict};
use crate::network::icmp::{self, IcmpMessage, ParamProblemCode};
use crate::network::interface::{IfaceId, Transport};
use crate::network::ipv6::{self, Rejection};
use crate::network::packet::Packet;
use crate::network::queue::ANY_PROTOCOL;
use crate::network::stack::NetStack;

type SendResult = core::result::Result<(), Bounced>;

impl NetStack {
    /// Send out of a specific interface
    ///
    /// Decrements the hop limit and runs the interface's outbound filters.
    /// A packet consumed by a filter counts as sent.
    pub fn send_on(&mut self, kernel: &mut Kernel, iface: IfaceId, mut packet: Packet) -> SendResult {
        if self.iface(iface).is_err() {
            return Err(Bounced::new(KernelError::DoesNotExist, packet));
        }
        if packet.ipv6.hop_limit == 0 {
            return Err(Bounced::new(KernelError::HopLimitExceeded, packet));
        }
        packet.ipv6.hop_limit -= 1;

        let packet = match self.apply_filters(kernel, iface, FilterDirection::Outbound, packet) {
            Verdict::Pass(p) => p,
            Verdict::Error(e) => return Err(Bounced::lost(e)),
            _ => return Ok(()),
        };

        let bytes = packet.datagram().len();
        let entry = self.iface_mut(iface).map_err(Bounced::lost)?;
        match entry.variant.send(kernel, packet) {
            Ok(()) => {
                entry.stats.record_tx(bytes);
                Ok(())
            }
            Err(bounced) => {
                entry.stats.tx_errors += 1;
                Err(bounced)
            }
        }
    }

    /// Send by destination: the interface whose mask covers it, else the
    /// default route
    pub fn ip_send(&mut self, kernel: &mut Kernel, mut packet: Packet) -> SendResult {
        let dest = packet.ipv6.dest;
        if let Some(iface) = self.lookup_send(&dest) {
            packet.routing.dest = dest;
            return self.send_on(kernel, iface, packet);
        }
        match self.default_route() {
            Some(route) => {
                packet.routing.dest = route.addr;
                self.send_on(kernel, route.iface, packet)
            }
            None => Err(Bounced::new(KernelError::NoRouteToHost, packet)),
        }
    }

    /// Next packet from the interface's transport, validated but not
    /// filtered. Datagrams carrying an unrecognised option that asks for it
    /// are answered with ICMP Parameter Problem.
    pub fn receive_on_unfiltered(&mut self, kernel: &mut Kernel, iface: IfaceId) -> Result<Packet> {
        let packet = self.iface_mut(iface)?.variant.receive(kernel)?;
        match ipv6::validate(&packet) {
            Ok(()) => {
                self.iface_mut(iface)?.stats.record_rx(&packet);
                Ok(packet)
            }
            Err(rejection) => {
                self.iface_mut(iface)?.stats.rx_errors += 1;
                crate::debug!("ip: rejected datagram from {}: {}", packet.ipv6.src, rejection.error());
                if let Rejection::ParameterProblem { pointer, .. } = rejection {
                    let message = IcmpMessage::ParameterProblem { code: ParamProblemCode::Option, pointer };
                    if let Err(e) = icmp::send_error(self, kernel, iface, &packet, message) {
                        crate::debug!("ip: parameter problem not sent: {}", e);
                    }
                }
                Err(rejection.error())
            }
        }
    }

    /// Receive a packet of `protocol` ([`ANY_PROTOCOL`] for any) on `iface`
    ///
    /// Packets of other protocols are parked on the interface queue for
    /// their consumers and `None` is returned.
    pub fn receive_on(&mut self, kernel: &mut Kernel, iface: IfaceId, protocol: u8) -> Result<Option<Packet>> {
        if let Some(packet) = self.iface_mut(iface)?.queue.dequeue(protocol) {
            return Ok(Some(packet));
        }

        let packet = self.receive_on_unfiltered(kernel, iface)?;
        let packet = match self.apply_filters(kernel, iface, FilterDirection::Inbound, packet) {
            Verdict::Pass(p) => p,
            Verdict::Error(e) => return Err(e),
            _ => return Err(KernelError::PacketFilteredOut),
        };

        if protocol != ANY_PROTOCOL && packet.protocol() != protocol {
            if let Err(bounced) = self.iface_mut(iface)?.queue.enqueue(packet) {
                crate::warn!("ip: interface queue full, dropping {:?}", bounced.packet);
            }
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// Receive a packet of `protocol` addressed to the current context
    ///
    /// With `stop`, give up with `StoppedForOtherSocket` after one round
    /// that only produced packets for other consumers.
    pub fn ip_receive(&mut self, kernel: &mut Kernel, protocol: u8, stop: bool) -> Result<(Packet, IfaceId)> {
        let iface = self
            .lookup_receive(&kernel.my_address())
            .ok_or(KernelError::DoesNotExist)?;
        let mut first = true;
        loop {
            if !first && stop {
                return Err(KernelError::StoppedForOtherSocket);
            }
            first = false;

            if let Some(packet) = self.receive_on(kernel, iface, protocol)? {
                return Ok((packet, iface));
            }
            match self.dequeue_from_any(protocol) {
                Ok(found) => return Ok(found),
                Err(KernelError::QueueEmpty) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
