//! ICMPv6 messages
//!
//! Error reports quote the offending datagram back to its sender. Every
//! interface answers echo requests addressed to it through [`EchoFilter`];
//! all other ICMP traffic is left to the receiver.

use zerocopy::byteorder::network_endian::U16;

use crate::core::Kernel;
use crate::error::{KernelError, Result};
use crate::network::addr::Address;
use crate::network::checksum;
use crate::network::filter::{FilterContext, PacketFilter, Verdict};
use crate::network::interface::IfaceId;
use crate::network::packet::{HeaderKind, IcmpHeader, Packet, PAYLOAD_CAPACITY};
use crate::network::stack::NetStack;

pub mod kind {
    pub const DESTINATION_UNREACHABLE: u8 = 1;
    pub const PACKET_TOO_BIG: u8 = 2;
    pub const TIME_EXCEEDED: u8 = 3;
    pub const PARAMETER_PROBLEM: u8 = 4;
    pub const ECHO_REQUEST: u8 = 128;
    pub const ECHO_REPLY: u8 = 129;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestUnreachCode {
    NoRoute = 0,
    Prohibited = 1,
    OutOfScope = 2,
    Address = 3,
    Port = 4,
    FailedEgress = 5,
    RejectRoute = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeExceededCode {
    HopLimit = 0,
    Reassembly = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamProblemCode {
    Header = 0,
    NextHeader = 1,
    Option = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpMessage {
    DestinationUnreachable(DestUnreachCode),
    PacketTooBig { mtu: u32 },
    TimeExceeded(TimeExceededCode),
    ParameterProblem { code: ParamProblemCode, pointer: u32 },
    EchoRequest { id: u16, seq: u16 },
    EchoReply { id: u16, seq: u16 },
}

impl IcmpMessage {
    fn encode(&self) -> (u8, u8, [u8; 4]) {
        let echo = |id: u16, seq: u16| {
            let (i, s) = (id.to_be_bytes(), seq.to_be_bytes());
            [i[0], i[1], s[0], s[1]]
        };
        match *self {
            IcmpMessage::DestinationUnreachable(code) => (kind::DESTINATION_UNREACHABLE, code as u8, [0; 4]),
            IcmpMessage::PacketTooBig { mtu } => (kind::PACKET_TOO_BIG, 0, mtu.to_be_bytes()),
            IcmpMessage::TimeExceeded(code) => (kind::TIME_EXCEEDED, code as u8, [0; 4]),
            IcmpMessage::ParameterProblem { code, pointer } => {
                (kind::PARAMETER_PROBLEM, code as u8, pointer.to_be_bytes())
            }
            IcmpMessage::EchoRequest { id, seq } => (kind::ECHO_REQUEST, 0, echo(id, seq)),
            IcmpMessage::EchoReply { id, seq } => (kind::ECHO_REPLY, 0, echo(id, seq)),
        }
    }

    /// Decode a header; `None` for types and codes not understood here
    pub fn parse(header: &IcmpHeader) -> Option<Self> {
        let rest = header.rest;
        let word = u32::from_be_bytes(rest);
        let id = u16::from_be_bytes([rest[0], rest[1]]);
        let seq = u16::from_be_bytes([rest[2], rest[3]]);
        Some(match header.kind {
            kind::DESTINATION_UNREACHABLE => IcmpMessage::DestinationUnreachable(match header.code {
                0 => DestUnreachCode::NoRoute,
                1 => DestUnreachCode::Prohibited,
                2 => DestUnreachCode::OutOfScope,
                3 => DestUnreachCode::Address,
                4 => DestUnreachCode::Port,
                5 => DestUnreachCode::FailedEgress,
                6 => DestUnreachCode::RejectRoute,
                _ => return None,
            }),
            kind::PACKET_TOO_BIG => IcmpMessage::PacketTooBig { mtu: word },
            kind::TIME_EXCEEDED => IcmpMessage::TimeExceeded(match header.code {
                0 => TimeExceededCode::HopLimit,
                1 => TimeExceededCode::Reassembly,
                _ => return None,
            }),
            kind::PARAMETER_PROBLEM => IcmpMessage::ParameterProblem {
                code: match header.code {
                    0 => ParamProblemCode::Header,
                    1 => ParamProblemCode::NextHeader,
                    2 => ParamProblemCode::Option,
                    _ => return None,
                },
                pointer: word,
            },
            kind::ECHO_REQUEST => IcmpMessage::EchoRequest { id, seq },
            kind::ECHO_REPLY => IcmpMessage::EchoReply { id, seq },
            _ => return None,
        })
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, IcmpMessage::EchoRequest { .. } | IcmpMessage::EchoReply { .. })
    }
}

/// Message carried by `packet`, if it is ICMP
pub fn message(packet: &Packet) -> Option<IcmpMessage> {
    packet.icmp().ok().and_then(IcmpMessage::parse)
}

/// ICMP packet from `src` to `dest` carrying `data` after the header
pub fn build(kernel: &Kernel, src: Address, dest: Address, message: IcmpMessage, data: &[u8]) -> Result<Packet> {
    let mut packet = kernel.packet_alloc()?;
    packet.ipv6.src = src;
    packet.ipv6.dest = dest;
    packet.routing.dest = dest;
    packet.append_header(HeaderKind::Icmp, IcmpHeader::SIZE)?;
    let len = data.len().min(PAYLOAD_CAPACITY - IcmpHeader::SIZE);
    packet.set_data_len(len)?;
    packet.data_mut().copy_from_slice(&data[..len]);
    let (kind, code, rest) = message.encode();
    let header = packet.icmp_mut()?;
    header.kind = kind;
    header.code = code;
    header.checksum = U16::new(0);
    header.rest = rest;
    checksum::fill(&mut packet, HeaderKind::Icmp)?;
    Ok(packet)
}

/// Echo request from the current context
pub fn echo_request(kernel: &Kernel, dest: Address, id: u16, seq: u16, data: &[u8]) -> Result<Packet> {
    build(kernel, kernel.my_address(), dest, IcmpMessage::EchoRequest { id, seq }, data)
}

/// Report `report` about `original` to its sender through `iface`
///
/// The report is routed back to the original kernel-level source and
/// quotes as much of the original datagram as fits. Errors about ICMP
/// errors are never sent.
pub fn send_error(
    stack: &mut NetStack,
    kernel: &mut Kernel,
    iface: IfaceId,
    original: &Packet,
    report: IcmpMessage,
) -> Result<()> {
    if message(original).is_some_and(|m| m.is_error()) {
        crate::trace!("icmp: not reporting on an ICMP error from {}", original.ipv6.src);
        return Ok(());
    }
    let src = stack.iface(iface)?.addr();
    let mut reply = build(kernel, src, original.ipv6.src, report, original.datagram())?;
    reply.routing.dest = original.routing.src;
    crate::debug!("icmp: {:?} to {} about {}", report, original.ipv6.src, original.ipv6.dest);
    stack.send_on(kernel, iface, reply).map_err(KernelError::from)
}

/// Answers echo requests addressed to the interface
pub struct EchoFilter;

impl PacketFilter for EchoFilter {
    fn apply(&mut self, cx: &mut FilterContext<'_>, packet: Packet) -> Verdict {
        let addr = match cx.stack.iface(cx.iface) {
            Ok(i) => i.addr(),
            Err(e) => return Verdict::Error(e),
        };
        if packet.ipv6.dest != addr {
            return Verdict::Pass(packet);
        }
        let Some(IcmpMessage::EchoRequest { id, seq }) = message(&packet) else {
            return Verdict::Pass(packet);
        };

        let mut reply = match build(cx.kernel, addr, packet.ipv6.src, IcmpMessage::EchoReply { id, seq }, packet.data()) {
            Ok(r) => r,
            Err(e) => return Verdict::Error(e),
        };
        reply.routing.dest = packet.routing.src;
        match cx.stack.send_on(cx.kernel, cx.iface, reply) {
            Ok(()) => Verdict::Replied,
            Err(bounced) => Verdict::Error(bounced.error),
        }
    }
}
