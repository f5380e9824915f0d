//! Packets and the packet pool
//!
//! A packet is a routing header (kernel-level source and destination) in
//! front of an IPv6 datagram. Buffers come from a fixed pool of page-sized
//! slots; a [`Packet`] owns its slot and hands it back when dropped, so a
//! buffer is freed exactly once whichever component ends up holding it.

use core::cell::RefCell;
use core::ops::{Deref, DerefMut};
use std::rc::Rc;

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::{KernelError, Result};
use crate::network::addr::Address;

/// Largest IPv6 datagram (header plus payload) a packet carries
pub const MTU: usize = 1500;
pub const PAYLOAD_CAPACITY: usize = MTU - Ipv6Header::SIZE;
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Next-header values understood by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderKind {
    HopByHop = 0,
    Tcp = 6,
    Udp = 17,
    Routing = 43,
    Fragment = 44,
    Icmp = 58,
    NoNext = 59,
    Destination = 60,
}

impl HeaderKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => HeaderKind::HopByHop,
            6 => HeaderKind::Tcp,
            17 => HeaderKind::Udp,
            43 => HeaderKind::Routing,
            44 => HeaderKind::Fragment,
            58 => HeaderKind::Icmp,
            59 => HeaderKind::NoNext,
            60 => HeaderKind::Destination,
            _ => return None,
        })
    }

    /// Extension headers carry a next-header byte of their own
    pub fn is_extension(self) -> bool {
        matches!(
            self,
            HeaderKind::HopByHop | HeaderKind::Routing | HeaderKind::Fragment | HeaderKind::Destination
        )
    }
}

/// Kernel-level addressing, not part of the datagram
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct RoutingHeader {
    pub src: Address,
    pub dest: Address,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct Ipv6Header {
    /// Version (4 bits), traffic class (8 bits), flow label (20 bits)
    pub version_class_flow: U32,
    pub payload_len: U16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Address,
    pub dest: Address,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct UdpHeader {
    pub src_port: U16,
    pub dest_port: U16,
    pub length: U16,
    pub checksum: U16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct IcmpHeader {
    pub kind: u8,
    pub code: u8,
    pub checksum: U16,
    /// Unused, MTU, pointer, or identifier and sequence, by type
    pub rest: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct TcpHeader {
    pub src_port: U16,
    pub dest_port: U16,
    pub seq: U32,
    pub ack: U32,
    /// Data offset (4 bits) and flags
    pub offset_flags: U16,
    pub window: U16,
    pub checksum: U16,
    pub urgent: U16,
}

impl RoutingHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

impl Ipv6Header {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn version(&self) -> u8 {
        (self.version_class_flow.get() >> 28) as u8
    }
}

impl UdpHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

impl IcmpHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

impl TcpHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Location of one header inside the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRef {
    /// Raw next-header value naming this header
    pub kind: u8,
    pub offset: usize,
    pub len: usize,
}

impl HeaderRef {
    pub fn kind(&self) -> Option<HeaderKind> {
        HeaderKind::from_u8(self.kind)
    }
}

#[repr(C)]
#[derive(Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
pub struct Frame {
    pub routing: RoutingHeader,
    pub ipv6: Ipv6Header,
    pub payload: [u8; PAYLOAD_CAPACITY],
}

/// Walks the header chain of a frame
pub struct Headers<'a> {
    frame: &'a Frame,
    next: u8,
    offset: usize,
    done: bool,
}

impl<'a> Iterator for Headers<'a> {
    type Item = HeaderRef;

    fn next(&mut self) -> Option<HeaderRef> {
        if self.done || self.next == HeaderKind::NoNext as u8 {
            return None;
        }
        let payload = self.frame.payload();
        let rest = payload.get(self.offset..).unwrap_or(&[]);
        let kind = HeaderKind::from_u8(self.next);
        let len = match kind {
            Some(HeaderKind::HopByHop | HeaderKind::Routing | HeaderKind::Destination) => {
                rest.get(1).map(|l| (*l as usize + 1) * 8)
            }
            Some(HeaderKind::Fragment) => Some(8),
            Some(HeaderKind::Udp) => Some(UdpHeader::SIZE),
            Some(HeaderKind::Icmp) => Some(IcmpHeader::SIZE),
            Some(HeaderKind::Tcp) => rest.get(12).map(|b| ((*b >> 4) as usize * 4).max(TcpHeader::SIZE)),
            _ => Some(rest.len()),
        };
        let Some(len) = len.filter(|l| *l <= rest.len()) else {
            self.done = true;
            return None;
        };

        let header = HeaderRef { kind: self.next, offset: self.offset, len };
        match kind {
            Some(k) if k.is_extension() => {
                self.next = rest[0];
                self.offset += len;
            }
            _ => self.done = true,
        }
        Some(header)
    }
}

impl Frame {
    pub fn new() -> Box<Frame> {
        let mut frame = Frame::new_box_zeroed();
        frame.reset();
        frame
    }

    /// Back to an empty datagram with default header fields
    pub fn reset(&mut self) {
        self.as_bytes_mut().fill(0);
        self.ipv6.version_class_flow = U32::new(6 << 28);
        self.ipv6.next_header = HeaderKind::NoNext as u8;
        self.ipv6.hop_limit = DEFAULT_HOP_LIMIT;
    }

    pub fn payload_len(&self) -> usize {
        (self.ipv6.payload_len.get() as usize).min(PAYLOAD_CAPACITY)
    }

    /// Payload bytes in use
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len()]
    }

    pub fn headers(&self) -> Headers<'_> {
        Headers {
            frame: self,
            next: self.ipv6.next_header,
            offset: 0,
            done: false,
        }
    }

    /// First header of the given kind
    pub fn seek_header(&self, kind: HeaderKind) -> Result<HeaderRef> {
        self.headers()
            .find(|h| h.kind == kind as u8)
            .ok_or(KernelError::DoesNotExist)
    }

    /// Kind of the last header in the chain
    pub fn protocol(&self) -> u8 {
        self.headers()
            .last()
            .map_or(HeaderKind::NoNext as u8, |h| h.kind)
    }

    /// Offset of the first byte after all headers
    pub fn data_offset(&self) -> usize {
        self.headers().last().map_or(0, |h| h.offset + h.len)
    }

    pub fn data_len(&self) -> usize {
        self.payload_len().saturating_sub(self.data_offset())
    }

    pub fn set_data_len(&mut self, len: usize) -> Result<()> {
        let total = self.data_offset() + len;
        if total > PAYLOAD_CAPACITY {
            return Err(KernelError::OutOfBounds);
        }
        self.ipv6.payload_len = U16::new(total as u16);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        let off = self.data_offset();
        &self.payload[off..off + self.data_len()]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let off = self.data_offset();
        let len = self.data_len();
        &mut self.payload[off..off + len]
    }

    /// Append a zeroed `len`-byte header of `kind` to the chain; returns its
    /// offset. Only possible while the chain ends in an extension header.
    pub fn append_header(&mut self, kind: HeaderKind, len: usize) -> Result<usize> {
        if kind == HeaderKind::NoNext || self.data_len() != 0 {
            return Err(KernelError::InvalidArg);
        }
        let last = self.headers().last();
        let offset = last.map_or(0, |h| h.offset + h.len);
        if offset + len > PAYLOAD_CAPACITY {
            return Err(KernelError::OutOfBounds);
        }
        match last {
            None => self.ipv6.next_header = kind as u8,
            Some(h) if h.kind().is_some_and(HeaderKind::is_extension) => {
                self.payload[h.offset] = kind as u8
            }
            Some(_) => return Err(KernelError::InvalidArg),
        }
        self.payload[offset..offset + len].fill(0);
        if kind.is_extension() {
            self.payload[offset] = HeaderKind::NoNext as u8;
            if kind != HeaderKind::Fragment {
                self.payload[offset + 1] = (len / 8).saturating_sub(1) as u8;
            }
        }
        self.ipv6.payload_len = U16::new((offset + len) as u16);
        Ok(offset)
    }

    pub fn udp(&self) -> Result<&UdpHeader> {
        let h = self.seek_header(HeaderKind::Udp)?;
        UdpHeader::ref_from_prefix(&self.payload[h.offset..]).ok_or(KernelError::WrongProtocol)
    }

    pub fn udp_mut(&mut self) -> Result<&mut UdpHeader> {
        let h = self.seek_header(HeaderKind::Udp)?;
        UdpHeader::mut_from_prefix(&mut self.payload[h.offset..]).ok_or(KernelError::WrongProtocol)
    }

    pub fn icmp(&self) -> Result<&IcmpHeader> {
        let h = self.seek_header(HeaderKind::Icmp)?;
        IcmpHeader::ref_from_prefix(&self.payload[h.offset..]).ok_or(KernelError::WrongProtocol)
    }

    pub fn icmp_mut(&mut self) -> Result<&mut IcmpHeader> {
        let h = self.seek_header(HeaderKind::Icmp)?;
        IcmpHeader::mut_from_prefix(&mut self.payload[h.offset..]).ok_or(KernelError::WrongProtocol)
    }

    pub fn tcp(&self) -> Result<&TcpHeader> {
        let h = self.seek_header(HeaderKind::Tcp)?;
        TcpHeader::ref_from_prefix(&self.payload[h.offset..]).ok_or(KernelError::WrongProtocol)
    }

    /// The IPv6 datagram as it goes on the wire
    pub fn datagram(&self) -> &[u8] {
        let start = RoutingHeader::SIZE;
        &self.as_bytes()[start..start + Ipv6Header::SIZE + self.payload_len()]
    }

    /// Replace the datagram with wire bytes, keeping the routing header
    pub fn set_datagram(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < Ipv6Header::SIZE || bytes.len() > MTU {
            return Err(KernelError::InvalidArg);
        }
        let header = Ipv6Header::read_from_prefix(bytes).ok_or(KernelError::InvalidArg)?;
        let payload_len = (header.payload_len.get() as usize).min(PAYLOAD_CAPACITY);
        if payload_len > bytes.len() - Ipv6Header::SIZE {
            return Err(KernelError::InvalidArg);
        }
        let start = RoutingHeader::SIZE;
        self.as_bytes_mut()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

struct PoolState {
    free: Vec<u16>,
    capacity: usize,
    base: u64,
}

/// Fixed pool of packet buffers
///
/// Cloning yields another handle onto the same pool. Allocation never
/// blocks, so it is safe from interrupt delivery.
#[derive(Clone)]
pub struct PacketPool {
    state: Rc<RefCell<PoolState>>,
}

impl PacketPool {
    /// `capacity` slots whose backing pages start at `base`
    pub fn new(capacity: usize, base: u64) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        PacketPool {
            state: Rc::new(RefCell::new(PoolState {
                free: (0..capacity as u16).rev().collect(),
                capacity,
                base,
            })),
        }
    }

    pub fn alloc(&self) -> Result<Packet> {
        let slot = self
            .state
            .borrow_mut()
            .free
            .pop()
            .ok_or(KernelError::OutOfMemory)?;
        Ok(Packet {
            frame: Frame::new(),
            slot,
            pool: Rc::clone(&self.state),
        })
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    pub fn in_use(&self) -> usize {
        let state = self.state.borrow();
        state.capacity - state.free.len()
    }
}

/// An owned packet buffer
pub struct Packet {
    frame: Box<Frame>,
    slot: u16,
    pool: Rc<RefCell<PoolState>>,
}

impl Packet {
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Address of the slot's backing page
    pub fn buffer_addr(&self) -> u64 {
        let base = self.pool.try_borrow().map_or(0, |s| s.base);
        base + self.slot as u64 * crate::memory::PAGE_SIZE
    }
}

impl Deref for Packet {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Ok(mut state) = self.pool.try_borrow_mut() {
            state.free.push(self.slot);
        }
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("slot", &self.slot)
            .field("routing", &self.routing)
            .field("src", &self.ipv6.src)
            .field("dest", &self.ipv6.dest)
            .field("protocol", &self.protocol())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}
