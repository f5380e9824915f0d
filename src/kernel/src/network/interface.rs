//! IP interfaces
//!
//! An interface pairs an address and mask with a transport that actually
//! moves packets. Transports form a closed set: the native transport
//! exchanges packets with other contexts through the kernel, the shared
//! memory transport with a party outside the kernel.

use crate::core::Kernel;
use crate::error::{Bounced, KernelError, Result};
use crate::memory::arena::Handle;
use crate::network::addr::{Address, AddressMask};
use crate::network::filter::FilterChain;
use crate::network::native::NativeIface;
use crate::network::packet::{HeaderKind, Packet};
use crate::network::queue::PacketQueue;
use crate::network::shm::ShmIface;

/// First and last port handed out for port-0 binds
pub const ANON_PORT_FIRST: u16 = 1025;
pub const ANON_PORT_LAST: u16 = 4095;

pub type IfaceId = Handle<IpIface>;

/// Capability set every transport offers
pub trait Transport {
    fn send(&mut self, kernel: &mut Kernel, packet: Packet) -> core::result::Result<(), Bounced>;
    /// Next inbound packet, or `NoPacketAvailable`
    fn receive(&mut self, kernel: &mut Kernel) -> Result<Packet>;
    fn close(&mut self, kernel: &mut Kernel) -> Result<()>;
}

pub enum IfaceVariant {
    Native(NativeIface),
    Shm(ShmIface),
}

impl Transport for IfaceVariant {
    fn send(&mut self, kernel: &mut Kernel, packet: Packet) -> core::result::Result<(), Bounced> {
        match self {
            IfaceVariant::Native(n) => n.send(kernel, packet),
            IfaceVariant::Shm(s) => s.send(kernel, packet),
        }
    }

    fn receive(&mut self, kernel: &mut Kernel) -> Result<Packet> {
        match self {
            IfaceVariant::Native(n) => n.receive(kernel),
            IfaceVariant::Shm(s) => s.receive(kernel),
        }
    }

    fn close(&mut self, kernel: &mut Kernel) -> Result<()> {
        match self {
            IfaceVariant::Native(n) => n.close(kernel),
            IfaceVariant::Shm(s) => s.close(kernel),
        }
    }
}

/// Network interface statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

impl InterfaceStats {
    pub fn record_rx(&mut self, packet: &Packet) {
        self.rx_packets += 1;
        self.rx_bytes += packet.datagram().len() as u64;
    }

    pub fn record_tx(&mut self, bytes: usize) {
        self.tx_packets += 1;
        self.tx_bytes += bytes as u64;
    }
}

impl core::ops::AddAssign for InterfaceStats {
    fn add_assign(&mut self, other: Self) {
        self.rx_packets += other.rx_packets;
        self.tx_packets += other.tx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_bytes += other.tx_bytes;
        self.rx_errors += other.rx_errors;
        self.tx_errors += other.tx_errors;
    }
}

/// Round-robin cursors over the anonymous port range, one per protocol
#[derive(Debug, Clone, Copy)]
pub struct AnonPorts {
    udp: u16,
    tcp: u16,
}

impl Default for AnonPorts {
    fn default() -> Self {
        AnonPorts { udp: ANON_PORT_FIRST, tcp: ANON_PORT_FIRST }
    }
}

impl AnonPorts {
    /// Next port for `kind` that `in_use` does not claim
    pub fn next<F>(&mut self, kind: HeaderKind, mut in_use: F) -> Result<u16>
    where
        F: FnMut(u16) -> bool,
    {
        let cursor = match kind {
            HeaderKind::Udp => &mut self.udp,
            HeaderKind::Tcp => &mut self.tcp,
            _ => return Err(KernelError::WrongProtocol),
        };
        let span = ANON_PORT_LAST - ANON_PORT_FIRST + 1;
        for _ in 0..span {
            let port = *cursor;
            *cursor = if port >= ANON_PORT_LAST { ANON_PORT_FIRST } else { port + 1 };
            if !in_use(port) {
                return Ok(port);
            }
        }
        Err(KernelError::AllAnonPortsBound)
    }
}

pub struct IpIface {
    name: &'static str,
    addr: Address,
    mask: AddressMask,
    /// Received packets waiting for a consumer of their protocol
    pub(crate) queue: PacketQueue,
    pub(crate) filters: FilterChain,
    pub(crate) variant: IfaceVariant,
    pub anon_ports: AnonPorts,
    pub stats: InterfaceStats,
}

#[cfg(test)]
impl core::fmt::Debug for IpIface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpIface").field("name", &self.name).finish_non_exhaustive()
    }
}

impl IpIface {
    pub fn new(
        name: &'static str,
        addr: Address,
        mask: AddressMask,
        queue_len: usize,
        variant: IfaceVariant,
    ) -> Self {
        IpIface {
            name,
            addr,
            mask,
            queue: PacketQueue::new(queue_len),
            filters: FilterChain::new(),
            variant,
            anon_ports: AnonPorts::default(),
            stats: InterfaceStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn mask(&self) -> AddressMask {
        self.mask
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn variant(&self) -> &IfaceVariant {
        &self.variant
    }

    pub fn variant_mut(&mut self) -> &mut IfaceVariant {
        &mut self.variant
    }

    pub fn native_mut(&mut self) -> Option<&mut NativeIface> {
        match &mut self.variant {
            IfaceVariant::Native(n) => Some(n),
            IfaceVariant::Shm(_) => None,
        }
    }

    pub fn shm_mut(&mut self) -> Option<&mut ShmIface> {
        match &mut self.variant {
            IfaceVariant::Shm(s) => Some(s),
            IfaceVariant::Native(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_ports_wrap_and_skip_bound() {
        let mut ports = AnonPorts::default();
        assert_eq!(ports.next(HeaderKind::Udp, |p| p == 1025), Ok(1026));
        assert_eq!(ports.next(HeaderKind::Tcp, |_| false), Ok(1025));
        ports.udp = ANON_PORT_LAST;
        assert_eq!(ports.next(HeaderKind::Udp, |_| false), Ok(ANON_PORT_LAST));
        assert_eq!(ports.next(HeaderKind::Udp, |_| false), Ok(ANON_PORT_FIRST));
        assert_eq!(ports.next(HeaderKind::Udp, |_| true), Err(KernelError::AllAnonPortsBound));
        assert_eq!(ports.next(HeaderKind::Icmp, |_| false), Err(KernelError::WrongProtocol));
    }
}
