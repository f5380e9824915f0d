//! Per-context network stack
//!
//! Every context that speaks IP owns a [`NetStack`]: its interfaces, its
//! default route and its UDP sockets. The stack is plain data owned by the
//! context body; operations that move packets borrow the kernel for the
//! duration of the call.

use crate::core::Kernel;
use crate::error::{KernelError, Result};
use crate::memory::arena::Arena;
use crate::network::addr::Address;
use crate::network::filter::{FilterContext, FilterDirection, FilterId, PacketFilter, Verdict};
use crate::network::icmp::EchoFilter;
use crate::network::interface::{IfaceId, IfaceVariant, IpIface, Transport};
use crate::network::native::NativeIface;
use crate::network::packet::Packet;
use crate::network::udp::SocketState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRoute {
    /// Where packets without a matching interface are addressed
    pub addr: Address,
    pub iface: IfaceId,
}

pub struct NetStack {
    ifaces: Arena<IpIface>,
    order: Vec<IfaceId>,
    default_route: Option<DefaultRoute>,
    pub(crate) sockets: Arena<SocketState>,
    queue_len: usize,
}

impl NetStack {
    pub fn new(queue_len: usize) -> Self {
        NetStack {
            ifaces: Arena::new(),
            order: Vec::new(),
            default_route: None,
            sockets: Arena::new(),
            queue_len,
        }
    }

    /// Stack sized by the kernel's queue configuration
    pub fn for_kernel(kernel: &Kernel) -> Self {
        Self::new(kernel.config().packets.queue_len)
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len
    }

    /// Add an interface; it starts with the ICMP echo filter installed
    pub fn register(&mut self, mut iface: IpIface) -> Result<IfaceId> {
        if !iface.addr().is_zero() && self.lookup_receive(&iface.addr()).is_some() {
            return Err(KernelError::AddressInUse);
        }
        iface.filters.append(Box::new(EchoFilter), FilterDirection::Inbound);
        crate::info!("net: {} up at {} ({})", iface.name(), iface.addr(), iface.mask());
        let id = self.ifaces.insert(iface);
        self.order.push(id);
        Ok(id)
    }

    /// Remove and close an interface. Sockets bound to it become unbound
    /// from the interface but keep their ports.
    pub fn unregister(&mut self, kernel: &mut Kernel, id: IfaceId) -> Result<IpIface> {
        let mut iface = self.ifaces.remove(id).ok_or(KernelError::DoesNotExist)?;
        self.order.retain(|i| *i != id);
        if self.default_route.is_some_and(|r| r.iface == id) {
            self.default_route = None;
        }
        for (_, socket) in self.sockets.iter_mut() {
            if socket.iface == Some(id) {
                socket.iface = None;
            }
        }
        if let IfaceVariant::Shm(shm) = &iface.variant {
            for socket in shm.interrupt_sockets() {
                socket.close(self)?;
            }
        }
        iface.variant.close(kernel)?;
        Ok(iface)
    }

    /// Native interface at the current context's address
    pub fn open_native(&mut self, kernel: &Kernel) -> Result<IfaceId> {
        let iface = IpIface::new(
            "native",
            kernel.my_address(),
            kernel.config().network.system_mask,
            self.queue_len,
            IfaceVariant::Native(NativeIface::new()),
        );
        self.register(iface)
    }

    pub fn iface(&self, id: IfaceId) -> Result<&IpIface> {
        self.ifaces.get(id).ok_or(KernelError::DoesNotExist)
    }

    pub fn iface_mut(&mut self, id: IfaceId) -> Result<&mut IpIface> {
        self.ifaces.get_mut(id).ok_or(KernelError::DoesNotExist)
    }

    /// Interfaces in registration order
    pub fn ifaces(&self) -> impl Iterator<Item = IfaceId> + '_ {
        self.order.iter().copied()
    }

    pub fn first(&self) -> Option<IfaceId> {
        self.order.first().copied()
    }

    /// First interface whose mask covers `dest`
    pub fn lookup_send(&self, dest: &Address) -> Option<IfaceId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.ifaces.get(*id).is_some_and(|i| i.mask().matches(dest)))
    }

    /// Interface owning `addr`
    pub fn lookup_receive(&self, addr: &Address) -> Option<IfaceId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.ifaces.get(*id).is_some_and(|i| i.addr() == *addr))
    }

    pub fn set_default_route(&mut self, addr: Address, iface: IfaceId) -> Result<()> {
        self.iface(iface)?;
        self.default_route = Some(DefaultRoute { addr, iface });
        Ok(())
    }

    pub fn clear_default_route(&mut self) {
        self.default_route = None;
    }

    pub fn default_route(&self) -> Option<DefaultRoute> {
        self.default_route
    }

    /// Oldest queued packet of `protocol` on any interface
    pub fn dequeue_from_any(&mut self, protocol: u8) -> Result<(Packet, IfaceId)> {
        for id in self.order.iter().copied() {
            if let Some(iface) = self.ifaces.get_mut(id) {
                if let Some(packet) = iface.queue.dequeue(protocol) {
                    return Ok((packet, id));
                }
            }
        }
        Err(KernelError::QueueEmpty)
    }

    pub fn install_filter(
        &mut self,
        iface: IfaceId,
        filter: Box<dyn PacketFilter>,
        direction: FilterDirection,
    ) -> Result<FilterId> {
        Ok(self.iface_mut(iface)?.filters.append(filter, direction))
    }

    pub fn install_filter_first(
        &mut self,
        iface: IfaceId,
        filter: Box<dyn PacketFilter>,
        direction: FilterDirection,
    ) -> Result<FilterId> {
        Ok(self.iface_mut(iface)?.filters.prepend(filter, direction))
    }

    pub fn uninstall_filter(&mut self, iface: IfaceId, filter: FilterId) -> Result<()> {
        self.iface_mut(iface)?.filters.uninstall(filter)
    }

    /// Run an interface's filter chain over `packet`
    ///
    /// The chain stays installed while it runs, so filters may install or
    /// uninstall filters on this interface by handle. Only the running
    /// filter is lifted out of its entry.
    pub(crate) fn apply_filters(
        &mut self,
        kernel: &mut Kernel,
        iface: IfaceId,
        direction: FilterDirection,
        mut packet: Packet,
    ) -> Verdict {
        let mut cur = match self.iface(iface) {
            Ok(i) => i.filters.first(),
            Err(e) => return Verdict::Error(e),
        };
        while let Some(id) = cur {
            let Ok(chain) = self.iface_mut(iface).map(|i| &mut i.filters) else {
                break;
            };
            let next = chain.next_of(id);
            let Some(mut filter) = chain.take_covering(id, direction) else {
                cur = next;
                continue;
            };
            let verdict = {
                let mut cx = FilterContext { kernel: &mut *kernel, stack: &mut *self, iface };
                filter.apply(&mut cx, packet)
            };
            cur = match self.iface_mut(iface) {
                Ok(i) => {
                    i.filters.put_back(id, filter);
                    i.filters.resume_after(id, next)
                }
                Err(_) => None,
            };
            match verdict {
                Verdict::Pass(p) => packet = p,
                consumed => return consumed,
            }
        }
        Verdict::Pass(packet)
    }
}
