//! Router between the native address space and the shared-memory link
//!
//! The router context owns a native interface and a shared-memory
//! interface and installs [`RouterFilter`] on both: a packet arriving on
//! one interface whose route points at the other is forwarded there,
//! anything without a route is answered with ICMP. The context body
//! services the two shared-memory interrupt sockets.

use std::cell::RefCell;
use std::rc::Rc;

use heapless::Vec as FixedVec;

use crate::config::RouterConfig;
use crate::core::Kernel;
use crate::error::{Bounced, KernelError, Result};
use crate::network::addr::{Address, AddressMask};
use crate::network::filter::{FilterContext, FilterDirection, PacketFilter, Verdict};
use crate::network::icmp::{self, DestUnreachCode, IcmpMessage, TimeExceededCode};
use crate::network::interface::IfaceId;
use crate::network::packet::Packet;
use crate::network::queue::ANY_PROTOCOL;
use crate::network::shm::{ShmIface, ShmSegment};
use crate::network::stack::NetStack;
use crate::process::{ContextBody, ContextId, SchedulerMetadata, Step};

pub const MAX_ROUTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub mask: AddressMask,
    pub iface: IfaceId,
}

/// Ordered routes; the first whose mask covers a destination wins
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: FixedVec<Route, MAX_ROUTES>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mask: AddressMask, iface: IfaceId) -> Result<()> {
        self.routes
            .push(Route { mask, iface })
            .map_err(|_| KernelError::OutOfMemory)
    }

    pub fn lookup(&self, dest: &Address) -> Option<Route> {
        self.routes.iter().find(|r| r.mask.matches(dest)).copied()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

pub struct RouterFilter {
    table: Rc<RefCell<RouteTable>>,
}

impl RouterFilter {
    pub fn new(table: Rc<RefCell<RouteTable>>) -> Self {
        RouterFilter { table }
    }

    /// Answer `packet` with `message` through the interface it came in on
    fn report(cx: &mut FilterContext<'_>, packet: &Packet, message: IcmpMessage) -> Verdict {
        if let Err(e) = icmp::send_error(cx.stack, cx.kernel, cx.iface, packet, message) {
            crate::warn!("router: {:?} to {} not sent: {}", message, packet.ipv6.src, e);
        }
        Verdict::ErrorIcmped
    }
}

impl PacketFilter for RouterFilter {
    fn apply(&mut self, cx: &mut FilterContext<'_>, mut packet: Packet) -> Verdict {
        let route = self.table.borrow().lookup(&packet.ipv6.dest);
        let Some(route) = route else {
            crate::debug!("router: no route to {}", packet.ipv6.dest);
            let unreachable = IcmpMessage::DestinationUnreachable(DestUnreachCode::NoRoute);
            return Self::report(cx, &packet, unreachable);
        };
        if route.iface == cx.iface {
            return Verdict::Pass(packet);
        }
        if packet.ipv6.hop_limit <= 1 {
            let expired = IcmpMessage::TimeExceeded(TimeExceededCode::HopLimit);
            return Self::report(cx, &packet, expired);
        }

        packet.routing.dest = packet.ipv6.dest;
        match cx.stack.send_on(cx.kernel, route.iface, packet) {
            Ok(()) => Verdict::Forwarded,
            Err(Bounced { error: KernelError::AddressUnreachable, packet: Some(packet) }) => {
                let unreachable = IcmpMessage::DestinationUnreachable(DestUnreachCode::Address);
                Self::report(cx, &packet, unreachable)
            }
            Err(bounced) => {
                crate::debug!("router: forwarding to {} failed: {}", route.mask, bounced.error);
                Verdict::Error(bounced.error)
            }
        }
    }
}

/// Router context state
pub struct Router {
    stack: NetStack,
    native: IfaceId,
    shm: IfaceId,
    table: Rc<RefCell<RouteTable>>,
}

impl Router {
    /// Bring up the interfaces, routes and filters for the current context
    pub fn open(kernel: &mut Kernel, config: &RouterConfig, segment: ShmSegment) -> Result<Self> {
        let mut stack = NetStack::for_kernel(kernel);
        let native = stack.open_native(kernel)?;
        let shm = ShmIface::open(&mut stack, kernel, config.address, config.nonnative_mask, segment)?;

        let table = Rc::new(RefCell::new(RouteTable::new()));
        {
            let mut routes = table.borrow_mut();
            routes.add(kernel.config().network.system_mask, native)?;
            routes.add(config.nonnative_mask, shm)?;
            if config.default_route {
                routes.add(AddressMask::ANY, shm)?;
            }
        }
        for iface in [native, shm] {
            let filter = Box::new(RouterFilter::new(Rc::clone(&table)));
            stack.install_filter(iface, filter, FilterDirection::Inbound)?;
        }
        crate::info!(
            "router: {} via shared memory at {}, default route {}",
            config.nonnative_mask,
            config.address,
            if config.default_route { "on" } else { "off" }
        );
        Ok(Router { stack, native, shm, table })
    }

    /// Create the router as a daemon context
    pub fn spawn(kernel: &mut Kernel, config: &RouterConfig, segment: ShmSegment) -> Result<ContextId> {
        let id = kernel.spawn_host("router", SchedulerMetadata::daemon())?;
        let previous = kernel.enter(id)?;
        let opened = Router::open(kernel, config, segment);
        kernel.leave(previous);
        match opened {
            Ok(router) => {
                kernel.set_body(id, Box::new(router))?;
                Ok(id)
            }
            Err(e) => {
                kernel.destroy(id)?;
                Err(e)
            }
        }
    }

    pub fn stack(&self) -> &NetStack {
        &self.stack
    }

    pub fn native(&self) -> IfaceId {
        self.native
    }

    pub fn shm(&self) -> IfaceId {
        self.shm
    }

    pub fn routes(&self) -> Rc<RefCell<RouteTable>> {
        Rc::clone(&self.table)
    }

    fn shm_iface(&mut self) -> Result<&mut ShmIface> {
        self.stack
            .iface_mut(self.shm)?
            .shm_mut()
            .ok_or(KernelError::WrongProtocol)
    }

    fn on_receive_interrupt(&mut self, kernel: &mut Kernel) -> Result<()> {
        if let Err(e) = self.shm_iface()?.on_receive_interrupt(kernel) {
            crate::warn!("router: shared-memory receive: {}", e);
            return Ok(());
        }
        match self.stack.receive_on(kernel, self.shm, ANY_PROTOCOL) {
            Ok(Some(packet)) => crate::debug!("router: {} for the router itself, not forwarded", packet.ipv6.src),
            Ok(None) => {}
            Err(KernelError::PacketFilteredOut) => {}
            Err(e) => crate::debug!("router: shared-memory datagram dropped: {}", e),
        }
        Ok(())
    }
}

impl ContextBody for Router {
    fn resume(&mut self, kernel: &mut Kernel) -> Result<Step> {
        let (send_sock, receive_sock) = {
            let shm = self.shm_iface()?;
            (shm.send_interrupt_socket(), shm.receive_interrupt_socket())
        };
        loop {
            match send_sock.receive(&mut self.stack, kernel, true) {
                Ok(_) => {
                    if let Err(e) = self.shm_iface()?.on_send_interrupt() {
                        crate::warn!("router: shared-memory send: {}", e);
                    }
                }
                Err(
                    KernelError::StoppedForOtherSocket
                    | KernelError::PacketFilteredOut
                    | KernelError::ContextYieldedBack,
                ) => {}
                Err(KernelError::NoPacketAvailable) => {
                    if !receive_sock.receive_pending(&self.stack)? {
                        return Ok(Step::Blocked);
                    }
                }
                Err(e) => return Err(e),
            }

            while receive_sock.receive_pending(&self.stack)? {
                receive_sock.receive(&mut self.stack, kernel, true)?;
                self.on_receive_interrupt(kernel)?;
            }
        }
    }
}
