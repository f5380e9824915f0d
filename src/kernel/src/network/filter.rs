//! Packet filters
//!
//! Each interface carries an ordered chain of filters. A filter sees every
//! packet crossing the interface in its direction and either passes it on
//! or consumes it (dropping, forwarding or answering it). Chains are
//! doubly linked through an arena, so installing at either end and
//! uninstalling any entry are O(1). Handles stay valid while the chain
//! runs: only the active filter is lifted out of its entry.

use crate::core::Kernel;
use crate::error::KernelError;
use crate::memory::arena::{Arena, Handle};
use crate::network::interface::IfaceId;
use crate::network::packet::Packet;
use crate::network::stack::NetStack;

/// Outcome of one filter
#[derive(Debug)]
pub enum Verdict {
    /// Hand the packet to the next filter or the receiver
    Pass(Packet),
    Drop,
    /// Sent out of another interface
    Forwarded,
    /// Answered in place
    Replied,
    /// Refused, and the sender was told by ICMP
    ErrorIcmped,
    Error(KernelError),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    Inbound,
    Outbound,
    Both,
}

impl FilterDirection {
    fn covers(self, direction: FilterDirection) -> bool {
        self == FilterDirection::Both || self == direction
    }
}

/// What a filter may touch while it runs
pub struct FilterContext<'a> {
    pub kernel: &'a mut Kernel,
    pub stack: &'a mut NetStack,
    /// Interface the packet is crossing
    pub iface: IfaceId,
}

pub trait PacketFilter {
    fn apply(&mut self, cx: &mut FilterContext<'_>, packet: Packet) -> Verdict;
}

impl<F> PacketFilter for F
where
    F: FnMut(&mut FilterContext<'_>, Packet) -> Verdict,
{
    fn apply(&mut self, cx: &mut FilterContext<'_>, packet: Packet) -> Verdict {
        self(cx, packet)
    }
}

/// Box a closure as a filter
pub fn from_fn<F>(f: F) -> Box<dyn PacketFilter>
where
    F: FnMut(&mut FilterContext<'_>, Packet) -> Verdict + 'static,
{
    Box::new(f)
}

pub struct FilterEntry {
    /// `None` while this filter is running
    filter: Option<Box<dyn PacketFilter>>,
    direction: FilterDirection,
    prev: Option<FilterId>,
    next: Option<FilterId>,
}

pub type FilterId = Handle<FilterEntry>;

#[derive(Default)]
pub struct FilterChain {
    entries: Arena<FilterEntry>,
    first: Option<FilterId>,
    last: Option<FilterId>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install at the end of the chain
    pub fn append(&mut self, filter: Box<dyn PacketFilter>, direction: FilterDirection) -> FilterId {
        let id = self.entries.insert(FilterEntry { filter: Some(filter), direction, prev: self.last, next: None });
        match self.last.and_then(|l| self.entries.get_mut(l)) {
            Some(last) => last.next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        id
    }

    /// Install at the head of the chain
    pub fn prepend(&mut self, filter: Box<dyn PacketFilter>, direction: FilterDirection) -> FilterId {
        let id = self.entries.insert(FilterEntry { filter: Some(filter), direction, prev: None, next: self.first });
        match self.first.and_then(|f| self.entries.get_mut(f)) {
            Some(first) => first.prev = Some(id),
            None => self.last = Some(id),
        }
        self.first = Some(id);
        id
    }

    pub fn uninstall(&mut self, id: FilterId) -> Result<(), KernelError> {
        let entry = self.entries.remove(id).ok_or(KernelError::DoesNotExist)?;
        match entry.prev.and_then(|p| self.entries.get_mut(p)) {
            Some(prev) => prev.next = entry.next,
            None => self.first = entry.next,
        }
        match entry.next.and_then(|n| self.entries.get_mut(n)) {
            Some(next) => next.prev = entry.prev,
            None => self.last = entry.prev,
        }
        Ok(())
    }

    pub fn contains(&self, id: FilterId) -> bool {
        self.entries.contains(id)
    }

    pub fn first(&self) -> Option<FilterId> {
        self.first
    }

    pub fn next_of(&self, id: FilterId) -> Option<FilterId> {
        self.entries.get(id).and_then(|e| e.next)
    }

    /// Lift out the filter at `id` if it covers `direction` and is not
    /// already running
    pub(crate) fn take_covering(&mut self, id: FilterId, direction: FilterDirection) -> Option<Box<dyn PacketFilter>> {
        let entry = self.entries.get_mut(id)?;
        if !entry.direction.covers(direction) {
            return None;
        }
        entry.filter.take()
    }

    /// Return a filter lifted by [`FilterChain::take_covering`]; it is
    /// dropped if its entry was uninstalled meanwhile
    pub(crate) fn put_back(&mut self, id: FilterId, filter: Box<dyn PacketFilter>) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.filter.get_or_insert(filter);
        }
    }

    /// Entry to visit after `id`, given the `next` it had before running
    pub(crate) fn resume_after(&self, id: FilterId, next: Option<FilterId>) -> Option<FilterId> {
        if self.contains(id) {
            self.next_of(id)
        } else {
            next.filter(|n| self.contains(*n))
        }
    }

    /// Run the filters covering `direction` in order until one consumes
    /// the packet
    pub fn run(
        &mut self,
        cx: &mut FilterContext<'_>,
        direction: FilterDirection,
        mut packet: Packet,
    ) -> Verdict {
        let mut cur = self.first;
        while let Some(id) = cur {
            let Some(entry) = self.entries.get_mut(id) else {
                break;
            };
            cur = entry.next;
            if !entry.direction.covers(direction) {
                continue;
            }
            let Some(filter) = entry.filter.as_mut() else {
                continue;
            };
            match filter.apply(cx, packet) {
                Verdict::Pass(p) => packet = p,
                consumed => return consumed,
            }
        }
        Verdict::Pass(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_kernel;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn recorder(log: &Rc<RefCell<Vec<u8>>>, tag: u8) -> Box<dyn PacketFilter> {
        let log = Rc::clone(log);
        from_fn(move |_, p| {
            log.borrow_mut().push(tag);
            Verdict::Pass(p)
        })
    }

    #[test]
    fn filters_run_in_installation_order() {
        let mut kernel = test_kernel();
        let mut stack = NetStack::new(4);
        let iface = stack.open_native(&kernel).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut chain = FilterChain::new();
        chain.append(recorder(&log, 1), FilterDirection::Inbound);
        let f2 = chain.append(recorder(&log, 2), FilterDirection::Both);
        chain.append(recorder(&log, 3), FilterDirection::Inbound);
        chain.append(recorder(&log, 4), FilterDirection::Outbound);

        let packet = kernel.packet_alloc().unwrap();
        let mut cx = FilterContext { kernel: &mut kernel, stack: &mut stack, iface };
        assert!(chain.run(&mut cx, FilterDirection::Inbound, packet).is_pass());
        assert_eq!(*log.borrow(), vec![1, 2, 3]);

        log.borrow_mut().clear();
        chain.uninstall(f2).unwrap();
        assert_eq!(chain.uninstall(f2), Err(KernelError::DoesNotExist));
        let packet = cx.kernel.packet_alloc().unwrap();
        assert!(chain.run(&mut cx, FilterDirection::Inbound, packet).is_pass());
        assert_eq!(*log.borrow(), vec![1, 3]);
    }

    #[test]
    fn consuming_filter_stops_the_chain() {
        let mut kernel = test_kernel();
        let mut stack = NetStack::new(4);
        let iface = stack.open_native(&kernel).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut chain = FilterChain::new();
        chain.append(recorder(&log, 1), FilterDirection::Inbound);
        chain.append(from_fn(|_, _| Verdict::Drop), FilterDirection::Inbound);
        chain.append(recorder(&log, 3), FilterDirection::Inbound);
        chain.prepend(recorder(&log, 0), FilterDirection::Inbound);

        let packet = kernel.packet_alloc().unwrap();
        let mut cx = FilterContext { kernel: &mut kernel, stack: &mut stack, iface };
        assert!(matches!(chain.run(&mut cx, FilterDirection::Inbound, packet), Verdict::Drop));
        assert_eq!(*log.borrow(), vec![0, 1]);
        assert_eq!(kernel.packets_in_use(), 0);
    }

    #[test]
    fn filters_installed_while_running_keep_their_handles() {
        let mut kernel = test_kernel();
        let mut stack = NetStack::new(4);
        let iface = stack.open_native(&kernel).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let installed: Rc<Cell<Option<FilterId>>> = Rc::default();

        let (inner_log, slot) = (Rc::clone(&log), Rc::clone(&installed));
        let installer = from_fn(move |cx, p| {
            if slot.get().is_none() {
                let inner = recorder(&inner_log, 2);
                let id = cx.stack.install_filter(cx.iface, inner, FilterDirection::Inbound).unwrap();
                slot.set(Some(id));
            }
            Verdict::Pass(p)
        });
        let outer = stack.install_filter(iface, installer, FilterDirection::Inbound).unwrap();

        let packet = kernel.packet_alloc().unwrap();
        assert!(stack.apply_filters(&mut kernel, iface, FilterDirection::Inbound, packet).is_pass());
        // appended behind the running filter, so it already saw this packet
        assert_eq!(*log.borrow(), vec![2]);

        let inner = installed.get().unwrap();
        stack.uninstall_filter(iface, inner).unwrap();
        stack.uninstall_filter(iface, outer).unwrap();
        let packet = kernel.packet_alloc().unwrap();
        assert!(stack.apply_filters(&mut kernel, iface, FilterDirection::Inbound, packet).is_pass());
        assert_eq!(*log.borrow(), vec![2]);
        assert_eq!(kernel.packets_in_use(), 0);
    }

    #[test]
    fn filter_may_uninstall_itself() {
        let mut kernel = test_kernel();
        let mut stack = NetStack::new(4);
        let iface = stack.open_native(&kernel).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let me: Rc<Cell<Option<FilterId>>> = Rc::default();

        let slot = Rc::clone(&me);
        let once = from_fn(move |cx, p| {
            if let Some(id) = slot.take() {
                cx.stack.uninstall_filter(cx.iface, id).unwrap();
            }
            Verdict::Pass(p)
        });
        let id = stack.install_filter(iface, once, FilterDirection::Inbound).unwrap();
        me.set(Some(id));
        stack.install_filter(iface, recorder(&log, 3), FilterDirection::Inbound).unwrap();
        let before = stack.iface(iface).unwrap().filters().len();

        let packet = kernel.packet_alloc().unwrap();
        assert!(stack.apply_filters(&mut kernel, iface, FilterDirection::Inbound, packet).is_pass());
        assert_eq!(*log.borrow(), vec![3]);
        assert_eq!(stack.iface(iface).unwrap().filters().len(), before - 1);
        assert_eq!(stack.uninstall_filter(iface, id), Err(KernelError::DoesNotExist));
    }
}
