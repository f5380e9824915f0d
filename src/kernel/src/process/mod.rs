//! Execution contexts
//!
//! A context is the unit of scheduling: it has an address, a packet queue,
//! a backing memory arena and a body the kernel resumes when the context
//! gets the CPU. Bodies are cooperative state machines; a context runs
//! until its body returns a [`Step`].

pub mod queue;

use std::collections::BTreeMap;

use crate::core::Kernel;
use crate::error::Result;
use crate::memory::arena::{Arena, Handle};
use crate::memory::{LogicalId, PhysicalId};
use crate::network::addr::Address;
use crate::network::queue::PacketQueue;

pub use queue::ContextQueue;

pub type ContextId = Handle<Context>;

pub const CONTEXT_NAME_LEN: usize = 32;

/// How a body gave the CPU back
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    /// Runnable, wants to be resumed later
    Yield,
    /// Waiting for a packet
    Blocked,
    /// Done; the context is finished
    Exit,
}

/// Code a context runs when it is given the CPU
pub trait ContextBody {
    fn resume(&mut self, kernel: &mut Kernel) -> Result<Step>;
}

impl<F> ContextBody for F
where
    F: FnMut(&mut Kernel) -> Result<Step>,
{
    fn resume(&mut self, kernel: &mut Kernel) -> Result<Step> {
        self(kernel)
    }
}

/// Scheduling hints kept alongside a context
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerMetadata {
    /// Does not keep the scheduler alive
    pub is_daemon: bool,
    /// Eligible to run; false while waiting on a dependency
    pub is_running: bool,
    /// Reported initialisation to the scheduler
    pub is_inited: bool,
    /// Starts once this context reports initialised
    pub depends_on: Option<ContextId>,
}

impl SchedulerMetadata {
    pub fn daemon() -> Self {
        SchedulerMetadata { is_daemon: true, is_running: true, ..Default::default() }
    }

    pub fn worker() -> Self {
        SchedulerMetadata { is_running: true, ..Default::default() }
    }

    pub fn after(dependency: ContextId) -> Self {
        SchedulerMetadata { depends_on: Some(dependency), ..Default::default() }
    }
}

pub struct Context {
    name: heapless::String<CONTEXT_NAME_LEN>,
    address: Address,
    scheduler: Address,
    arena: Option<(PhysicalId, LogicalId)>,
    pub(crate) queue: PacketQueue,
    blocking: bool,
    finished: bool,
    pub metadata: SchedulerMetadata,
    pub(crate) body: Option<Box<dyn ContextBody>>,
}

impl Context {
    pub(crate) fn new(
        name: &str,
        address: Address,
        scheduler: Address,
        queue_len: usize,
        body: Option<Box<dyn ContextBody>>,
    ) -> Self {
        let mut label = heapless::String::new();
        for c in name.chars() {
            if label.push(c).is_err() {
                break;
            }
        }
        Context {
            name: label,
            address,
            scheduler,
            arena: None,
            queue: PacketQueue::new(queue_len),
            blocking: false,
            finished: false,
            metadata: SchedulerMetadata::worker(),
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Address of the scheduler that created this context
    pub fn scheduler(&self) -> Address {
        self.scheduler
    }

    pub fn arena(&self) -> Option<(PhysicalId, LogicalId)> {
        self.arena
    }

    pub(crate) fn set_arena(&mut self, arena: (PhysicalId, LogicalId)) {
        self.arena = Some(arena);
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub(crate) fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
        self.blocking = false;
        self.body = None;
    }

    /// Kernel-driven contexts have no body; the host runs them via
    /// [`Kernel::enter`]
    pub fn is_host_driven(&self) -> bool {
        self.body.is_none() && !self.finished
    }

    pub fn pending_packets(&self) -> usize {
        self.queue.len()
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name.as_str())
            .field("address", &self.address)
            .field("blocking", &self.blocking)
            .field("finished", &self.finished)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Every live context, indexed by handle and by address
#[derive(Default)]
pub struct ContextTable {
    contexts: Arena<Context>,
    by_address: BTreeMap<Address, ContextId>,
    order: Vec<ContextId>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, context: Context) -> ContextId {
        let address = context.address;
        let id = self.contexts.insert(context);
        self.by_address.insert(address, id);
        self.order.push(id);
        id
    }

    pub fn remove(&mut self, id: ContextId) -> Option<Context> {
        let context = self.contexts.remove(id)?;
        if self.by_address.get(&context.address) == Some(&id) {
            self.by_address.remove(&context.address);
        }
        self.order.retain(|c| *c != id);
        Some(context)
    }

    pub fn get(&self, id: ContextId) -> Option<&Context> {
        self.contexts.get(id)
    }

    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut Context> {
        self.contexts.get_mut(id)
    }

    pub fn find(&self, address: &Address) -> Option<ContextId> {
        self.by_address.get(address).copied()
    }

    /// Live contexts in creation order
    pub fn ids(&self) -> Vec<ContextId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
