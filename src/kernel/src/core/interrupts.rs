//! Interrupt table
//!
//! Interrupts reach contexts as UDP packets. The table records which
//! address and port each interrupt id is bound to, which ids were allocated
//! against host signals, and the events waiting to be turned into packets.
//! Events are queued by [`InterruptTable::raise`] (or by a host signal) and
//! drained by the kernel at its dispatch points; while the table is blocked
//! they stay queued.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use pktos_shared::interrupt::INTERRUPT_ALIAS_CLOCK;

use crate::error::{KernelError, Result};
use crate::network::addr::Address;

pub use pktos_shared::interrupt::{InterruptId, InterruptMsg};

/// Kernel clock
pub const INTERRUPT_CLOCK: InterruptId = 1;
/// Highest valid interrupt id
pub const INTERRUPT_MAX: InterruptId = 0xff;

/// Map a public alias to an interrupt id
///
/// Only published aliases resolve; allocated ids are registered directly
/// with [`crate::Kernel::register_interrupt`].
pub fn resolve(alias: i32) -> Result<InterruptId> {
    match alias {
        INTERRUPT_ALIAS_CLOCK => Ok(INTERRUPT_CLOCK),
        _ => Err(KernelError::NoSuchInterruptAlias),
    }
}

fn check_id(id: InterruptId) -> Result<usize> {
    if (1..=INTERRUPT_MAX).contains(&id) {
        Ok(id as usize)
    } else {
        Err(KernelError::InvalidArg)
    }
}

/// Where an interrupt is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub address: Address,
    pub port: u16,
}

/// Saved enable state returned by [`InterruptTable::block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptState {
    enabled: bool,
}

impl InterruptState {
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// In-process signal wire
///
/// Stands in for `kill(2)` between the kernel and a peer living in the same
/// process. Cloning gives another end of the same wire.
#[derive(Clone, Default)]
pub struct SignalLine {
    raised: Rc<RefCell<VecDeque<i32>>>,
}

impl SignalLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, signum: i32) {
        self.raised.borrow_mut().push_back(signum);
    }

    /// Signals raised since the last call, oldest first
    pub fn drain(&self) -> Vec<i32> {
        self.raised.borrow_mut().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.raised.borrow().is_empty()
    }
}

pub struct InterruptTable {
    registrations: Vec<Option<Registration>>,
    /// Allocated ids and the host signal behind each
    allocated: BTreeMap<InterruptId, i32>,
    free_signals: Vec<i32>,
    pending: VecDeque<InterruptId>,
    enabled: bool,
    host_signals: bool,
    line: SignalLine,
}

impl InterruptTable {
    /// `signals` is the pool handed out by [`allocate`](Self::allocate).
    /// With `host_signals` set, allocation installs real handlers.
    pub fn new(signals: &[i32], host_signals: bool) -> Self {
        InterruptTable {
            registrations: vec![None; INTERRUPT_MAX as usize + 1],
            allocated: BTreeMap::new(),
            free_signals: signals.iter().rev().copied().collect(),
            pending: VecDeque::new(),
            enabled: true,
            host_signals,
            line: SignalLine::new(),
        }
    }

    /// The wire in-process peers raise signals on
    pub fn signal_line(&self) -> SignalLine {
        self.line.clone()
    }

    pub fn register(&mut self, id: InterruptId, address: Address, port: u16) -> Result<()> {
        let slot = &mut self.registrations[check_id(id)?];
        match slot {
            Some(reg) if reg.address != address => Err(KernelError::ResourceInUse),
            _ => {
                *slot = Some(Registration { address, port });
                Ok(())
            }
        }
    }

    /// Only the owner may unregister
    pub fn unregister(&mut self, id: InterruptId, address: Address) -> Result<()> {
        let slot = &mut self.registrations[check_id(id)?];
        match slot {
            Some(reg) if reg.address == address => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::InvalidArg),
        }
    }

    pub fn registration(&self, id: InterruptId) -> Option<Registration> {
        check_id(id).ok().and_then(|i| self.registrations[i])
    }

    /// Drop every registration held by `address`
    pub fn unregister_all(&mut self, address: Address) {
        for slot in self.registrations.iter_mut() {
            if slot.is_some_and(|r| r.address == address) {
                *slot = None;
            }
        }
    }

    /// Fresh interrupt id bound to a host signal from the pool
    pub fn allocate(&mut self) -> Result<(InterruptId, i32)> {
        let id = (INTERRUPT_CLOCK + 1..=INTERRUPT_MAX)
            .find(|id| !self.allocated.contains_key(id))
            .ok_or(KernelError::OutOfMemory)?;
        let signum = self.free_signals.pop().ok_or(KernelError::OutOfMemory)?;
        if self.host_signals {
            if let Err(e) = host::install(signum) {
                self.free_signals.push(signum);
                return Err(e);
            }
        }
        self.allocated.insert(id, signum);
        crate::debug!("interrupts: allocated id {} on signal {}", id, signum);
        Ok((id, signum))
    }

    pub fn deallocate(&mut self, id: InterruptId) -> Result<()> {
        let signum = self.allocated.remove(&id).ok_or(KernelError::ResourceNotInUse)?;
        if self.host_signals {
            host::uninstall(signum)?;
        }
        self.free_signals.push(signum);
        self.registrations[check_id(id)?] = None;
        self.pending.retain(|p| *p != id);
        Ok(())
    }

    pub fn raise(&mut self, id: InterruptId) -> Result<()> {
        check_id(id)?;
        self.pending.push_back(id);
        Ok(())
    }

    /// Queue the interrupt allocated against `signum`; unknown signals are
    /// ignored
    pub fn raise_signal(&mut self, signum: i32) {
        if signum == host::CLOCK_SIGNAL {
            self.pending.push_back(INTERRUPT_CLOCK);
            return;
        }
        match self.allocated.iter().find(|(_, s)| **s == signum) {
            Some((id, _)) => self.pending.push_back(*id),
            None => crate::trace!("interrupts: stray signal {}", signum),
        }
    }

    /// Move signals raised on the host or the in-process line into the
    /// pending queue
    pub fn collect_signals(&mut self) {
        if self.host_signals {
            let mask = host::take_pending();
            for signum in (0..64).filter(|s| mask & (1u64 << s) != 0) {
                self.raise_signal(signum);
            }
        }
        for signum in self.line.drain() {
            self.raise_signal(signum);
        }
    }

    /// Next event to deliver, unless blocked
    pub fn take_pending(&mut self) -> Option<InterruptId> {
        if !self.enabled {
            return None;
        }
        self.pending.pop_front()
    }

    /// Put an undeliverable event back at the head
    pub fn requeue(&mut self, id: InterruptId) {
        self.pending.push_front(id);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn block(&mut self) -> InterruptState {
        let state = InterruptState { enabled: self.enabled };
        self.enabled = false;
        state
    }

    pub fn restore(&mut self, state: InterruptState) {
        self.enabled = state.enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for InterruptTable {
    fn drop(&mut self) {
        if self.host_signals {
            for signum in self.allocated.values() {
                if let Err(e) = host::uninstall(*signum) {
                    crate::warn!("interrupts: restoring signal {}: {}", signum, e);
                }
            }
        }
    }
}

/// Host signal plumbing
///
/// The handler only sets a bit in [`PENDING`]; everything else happens when
/// the kernel collects the mask.
pub mod host {
    use core::sync::atomic::{AtomicU64, Ordering};

    use spin::Mutex;

    use crate::error::{KernelError, Result};

    /// Signal driving the kernel clock
    pub const CLOCK_SIGNAL: i32 = libc::SIGALRM;

    static PENDING: AtomicU64 = AtomicU64::new(0);
    static INSTALLED: Mutex<u64> = Mutex::new(0);

    extern "C" fn on_signal(signum: libc::c_int) {
        if (0..64).contains(&signum) {
            PENDING.fetch_or(1u64 << signum, Ordering::SeqCst);
        }
    }

    fn bit(signum: i32) -> Result<u64> {
        if (1..64).contains(&signum) {
            Ok(1u64 << signum)
        } else {
            Err(KernelError::InvalidArg)
        }
    }

    fn set_action(signum: i32, handler: libc::sighandler_t) -> Result<()> {
        // SAFETY: the action is fully initialised before use and the
        // handler is async-signal-safe (a single atomic or).
        let rc = unsafe {
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = handler;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, core::ptr::null_mut())
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(KernelError::last_os_error())
        }
    }

    pub fn install(signum: i32) -> Result<()> {
        let bit = bit(signum)?;
        let mut installed = INSTALLED.lock();
        if *installed & bit != 0 {
            return Err(KernelError::ResourceInUse);
        }
        set_action(signum, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t)?;
        *installed |= bit;
        Ok(())
    }

    pub fn uninstall(signum: i32) -> Result<()> {
        let bit = bit(signum)?;
        let mut installed = INSTALLED.lock();
        if *installed & bit == 0 {
            return Err(KernelError::ResourceNotInUse);
        }
        set_action(signum, libc::SIG_DFL)?;
        *installed &= !bit;
        PENDING.fetch_and(!bit, Ordering::SeqCst);
        Ok(())
    }

    /// Take and clear the pending mask
    pub fn take_pending() -> u64 {
        PENDING.swap(0, Ordering::SeqCst)
    }

    /// Deliver `signum` to another process
    pub fn send(pid: i32, signum: i32) -> Result<()> {
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, signum) } == 0 {
            Ok(())
        } else {
            Err(KernelError::last_os_error())
        }
    }

    /// Start a periodic SIGALRM every `interval_us`
    pub fn start_clock(interval_us: u64) -> Result<()> {
        install(CLOCK_SIGNAL)?;
        let interval = libc::timeval {
            tv_sec: (interval_us / 1_000_000) as libc::time_t,
            tv_usec: (interval_us % 1_000_000) as libc::suseconds_t,
        };
        let timer = libc::itimerval { it_interval: interval, it_value: interval };
        // SAFETY: both pointers reference valid itimerval values.
        if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut()) } != 0 {
            let err = KernelError::last_os_error();
            if let Err(e) = uninstall(CLOCK_SIGNAL) {
                crate::warn!("interrupts: restoring clock signal: {}", e);
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn stop_clock() -> Result<()> {
        // SAFETY: a zeroed itimerval disarms the timer.
        let timer: libc::itimerval = unsafe { core::mem::zeroed() };
        unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut()) };
        uninstall(CLOCK_SIGNAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        let mut a = [0u8; 16];
        a[0] = 0x7e;
        a[1] = 0x8e;
        a[15] = n;
        Address::new(a)
    }

    #[test]
    fn clock_alias_resolves() {
        assert_eq!(resolve(1024), Ok(INTERRUPT_CLOCK));
        assert_eq!(resolve(7), Err(KernelError::NoSuchInterruptAlias));
        assert_eq!(resolve(INTERRUPT_CLOCK as i32), Err(KernelError::NoSuchInterruptAlias));
        assert_eq!(resolve(0), Err(KernelError::NoSuchInterruptAlias));
        assert_eq!(resolve(1025), Err(KernelError::NoSuchInterruptAlias));
    }

    #[test]
    fn registration_belongs_to_one_address() {
        let mut table = InterruptTable::new(&[], false);
        table.register(INTERRUPT_CLOCK, addr(1), 7000).unwrap();
        assert_eq!(table.register(INTERRUPT_CLOCK, addr(2), 7000), Err(KernelError::ResourceInUse));
        assert_eq!(table.unregister(INTERRUPT_CLOCK, addr(2)), Err(KernelError::InvalidArg));
        table.unregister(INTERRUPT_CLOCK, addr(1)).unwrap();
        assert!(table.registration(INTERRUPT_CLOCK).is_none());
        assert_eq!(table.register(0, addr(1), 1), Err(KernelError::InvalidArg));
    }

    #[test]
    fn allocation_draws_from_signal_pool() {
        let mut table = InterruptTable::new(&[10, 12], false);
        let (a, sa) = table.allocate().unwrap();
        let (b, sb) = table.allocate().unwrap();
        assert_eq!((a, sa), (2, 10));
        assert_eq!((b, sb), (3, 12));
        assert_eq!(table.allocate(), Err(KernelError::OutOfMemory));
        table.deallocate(a).unwrap();
        assert_eq!(table.deallocate(a), Err(KernelError::ResourceNotInUse));
        assert_eq!(table.allocate().unwrap(), (2, 10));
    }

    #[test]
    fn blocked_events_stay_queued() {
        let mut table = InterruptTable::new(&[10], false);
        let (id, signum) = table.allocate().unwrap();
        let outer = table.block();
        let inner = table.block();
        table.line.raise(signum);
        table.collect_signals();
        table.raise(INTERRUPT_CLOCK).unwrap();
        assert_eq!(table.take_pending(), None);
        table.restore(inner);
        assert!(!table.is_enabled());
        table.restore(outer);
        assert!(table.is_enabled());
        assert_eq!(table.take_pending(), Some(id));
        assert_eq!(table.take_pending(), Some(INTERRUPT_CLOCK));
        assert_eq!(table.take_pending(), None);
    }
}
