//! Basic round-robin scheduler
//!
//! The scheduler is itself a host-driven context. It owns a native stack
//! with a socket for clock interrupts, the timer server and the control
//! server. Each step hands the head of its queue a slot by receiving on
//! the clock socket with the head as yield target, then moves the head to
//! the back.

pub mod control;
pub mod timer;

use pktos_shared::interrupt::INTERRUPT_ALIAS_CLOCK;
use zerocopy::FromBytes;

use crate::core::interrupts::{InterruptMsg, INTERRUPT_CLOCK};
use crate::core::Kernel;
use crate::error::{KernelError, Result};
use crate::network::addr::Address;
use crate::network::interface::IfaceId;
use crate::network::native::NativeIface;
use crate::network::packet::Packet;
use crate::network::stack::NetStack;
use crate::network::udp::UdpSocket;
use crate::process::{ContextBody, ContextId, ContextQueue, SchedulerMetadata, Step};

pub use control::{ControlServer, SchedulerControl};
pub use timer::{TimerClient, TimerEvent, TimerServer};

/// Body of the idle context: always runnable, never does anything
pub struct IdleBody;

impl ContextBody for IdleBody {
    fn resume(&mut self, kernel: &mut Kernel) -> Result<Step> {
        if kernel.clock_running() {
            std::thread::yield_now();
        }
        Ok(Step::Yield)
    }
}

pub struct BasicScheduler {
    id: ContextId,
    idle: ContextId,
    stack: NetStack,
    native: IfaceId,
    tick_socket: UdpSocket,
    timer: TimerServer,
    control: ControlServer,
    queue: ContextQueue,
    non_daemons: usize,
}

impl BasicScheduler {
    /// Create the scheduler context and its services, then run `create`
    /// as the scheduler so the contexts it spawns report to it
    pub fn start<F>(kernel: &mut Kernel, create: F) -> Result<Self>
    where
        F: FnOnce(&mut Kernel) -> Result<()>,
    {
        let id = kernel.spawn_host("scheduler", SchedulerMetadata::daemon())?;
        let previous = kernel.enter(id)?;
        let started = Self::init(kernel, id, create);
        kernel.leave(previous);
        if started.is_err() {
            if let Err(e) = kernel.destroy(id) {
                crate::warn!("scheduler: tearing down after failed start: {}", e);
            }
        }
        started
    }

    fn init<F>(kernel: &mut Kernel, id: ContextId, create: F) -> Result<Self>
    where
        F: FnOnce(&mut Kernel) -> Result<()>,
    {
        let ports = kernel.config().scheduler.clone();
        kernel.register_for(INTERRUPT_ALIAS_CLOCK, ports.clock_port)?;

        let mut stack = NetStack::for_kernel(kernel);
        let native = stack.open_native(kernel)?;
        native_of(&mut stack, native)?.set_yield_to_recipient(false);
        let tick_socket = UdpSocket::new(&mut stack);
        tick_socket.bind(&mut stack, kernel.my_address(), ports.clock_port)?;
        let timer = TimerServer::open(&mut stack, ports.timer_port)?;
        let control = ControlServer::open(&mut stack, ports.control_port)?;

        create(kernel)?;

        let idle = kernel.spawn("idle", Box::new(IdleBody), SchedulerMetadata::daemon())?;
        kernel.set_idle(idle)?;

        let mut queue = ContextQueue::new();
        let mut non_daemons = 0;
        for context in kernel.context_ids() {
            if context == id {
                continue;
            }
            if !kernel.context(context)?.metadata.is_daemon {
                non_daemons += 1;
            }
            queue.append(context);
        }
        crate::info!("scheduler: {} contexts, {} workers", queue.len(), non_daemons);

        Ok(BasicScheduler { id, idle, stack, native, tick_socket, timer, control, queue, non_daemons })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn idle(&self) -> ContextId {
        self.idle
    }

    pub fn queue(&self) -> &ContextQueue {
        &self.queue
    }

    pub fn non_daemons(&self) -> usize {
        self.non_daemons
    }

    pub fn timer(&self) -> &TimerServer {
        &self.timer
    }

    /// Run until only daemons are left
    pub fn run(&mut self, kernel: &mut Kernel) -> Result<()> {
        while self.step(kernel)? {}
        crate::info!("scheduler: no workers left");
        Ok(())
    }

    /// Run at most `max_steps` slots; returns how many were taken
    pub fn run_for(&mut self, kernel: &mut Kernel, max_steps: usize) -> Result<usize> {
        for taken in 0..max_steps {
            if !self.step(kernel)? {
                return Ok(taken);
            }
        }
        Ok(max_steps)
    }

    /// Give one context a slot; false once there is nothing left to run
    pub fn step(&mut self, kernel: &mut Kernel) -> Result<bool> {
        if self.queue.len() <= 1 || self.non_daemons == 0 {
            return Ok(false);
        }
        let previous = kernel.enter(self.id)?;
        let stepped = self.give_slot(kernel);
        kernel.leave(previous);
        stepped.map(|()| true)
    }

    fn give_slot(&mut self, kernel: &mut Kernel) -> Result<()> {
        kernel.dispatch_interrupts();
        self.drain_own_queue(kernel)?;

        let cur = self.select(kernel)?;
        if kernel.context(cur)?.is_finished() {
            self.queue.remove(cur)?;
            self.reap(kernel, cur);
            return Ok(());
        }
        if cur == self.idle && self.deadlocked(kernel)? {
            return Err(KernelError::AllContextsBlocked);
        }

        native_of(&mut self.stack, self.native)?.set_next_yield_to(Some(cur));
        let received = self.tick_socket.receive(&mut self.stack, kernel, true);
        let native = native_of(&mut self.stack, self.native)?;
        let consumed = native.next_yield_to().is_none();
        native.set_next_yield_to(None);
        match received {
            Ok(packet) => self.on_clock_packet(kernel, &packet),
            Err(
                KernelError::StoppedForOtherSocket
                | KernelError::ContextFinished
                | KernelError::YieldedToBlocked
                | KernelError::ContextYieldedBack
                | KernelError::PacketFilteredOut
                | KernelError::NoPacketAvailable,
            ) => {}
            Err(e) => return Err(e),
        }
        self.serve(kernel)?;

        if consumed {
            self.queue.remove(cur)?;
            if kernel.context(cur).map_or(true, |c| c.is_finished()) {
                self.reap(kernel, cur);
            } else {
                self.queue.append(cur);
            }
        }
        Ok(())
    }

    /// Handle what was sent to the scheduler since its last step
    fn drain_own_queue(&mut self, kernel: &mut Kernel) -> Result<()> {
        while kernel.context(self.id)?.pending_packets() > 0 {
            match self.tick_socket.receive(&mut self.stack, kernel, true) {
                Ok(packet) => self.on_clock_packet(kernel, &packet),
                Err(KernelError::StoppedForOtherSocket | KernelError::PacketFilteredOut) => {}
                Err(KernelError::NoPacketAvailable) => break,
                Err(e) => return Err(e),
            }
        }
        self.serve(kernel)
    }

    fn serve(&mut self, kernel: &mut Kernel) -> Result<()> {
        self.timer.poll(&mut self.stack, kernel)?;
        self.control.poll(&mut self.stack, kernel)
    }

    /// First context in the queue that can take a slot; contexts passed
    /// over rotate to the back
    fn select(&mut self, kernel: &Kernel) -> Result<ContextId> {
        for _ in 0..self.queue.len() {
            let head = self.queue.head().ok_or(KernelError::AllContextsBlocked)?;
            if eligible(kernel, head) {
                return Ok(head);
            }
            self.queue.rotate();
        }
        Err(KernelError::AllContextsBlocked)
    }

    /// Only the idle context can run and nothing can wake anyone else
    fn deadlocked(&self, kernel: &Kernel) -> Result<bool> {
        let others = self.queue.iter().any(|c| c != self.idle && eligible(kernel, c));
        Ok(!others
            && !kernel.clock_running()
            && kernel.pending_interrupts() == 0
            && kernel.context(self.id)?.pending_packets() == 0)
    }

    fn on_clock_packet(&mut self, kernel: &mut Kernel, packet: &Packet) {
        if is_clock(packet) {
            self.timer.tick(&mut self.stack, kernel);
        } else {
            crate::debug!("scheduler: interrupt packet that wasn't a tick from {}", packet.ipv6.src);
        }
    }

    fn reap(&mut self, kernel: &mut Kernel, id: ContextId) {
        let daemon = kernel.context(id).map_or(true, |c| c.metadata.is_daemon);
        if !daemon {
            self.non_daemons = self.non_daemons.saturating_sub(1);
        }
        if let Err(e) = kernel.destroy(id) {
            crate::debug!("scheduler: reaping failed: {}", e);
        }
    }
}

fn native_of(stack: &mut NetStack, id: IfaceId) -> Result<&mut NativeIface> {
    stack.iface_mut(id)?.native_mut().ok_or(KernelError::InvalidArg)
}

fn eligible(kernel: &Kernel, id: ContextId) -> bool {
    kernel.context(id).is_ok_and(|c| {
        c.is_finished() || (c.metadata.is_running && !c.is_blocking())
    })
}

fn is_clock(packet: &Packet) -> bool {
    packet.routing.src == Address::KERNEL
        && InterruptMsg::read_from_prefix(packet.data()).is_some_and(|m| m.id() == INTERRUPT_CLOCK)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::testing::test_kernel;

    type Log = Rc<RefCell<Vec<String>>>;

    fn counter(log: &Log, name: &'static str, rounds: usize) -> Box<dyn ContextBody> {
        let log = log.clone();
        let mut left = rounds;
        Box::new(move |_: &mut Kernel| {
            log.borrow_mut().push(name.to_string());
            left -= 1;
            Ok(if left == 0 { Step::Exit } else { Step::Yield })
        })
    }

    #[test]
    fn failed_start_tears_the_scheduler_down() {
        let mut kernel = test_kernel();
        let started = BasicScheduler::start(&mut kernel, |_| Err(KernelError::InvalidArg));
        assert_eq!(started.err(), Some(KernelError::InvalidArg));
        assert!(kernel.context_ids().is_empty());
        assert!(kernel.interrupt_for(INTERRUPT_CLOCK).is_none());
        assert!(BasicScheduler::start(&mut kernel, |_| Ok(())).is_ok());
    }

    #[test]
    fn workers_take_turns_until_done() {
        let mut kernel = test_kernel();
        let log = Log::default();
        let mut sched = BasicScheduler::start(&mut kernel, |k| {
            k.spawn("a", counter(&log, "a", 2), SchedulerMetadata::worker())?;
            k.spawn("b", counter(&log, "b", 3), SchedulerMetadata::worker())?;
            Ok(())
        })
        .unwrap();
        assert_eq!(sched.queue().len(), 3);
        assert_eq!(sched.non_daemons(), 2);

        sched.run(&mut kernel).unwrap();
        assert_eq!(*log.borrow(), ["a", "b", "a", "b", "b"]);
        assert_eq!(sched.non_daemons(), 0);
        assert_eq!(sched.queue().iter().collect::<Vec<_>>(), [sched.idle()]);
        assert_eq!(kernel.packets_in_use(), 0);
    }

    #[test]
    fn dependents_wait_for_report() {
        let mut kernel = test_kernel();
        let log = Log::default();
        let service_log = log.clone();
        let mut control: Option<(NetStack, SchedulerControl)> = None;
        let service = move |k: &mut Kernel| -> Result<Step> {
            if control.is_none() {
                let mut stack = NetStack::for_kernel(k);
                stack.open_native(k)?;
                let mut client = SchedulerControl::connect(&mut stack)?;
                client.report_inited(&mut stack, k)?;
                service_log.borrow_mut().push("reported".to_string());
                control = Some((stack, client));
                return Ok(Step::Yield);
            }
            let Some((stack, client)) = control.as_mut() else {
                return Err(KernelError::InvalidArg);
            };
            match client.poll_reply(stack, k)? {
                Some(verdict) => {
                    verdict?;
                    service_log.borrow_mut().push("acknowledged".to_string());
                    Ok(Step::Exit)
                }
                None => Ok(Step::Blocked),
            }
        };

        let mut sched = BasicScheduler::start(&mut kernel, |k| {
            let a = k.spawn("service", Box::new(service), SchedulerMetadata::worker())?;
            k.spawn("user", counter(&log, "user", 1), SchedulerMetadata::after(a))?;
            Ok(())
        })
        .unwrap();
        sched.run(&mut kernel).unwrap();

        let log = log.borrow();
        let reported = log.iter().position(|e| e == "reported").unwrap();
        let used = log.iter().position(|e| e == "user").unwrap();
        assert!(reported < used);
        assert!(log.iter().any(|e| e == "acknowledged"));
        assert_eq!(kernel.packets_in_use(), 0);
    }

    #[test]
    fn timer_ticks_wake_a_sleeping_context() {
        let mut kernel = test_kernel();
        let ticked = Rc::new(RefCell::new(false));
        let flag = ticked.clone();
        let mut state: Option<(NetStack, TimerClient)> = None;
        let sleeper = move |k: &mut Kernel| -> Result<Step> {
            if state.is_none() {
                let mut stack = NetStack::for_kernel(k);
                stack.open_native(k)?;
                let socket = UdpSocket::new(&mut stack);
                socket.bind(&mut stack, Address::ZERO, 0)?;
                let mut timer = TimerClient::new(socket);
                timer.open(&mut stack, k, 9, 0, 200_000, false)?;
                state = Some((stack, timer));
                return Ok(Step::Yield);
            }
            let Some((stack, timer)) = state.as_mut() else {
                return Err(KernelError::InvalidArg);
            };
            match timer.socket().receive(stack, k, false) {
                Ok(packet) => match TimerClient::event(&packet) {
                    Some(TimerEvent::Tick { id: 9 }) => {
                        *flag.borrow_mut() = true;
                        Ok(Step::Exit)
                    }
                    _ => Ok(Step::Yield),
                },
                Err(KernelError::NoPacketAvailable) => Ok(Step::Blocked),
                Err(e) => Err(e),
            }
        };

        let mut sched = BasicScheduler::start(&mut kernel, |k| {
            k.spawn("sleeper", Box::new(sleeper), SchedulerMetadata::worker())?;
            Ok(())
        })
        .unwrap();
        for _ in 0..50 {
            kernel.raise_interrupt(INTERRUPT_CLOCK).unwrap();
            if !sched.step(&mut kernel).unwrap() {
                break;
            }
        }
        assert!(*ticked.borrow());
        assert_eq!(sched.non_daemons(), 0);
    }

    #[test]
    fn blocked_contexts_without_a_clock_are_reported() {
        let mut kernel = test_kernel();
        let mut sched = BasicScheduler::start(&mut kernel, |k| {
            let waiter = |k: &mut Kernel| -> Result<Step> {
                match k.receive() {
                    Ok(_) => Ok(Step::Exit),
                    Err(KernelError::NoPacketAvailable) => Ok(Step::Blocked),
                    Err(e) => Err(e),
                }
            };
            k.spawn("waiter", Box::new(waiter), SchedulerMetadata::worker())?;
            Ok(())
        })
        .unwrap();
        assert_eq!(sched.run_for(&mut kernel, 10), Err(KernelError::AllContextsBlocked));
    }

    #[test]
    fn contexts_waiting_on_a_dependency_are_skipped() {
        let mut kernel = test_kernel();
        let log = Log::default();
        let mut sched = BasicScheduler::start(&mut kernel, |k| {
            let first = k.spawn("first", counter(&log, "first", 3), SchedulerMetadata::worker())?;
            k.spawn("second", counter(&log, "second", 1), SchedulerMetadata::after(first))?;
            Ok(())
        })
        .unwrap();
        sched.run_for(&mut kernel, 4).unwrap();
        assert!(log.borrow().iter().all(|e| e == "first"));
    }
}
