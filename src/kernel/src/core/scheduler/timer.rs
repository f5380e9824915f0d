//! Timer service
//!
//! The scheduler runs a timer server on a fixed UDP port. Contexts open
//! timers with a [`TimerRequest`]; on expiry the server sends a `Tick`
//! reply carrying the caller's timer id. Pending timers sit in a delta
//! list advanced once per clock interrupt.

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes};

use pktos_shared::timer::{cmd, time_to_ticks, TimerReply, TimerRequest, TIMER_PROTOCOL_VERSION};

use crate::core::Kernel;
use crate::error::{KernelError, Result};
use crate::network::addr::Address;
use crate::network::packet::Packet;
use crate::network::stack::NetStack;
use crate::network::udp::UdpSocket;

/// Timers are identified by the owner's endpoint plus its chosen id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    pub addr: Address,
    pub port: u16,
    pub id: u32,
}

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub key: TimerKey,
    pub request_id: u16,
    /// Length in ticks
    pub interval: u32,
    pub repeat: bool,
    delta: u32,
}

impl TimerEntry {
    pub fn new(key: TimerKey, request_id: u16, interval: u32, repeat: bool) -> Self {
        TimerEntry { key, request_id, interval, repeat, delta: interval }
    }
}

/// Pending timers, each holding its distance in ticks from the one before
#[derive(Debug, Default)]
pub struct TimerList {
    entries: Vec<TimerEntry>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert behind every timer expiring at the same tick or earlier
    pub fn insert(&mut self, mut entry: TimerEntry) {
        let mut delta = entry.interval;
        let mut at = 0;
        while let Some(e) = self.entries.get(at) {
            if e.delta > delta {
                break;
            }
            delta -= e.delta;
            at += 1;
        }
        if let Some(next) = self.entries.get_mut(at) {
            next.delta -= delta;
        }
        entry.delta = delta;
        self.entries.insert(at, entry);
    }

    pub fn remove(&mut self, key: &TimerKey) -> Option<TimerEntry> {
        let at = self.entries.iter().position(|e| e.key == *key)?;
        let entry = self.entries.remove(at);
        if let Some(next) = self.entries.get_mut(at) {
            next.delta += entry.delta;
        }
        Some(entry)
    }

    /// Advance one tick and take every timer that expired
    pub fn tick(&mut self) -> Vec<TimerEntry> {
        if let Some(head) = self.entries.first_mut() {
            head.delta = head.delta.saturating_sub(1);
        }
        let expired = self.entries.iter().take_while(|e| e.delta == 0).count();
        self.entries.drain(..expired).collect()
    }

    /// Ticks until `key` expires
    pub fn remaining(&self, key: &TimerKey) -> Option<u32> {
        let mut total = 0;
        for e in &self.entries {
            total += e.delta;
            if e.key == *key {
                return Some(total);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct TimerServer {
    socket: UdpSocket,
    timers: TimerList,
}

impl TimerServer {
    /// Bind the server on `port` at every local address
    pub fn open(stack: &mut NetStack, port: u16) -> Result<Self> {
        let socket = UdpSocket::new(stack);
        if let Err(e) = socket.bind(stack, Address::ZERO, port) {
            if let Err(close) = socket.close(stack) {
                crate::warn!("timer: closing socket: {}", close);
            }
            return Err(e);
        }
        Ok(TimerServer { socket, timers: TimerList::new() })
    }

    pub fn socket(&self) -> UdpSocket {
        self.socket
    }

    pub fn timers(&self) -> &TimerList {
        &self.timers
    }

    /// One clock tick: notify the owners of expired timers
    pub fn tick(&mut self, stack: &mut NetStack, kernel: &mut Kernel) {
        for entry in self.timers.tick() {
            let sent = self.reply(stack, kernel, entry.key, cmd::TICK, entry.request_id, 0);
            match sent {
                Err(KernelError::AddressUnreachable) => {
                    crate::debug!("timer: owner {} of timer {} is gone", entry.key.addr, entry.key.id);
                    continue;
                }
                Err(e) => crate::warn!("timer: tick for {} not sent: {}", entry.key.addr, e),
                Ok(()) => {}
            }
            if entry.repeat {
                self.timers.insert(TimerEntry::new(entry.key, entry.request_id, entry.interval, true));
            }
        }
    }

    /// Answer every request queued on the server socket
    pub fn poll(&mut self, stack: &mut NetStack, kernel: &mut Kernel) -> Result<()> {
        while self.socket.receive_pending(stack)? {
            let packet = self.socket.receive(stack, kernel, true)?;
            self.handle(stack, kernel, packet);
        }
        Ok(())
    }

    fn handle(&mut self, stack: &mut NetStack, kernel: &mut Kernel, packet: Packet) {
        let Some(request) = TimerRequest::read_from_prefix(packet.data()) else {
            crate::debug!("timer: short request from {}", packet.ipv6.src);
            return;
        };
        let Ok(udp) = packet.udp() else {
            return;
        };
        let from = TimerKey { addr: packet.ipv6.src, port: udp.src_port.get(), id: request.id.get() };
        drop(packet);

        let command = request.cmd.get();
        let outcome = if request.version.get() != TIMER_PROTOCOL_VERSION {
            Err(KernelError::ProtocolVersionMismatch)
        } else {
            match command {
                cmd::OPEN => self.open_timer(from, &request),
                cmd::CLOSE => self.timers.remove(&from).map(|_| ()).ok_or(KernelError::DoesNotExist),
                _ => Err(KernelError::BadProtocolCommand),
            }
        };
        let code = outcome.err().map_or(0, |e| e.to_error_code());
        if let Err(e) = self.reply(stack, kernel, from, command, request.request_id.get(), code) {
            crate::debug!("timer: reply to {} not sent: {}", from.addr, e);
        }
    }

    fn open_timer(&mut self, key: TimerKey, request: &TimerRequest) -> Result<()> {
        let ticks = time_to_ticks(request.open.sec.get(), request.open.usec.get());
        if ticks == 0 {
            return Err(KernelError::InvalidArg);
        }
        // reopening an id restarts it
        self.timers.remove(&key);
        let repeat = request.open.repeat != 0;
        crate::trace!("timer: {} port {} id {} in {} ticks", key.addr, key.port, key.id, ticks);
        self.timers.insert(TimerEntry::new(key, request.request_id.get(), ticks, repeat));
        Ok(())
    }

    fn reply(
        &self,
        stack: &mut NetStack,
        kernel: &mut Kernel,
        to: TimerKey,
        command: u16,
        request_id: u16,
        error: u32,
    ) -> Result<()> {
        let reply = TimerReply::new(to.id, command, request_id, error);
        let mut packet = self.socket.packet_new(stack, kernel, TimerReply::SIZE)?;
        packet.ipv6.dest = to.addr;
        packet.udp_mut()?.dest_port = U16::new(to.port);
        packet.data_mut().copy_from_slice(reply.as_bytes());
        self.socket.send(stack, kernel, packet).map_err(KernelError::from)
    }
}

/// What a timer client finds in a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Tick { id: u32 },
    Reply { id: u32, cmd: u16, request_id: u16, result: Result<()> },
}

/// Client side of the timer protocol over a bound socket
pub struct TimerClient {
    socket: UdpSocket,
    next_request: u16,
}

impl TimerClient {
    pub fn new(socket: UdpSocket) -> Self {
        TimerClient { socket, next_request: 1 }
    }

    pub fn socket(&self) -> UdpSocket {
        self.socket
    }

    /// Ask the scheduler for a timer firing after `sec` seconds and `usec`
    /// microseconds; returns the request id
    pub fn open(
        &mut self,
        stack: &mut NetStack,
        kernel: &mut Kernel,
        id: u32,
        sec: u32,
        usec: u32,
        repeat: bool,
    ) -> Result<u16> {
        let request_id = self.request_id();
        self.send(stack, kernel, TimerRequest::open(id, request_id, sec, usec, repeat))?;
        Ok(request_id)
    }

    pub fn close(&mut self, stack: &mut NetStack, kernel: &mut Kernel, id: u32) -> Result<u16> {
        let request_id = self.request_id();
        self.send(stack, kernel, TimerRequest::close(id, request_id))?;
        Ok(request_id)
    }

    /// Decode a datagram received on the client socket
    pub fn event(packet: &Packet) -> Option<TimerEvent> {
        if packet.data_len() != TimerReply::SIZE {
            return None;
        }
        let reply = TimerReply::read_from_prefix(packet.data())?;
        let id = reply.id.get();
        match reply.cmd.get() {
            cmd::TICK => Some(TimerEvent::Tick { id }),
            command => Some(TimerEvent::Reply {
                id,
                cmd: command,
                request_id: reply.request_id.get(),
                result: KernelError::from_error_code(reply.error.get()),
            }),
        }
    }

    fn request_id(&mut self) -> u16 {
        let id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1).max(1);
        id
    }

    fn send(&self, stack: &mut NetStack, kernel: &mut Kernel, request: TimerRequest) -> Result<()> {
        let mut packet = self.socket.packet_new(stack, kernel, TimerRequest::SIZE)?;
        packet.ipv6.dest = kernel.scheduler_address();
        packet.udp_mut()?.dest_port = U16::new(kernel.config().scheduler.timer_port);
        packet.data_mut().copy_from_slice(request.as_bytes());
        self.socket.send(stack, kernel, packet).map_err(KernelError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ContextId, SchedulerMetadata};
    use crate::testing::test_kernel;

    fn key(id: u32) -> TimerKey {
        TimerKey { addr: Address::ZERO, port: 1025, id }
    }

    #[test]
    fn delta_list_keeps_relative_deltas() {
        let mut list = TimerList::new();
        list.insert(TimerEntry::new(key(1), 0, 5, false));
        list.insert(TimerEntry::new(key(2), 0, 3, false));
        list.insert(TimerEntry::new(key(3), 0, 5, false));
        list.insert(TimerEntry::new(key(4), 0, 8, false));
        let deltas: Vec<u32> = list.entries.iter().map(|e| e.delta).collect();
        assert_eq!(deltas, [3, 2, 0, 3]);
        assert_eq!(list.remaining(&key(4)), Some(8));

        assert!(list.remove(&key(1)).is_some());
        assert_eq!(list.remaining(&key(3)), Some(5));
        assert_eq!(list.remaining(&key(4)), Some(8));

        assert!(list.tick().is_empty());
        assert!(list.tick().is_empty());
        let expired: Vec<u32> = list.tick().iter().map(|e| e.key.id).collect();
        assert_eq!(expired, [2]);
        let expired: Vec<u32> = list.tick().into_iter().chain(list.tick()).map(|e| e.key.id).collect();
        assert_eq!(expired, [3]);
        assert_eq!(list.len(), 1);
    }

    struct Setup {
        kernel: Kernel,
        sched: ContextId,
        sched_stack: NetStack,
        server: TimerServer,
        client: ContextId,
        client_stack: NetStack,
        timer: TimerClient,
    }

    impl Setup {
        fn new() -> Self {
            let mut kernel = test_kernel();
            let sched = kernel.spawn_host("scheduler", SchedulerMetadata::daemon()).unwrap();
            let prev = kernel.enter(sched).unwrap();
            let mut sched_stack = NetStack::for_kernel(&kernel);
            sched_stack.open_native(&kernel).unwrap();
            let server = TimerServer::open(&mut sched_stack, kernel.config().scheduler.timer_port).unwrap();
            let client = kernel.spawn_host("client", SchedulerMetadata::worker()).unwrap();
            kernel.leave(prev);

            let prev = kernel.enter(client).unwrap();
            let mut client_stack = NetStack::for_kernel(&kernel);
            client_stack.open_native(&kernel).unwrap();
            let socket = UdpSocket::new(&mut client_stack);
            socket.bind(&mut client_stack, Address::ZERO, 0).unwrap();
            kernel.leave(prev);

            Setup { kernel, sched, sched_stack, server, client, client_stack, timer: TimerClient::new(socket) }
        }

        fn open(&mut self, id: u32, sec: u32, usec: u32, repeat: bool) {
            let prev = self.kernel.enter(self.client).unwrap();
            self.timer.open(&mut self.client_stack, &mut self.kernel, id, sec, usec, repeat).unwrap();
            self.kernel.leave(prev);
        }

        fn close(&mut self, id: u32) {
            let prev = self.kernel.enter(self.client).unwrap();
            self.timer.close(&mut self.client_stack, &mut self.kernel, id).unwrap();
            self.kernel.leave(prev);
        }

        fn send_raw(&mut self, request: TimerRequest) {
            let prev = self.kernel.enter(self.client).unwrap();
            self.timer.send(&mut self.client_stack, &mut self.kernel, request).unwrap();
            self.kernel.leave(prev);
        }

        fn serve(&mut self) {
            let prev = self.kernel.enter(self.sched).unwrap();
            let socket = self.server.socket();
            while let Ok(packet) = socket.receive(&mut self.sched_stack, &mut self.kernel, false) {
                self.server.handle(&mut self.sched_stack, &mut self.kernel, packet);
            }
            self.kernel.leave(prev);
        }

        fn tick(&mut self, times: usize) {
            let prev = self.kernel.enter(self.sched).unwrap();
            for _ in 0..times {
                self.server.tick(&mut self.sched_stack, &mut self.kernel);
            }
            self.kernel.leave(prev);
        }

        fn events(&mut self) -> Vec<TimerEvent> {
            let prev = self.kernel.enter(self.client).unwrap();
            let socket = self.timer.socket();
            let mut events = Vec::new();
            while let Ok(packet) = socket.receive(&mut self.client_stack, &mut self.kernel, false) {
                events.extend(TimerClient::event(&packet));
            }
            self.kernel.leave(prev);
            events
        }
    }

    fn ack(id: u32, cmd: u16, request_id: u16, result: Result<()>) -> TimerEvent {
        TimerEvent::Reply { id, cmd, request_id, result }
    }

    #[test]
    fn repeating_timer_ticks_every_interval() {
        let mut s = Setup::new();
        s.open(7, 0, 200_000, true);
        s.serve();
        assert_eq!(s.events(), [ack(7, cmd::OPEN, 1, Ok(()))]);

        s.tick(1);
        assert!(s.events().is_empty());
        s.tick(1);
        assert_eq!(s.events(), [TimerEvent::Tick { id: 7 }]);
        s.tick(2);
        assert_eq!(s.events(), [TimerEvent::Tick { id: 7 }]);
        assert_eq!(s.server.timers().len(), 1);
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let mut s = Setup::new();
        s.open(1, 0, 100_000, false);
        s.serve();
        s.events();
        s.tick(3);
        assert_eq!(s.events(), [TimerEvent::Tick { id: 1 }]);
        assert!(s.server.timers().is_empty());
    }

    #[test]
    fn closed_timer_stops_ticking() {
        let mut s = Setup::new();
        s.open(3, 1, 0, true);
        s.serve();
        s.close(3);
        s.serve();
        s.close(3);
        s.serve();
        assert_eq!(
            s.events(),
            [
                ack(3, cmd::OPEN, 1, Ok(())),
                ack(3, cmd::CLOSE, 2, Ok(())),
                ack(3, cmd::CLOSE, 3, Err(KernelError::DoesNotExist)),
            ]
        );
        s.tick(20);
        assert!(s.events().is_empty());
    }

    #[test]
    fn malformed_requests_are_refused() {
        let mut s = Setup::new();
        s.open(1, 0, 10_000, false);
        let mut old = TimerRequest::open(2, 9, 1, 0, false);
        old.version = U16::new(TIMER_PROTOCOL_VERSION + 1);
        s.send_raw(old);
        let mut tick = TimerRequest::open(3, 10, 1, 0, false);
        tick.cmd = U16::new(cmd::TICK);
        s.send_raw(tick);
        s.serve();
        assert_eq!(
            s.events(),
            [
                ack(1, cmd::OPEN, 1, Err(KernelError::InvalidArg)),
                ack(2, cmd::OPEN, 9, Err(KernelError::ProtocolVersionMismatch)),
                ack(3, cmd::TICK, 10, Err(KernelError::BadProtocolCommand)),
            ]
        );
        assert!(s.server.timers().is_empty());
    }

    #[test]
    fn vanished_owner_loses_its_timer() {
        let mut s = Setup::new();
        s.open(5, 0, 100_000, true);
        s.serve();
        s.kernel.destroy(s.client).unwrap();
        s.tick(1);
        assert!(s.server.timers().is_empty());
    }
}
