//! Scheduler control service
//!
//! Contexts that others depend on report here once initialised. The
//! server marks the sender inited and makes its dependents runnable.

use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes};

use pktos_shared::control::{cmd, ControlReply, ControlRequest, CONTROL_PROTOCOL_VERSION};

use crate::core::Kernel;
use crate::error::{KernelError, Result};
use crate::network::addr::Address;
use crate::network::packet::Packet;
use crate::network::stack::NetStack;
use crate::network::udp::UdpSocket;
use crate::process::ContextId;

pub struct ControlServer {
    socket: UdpSocket,
}

impl ControlServer {
    pub fn open(stack: &mut NetStack, port: u16) -> Result<Self> {
        let socket = UdpSocket::new(stack);
        if let Err(e) = socket.bind(stack, Address::ZERO, port) {
            if let Err(close) = socket.close(stack) {
                crate::warn!("control: closing socket: {}", close);
            }
            return Err(e);
        }
        Ok(ControlServer { socket })
    }

    pub fn socket(&self) -> UdpSocket {
        self.socket
    }

    pub fn poll(&mut self, stack: &mut NetStack, kernel: &mut Kernel) -> Result<()> {
        while self.socket.receive_pending(stack)? {
            let packet = self.socket.receive(stack, kernel, true)?;
            self.handle(stack, kernel, packet);
        }
        Ok(())
    }

    fn handle(&self, stack: &mut NetStack, kernel: &mut Kernel, packet: Packet) {
        let Some(request) = ControlRequest::read_from_prefix(packet.data()) else {
            crate::debug!("control: short request from {}", packet.ipv6.src);
            return;
        };
        let Ok(udp) = packet.udp() else {
            return;
        };
        let reply_to = (packet.ipv6.src, udp.src_port.get());
        let sender = packet.routing.src;
        drop(packet);

        let outcome = if request.version.get() != CONTROL_PROTOCOL_VERSION {
            Err(KernelError::ProtocolVersionMismatch)
        } else {
            match request.cmd.get() {
                cmd::REPORT_INITED => report_inited(kernel, &sender),
                _ => Err(KernelError::BadProtocolCommand),
            }
        };
        let reply = ControlReply::to(&request, outcome.err().map_or(0, |e| e.to_error_code()));
        if let Err(e) = self.reply(stack, kernel, reply_to, reply) {
            crate::debug!("control: reply to {} not sent: {}", reply_to.0, e);
        }
    }

    fn reply(&self, stack: &mut NetStack, kernel: &mut Kernel, to: (Address, u16), reply: ControlReply) -> Result<()> {
        let mut packet = self.socket.packet_new(stack, kernel, ControlReply::SIZE)?;
        packet.ipv6.dest = to.0;
        packet.udp_mut()?.dest_port = U16::new(to.1);
        packet.data_mut().copy_from_slice(reply.as_bytes());
        self.socket.send(stack, kernel, packet).map_err(KernelError::from)
    }
}

/// Mark the context at `sender` inited and start everything waiting on it
fn report_inited(kernel: &mut Kernel, sender: &Address) -> Result<()> {
    let id = kernel.find_context(sender).ok_or(KernelError::DoesNotExist)?;
    kernel.context_mut(id)?.metadata.is_inited = true;
    crate::info!("control: {} inited", kernel.context(id)?.name());
    for other in dependents(kernel, id) {
        let context = kernel.context_mut(other)?;
        context.metadata.is_running = true;
        crate::debug!("control: starting {}", context.name());
    }
    Ok(())
}

fn dependents(kernel: &Kernel, id: ContextId) -> Vec<ContextId> {
    kernel
        .context_ids()
        .into_iter()
        .filter(|c| kernel.context(*c).is_ok_and(|c| c.metadata.depends_on == Some(id)))
        .collect()
}

/// Client side: lets a context talk to its scheduler's control server
pub struct SchedulerControl {
    socket: UdpSocket,
    next_request: u16,
}

impl SchedulerControl {
    /// Bind an anonymous socket for the exchange
    pub fn connect(stack: &mut NetStack) -> Result<Self> {
        let socket = UdpSocket::new(stack);
        if let Err(e) = socket.bind(stack, Address::ZERO, 0) {
            if let Err(close) = socket.close(stack) {
                crate::warn!("control: closing socket: {}", close);
            }
            return Err(e);
        }
        Ok(SchedulerControl { socket, next_request: 1 })
    }

    pub fn socket(&self) -> UdpSocket {
        self.socket
    }

    /// Tell the scheduler this context is ready; returns the request id
    pub fn report_inited(&mut self, stack: &mut NetStack, kernel: &mut Kernel) -> Result<u16> {
        let request_id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1).max(1);
        let request = ControlRequest::new(cmd::REPORT_INITED, request_id);

        let mut packet = self.socket.packet_new(stack, kernel, ControlRequest::SIZE)?;
        packet.ipv6.dest = kernel.scheduler_address();
        packet.udp_mut()?.dest_port = U16::new(kernel.config().scheduler.control_port);
        packet.data_mut().copy_from_slice(request.as_bytes());
        self.socket.send(stack, kernel, packet).map_err(KernelError::from)?;
        Ok(request_id)
    }

    /// The scheduler's answer, if one arrived
    ///
    /// `Ok(None)` means nothing is queued yet; the outer result carries
    /// receive failures, the inner one the scheduler's verdict.
    pub fn poll_reply(&self, stack: &mut NetStack, kernel: &mut Kernel) -> Result<Option<Result<()>>> {
        let packet = match self.socket.receive(stack, kernel, true) {
            Ok(p) => p,
            Err(KernelError::NoPacketAvailable | KernelError::StoppedForOtherSocket) => return Ok(None),
            Err(e) => return Err(e),
        };
        let reply = ControlReply::read_from_prefix(packet.data()).ok_or(KernelError::InvalidArg)?;
        if reply.version.get() != CONTROL_PROTOCOL_VERSION {
            return Err(KernelError::ProtocolVersionMismatch);
        }
        Ok(Some(KernelError::from_error_code(reply.error.get())))
    }

    pub fn close(self, stack: &mut NetStack) -> Result<()> {
        self.socket.close(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SchedulerMetadata;
    use crate::testing::test_kernel;

    struct Setup {
        kernel: Kernel,
        sched: ContextId,
        sched_stack: NetStack,
        server: ControlServer,
        ctx: ContextId,
        stack: NetStack,
        control: SchedulerControl,
    }

    impl Setup {
        fn new() -> Self {
            let mut kernel = test_kernel();
            let sched = kernel.spawn_host("scheduler", SchedulerMetadata::daemon()).unwrap();
            let prev = kernel.enter(sched).unwrap();
            let mut sched_stack = NetStack::for_kernel(&kernel);
            sched_stack.open_native(&kernel).unwrap();
            let server = ControlServer::open(&mut sched_stack, kernel.config().scheduler.control_port).unwrap();
            let ctx = kernel.spawn_host("service", SchedulerMetadata::worker()).unwrap();
            kernel.leave(prev);

            let prev = kernel.enter(ctx).unwrap();
            let mut stack = NetStack::for_kernel(&kernel);
            stack.open_native(&kernel).unwrap();
            let control = SchedulerControl::connect(&mut stack).unwrap();
            kernel.leave(prev);
            Setup { kernel, sched, sched_stack, server, ctx, stack, control }
        }

        fn serve(&mut self) {
            let prev = self.kernel.enter(self.sched).unwrap();
            let socket = self.server.socket();
            while let Ok(packet) = socket.receive(&mut self.sched_stack, &mut self.kernel, false) {
                self.server.handle(&mut self.sched_stack, &mut self.kernel, packet);
            }
            self.kernel.leave(prev);
        }

        fn reply(&mut self) -> Option<Result<()>> {
            let prev = self.kernel.enter(self.ctx).unwrap();
            let reply = self.control.poll_reply(&mut self.stack, &mut self.kernel).unwrap();
            self.kernel.leave(prev);
            reply
        }
    }

    #[test]
    fn report_inited_starts_dependents() {
        let mut s = Setup::new();
        let prev = s.kernel.enter(s.sched).unwrap();
        let waiter = s.kernel.spawn_host("waiter", SchedulerMetadata::after(s.ctx)).unwrap();
        let other = s.kernel.spawn_host("other", SchedulerMetadata::after(s.sched)).unwrap();
        s.kernel.leave(prev);
        assert!(!s.kernel.context(waiter).unwrap().metadata.is_running);

        let prev = s.kernel.enter(s.ctx).unwrap();
        assert_eq!(s.control.report_inited(&mut s.stack, &mut s.kernel), Ok(1));
        s.kernel.leave(prev);
        assert_eq!(s.reply(), None);
        s.serve();

        assert_eq!(s.reply(), Some(Ok(())));
        assert!(s.kernel.context(s.ctx).unwrap().metadata.is_inited);
        assert!(s.kernel.context(waiter).unwrap().metadata.is_running);
        assert!(!s.kernel.context(other).unwrap().metadata.is_running);
    }

    #[test]
    fn unknown_command_is_refused() {
        let mut s = Setup::new();
        let prev = s.kernel.enter(s.ctx).unwrap();
        let mut packet = s.control.socket().packet_new(&s.stack, &s.kernel, ControlRequest::SIZE).unwrap();
        packet.ipv6.dest = s.kernel.scheduler_address();
        packet.udp_mut().unwrap().dest_port = U16::new(s.kernel.config().scheduler.control_port);
        packet
            .data_mut()
            .copy_from_slice(ControlRequest::new(cmd::INVALID, 4).as_bytes());
        s.control.socket().send(&mut s.stack, &mut s.kernel, packet).unwrap();
        s.kernel.leave(prev);

        s.serve();
        assert_eq!(s.reply(), Some(Err(KernelError::BadProtocolCommand)));
        assert!(!s.kernel.context(s.ctx).unwrap().metadata.is_inited);
    }
}
