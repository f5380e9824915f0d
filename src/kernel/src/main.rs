//! pktos-sim: boots the runtime on the host
//!
//! Usage: `pktos-sim [config.toml] [toml overrides]`
//!
//! Starts the router on the configured shared-memory backend and a few
//! demonstration contexts: a ticker using the timer service, and an echo
//! service whose client only starts once the service reports inited.

use std::error::Error;
use std::path::Path;
use std::process::ExitCode;

use zerocopy::byteorder::network_endian::U16;

use pktos_kernel::config::{KernelConfig, SegmentBackend};
use pktos_kernel::core::scheduler::{BasicScheduler, SchedulerControl, TimerClient, TimerEvent};
use pktos_kernel::network::router::Router;
use pktos_kernel::network::shm::{ShmPeer, ShmSegment};
use pktos_kernel::network::{Address, NetStack, UdpSocket};
use pktos_kernel::process::{ContextBody, SchedulerMetadata, Step};
use pktos_kernel::{Kernel, KernelError, Result};

const ECHO_PORT: u16 = 7;
const TICKER_TIMER: u32 = 1;
const TICKS: u32 = 5;

/// Counts repeating timer ticks, then closes the timer
#[derive(Default)]
struct Ticker {
    state: Option<(NetStack, TimerClient)>,
    ticks: u32,
}

impl ContextBody for Ticker {
    fn resume(&mut self, kernel: &mut Kernel) -> Result<Step> {
        if self.state.is_none() {
            let mut stack = NetStack::for_kernel(kernel);
            stack.open_native(kernel)?;
            let socket = UdpSocket::new(&mut stack);
            socket.bind(&mut stack, Address::ZERO, 0)?;
            let mut timer = TimerClient::new(socket);
            timer.open(&mut stack, kernel, TICKER_TIMER, 0, 100_000, true)?;
            self.state = Some((stack, timer));
            return Ok(Step::Yield);
        }
        let Some((stack, timer)) = self.state.as_mut() else {
            return Err(KernelError::InvalidArg);
        };
        loop {
            let packet = match timer.socket().receive(stack, kernel, false) {
                Ok(p) => p,
                Err(KernelError::NoPacketAvailable) => return Ok(Step::Blocked),
                Err(e) => return Err(e),
            };
            match TimerClient::event(&packet) {
                Some(TimerEvent::Tick { .. }) => {
                    self.ticks += 1;
                    log::info!("ticker: tick {}", self.ticks);
                    if self.ticks == TICKS {
                        timer.close(stack, kernel, TICKER_TIMER)?;
                        return Ok(Step::Exit);
                    }
                }
                Some(TimerEvent::Reply { result: Err(e), .. }) => return Err(e),
                _ => {}
            }
        }
    }
}

/// Reports inited, then echoes one datagram back to its sender
#[derive(Default)]
struct EchoService {
    state: Option<(NetStack, UdpSocket, SchedulerControl)>,
}

impl ContextBody for EchoService {
    fn resume(&mut self, kernel: &mut Kernel) -> Result<Step> {
        if self.state.is_none() {
            let mut stack = NetStack::for_kernel(kernel);
            stack.open_native(kernel)?;
            let socket = UdpSocket::new(&mut stack);
            socket.bind(&mut stack, Address::ZERO, ECHO_PORT)?;
            let mut control = SchedulerControl::connect(&mut stack)?;
            control.report_inited(&mut stack, kernel)?;
            self.state = Some((stack, socket, control));
            return Ok(Step::Yield);
        }
        let Some((stack, socket, control)) = self.state.as_mut() else {
            return Err(KernelError::InvalidArg);
        };
        if let Some(verdict) = control.poll_reply(stack, kernel)? {
            verdict?;
            log::info!("echo: scheduler acknowledged");
        }

        let request = match socket.receive(stack, kernel, true) {
            Ok(p) => p,
            Err(KernelError::NoPacketAvailable) => return Ok(Step::Blocked),
            Err(KernelError::StoppedForOtherSocket) => return Ok(Step::Yield),
            Err(e) => return Err(e),
        };
        let mut reply = socket.packet_new(stack, kernel, request.data_len())?;
        reply.ipv6.dest = request.ipv6.src;
        reply.udp_mut()?.dest_port = request.udp()?.src_port;
        reply.data_mut().copy_from_slice(request.data());
        socket.send(stack, kernel, reply)?;
        log::info!("echo: {} bytes back to {}", request.data_len(), request.ipv6.src);
        Ok(Step::Exit)
    }
}

/// Sends one datagram to the echo service and waits for it to return
struct EchoClient {
    server: Address,
    state: Option<(NetStack, UdpSocket)>,
}

impl ContextBody for EchoClient {
    fn resume(&mut self, kernel: &mut Kernel) -> Result<Step> {
        if self.state.is_none() {
            let mut stack = NetStack::for_kernel(kernel);
            stack.open_native(kernel)?;
            let socket = UdpSocket::new(&mut stack);
            socket.bind(&mut stack, Address::ZERO, 0)?;
            let message = b"hello from pktos";
            let mut packet = socket.packet_new(&stack, kernel, message.len())?;
            packet.ipv6.dest = self.server;
            packet.udp_mut()?.dest_port = U16::new(ECHO_PORT);
            packet.data_mut().copy_from_slice(message);
            socket.send(&mut stack, kernel, packet)?;
            self.state = Some((stack, socket));
            return Ok(Step::Yield);
        }
        let Some((stack, socket)) = self.state.as_mut() else {
            return Err(KernelError::InvalidArg);
        };
        match socket.receive(stack, kernel, false) {
            Ok(packet) => {
                log::info!(
                    "echo-client: \"{}\" from {}",
                    String::from_utf8_lossy(packet.data()),
                    packet.ipv6.src
                );
                Ok(Step::Exit)
            }
            Err(KernelError::NoPacketAvailable) => Ok(Step::Blocked),
            Err(e) => Err(e),
        }
    }
}

fn load_config() -> std::result::Result<KernelConfig, Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let mut config = match args.next() {
        Some(path) => KernelConfig::load(Path::new(&path), args.next().as_deref())?,
        None => KernelConfig::default(),
    };
    if config.interrupts.clock_interval_us == 0 {
        // the ticker needs a running clock
        config.interrupts.clock_interval_us = 100_000;
    }
    Ok(config)
}

fn run() -> std::result::Result<(), Box<dyn Error>> {
    let config = load_config()?;
    let mut kernel = Kernel::new(config)?;

    let router_config = kernel.config().router.clone();
    let mut peer: Option<ShmPeer> = None;
    let segment = match router_config.segment {
        SegmentBackend::Host => ShmSegment::host(router_config.shm_key)?,
        SegmentBackend::Local => {
            let (segment, local_peer) = ShmSegment::local(&kernel);
            peer = Some(local_peer);
            segment
        }
    };

    let mut scheduler = BasicScheduler::start(&mut kernel, |k| {
        Router::spawn(k, &router_config, segment)?;
        k.spawn("ticker", Box::new(Ticker::default()), SchedulerMetadata::worker())?;
        let service = k.spawn("echo", Box::new(EchoService::default()), SchedulerMetadata::worker())?;
        let server = k.context(service)?.address();
        let client = EchoClient { server, state: None };
        k.spawn("echo-client", Box::new(client), SchedulerMetadata::after(service))?;
        Ok(())
    })?;
    scheduler.run(&mut kernel)?;

    if let Some(peer) = peer {
        log::debug!("pktos-sim: outgoing slot {}", if peer.outgoing_ready() { "full" } else { "empty" });
    }
    log::info!("pktos-sim: done, {} packets still allocated", kernel.packets_in_use());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("pktos-sim: {}", e);
            ExitCode::FAILURE
        }
    }
}
