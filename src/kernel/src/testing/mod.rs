//! Fixtures shared by unit tests

use crate::config::KernelConfig;
use crate::core::Kernel;
use crate::network::addr::Address;
use crate::network::packet::{HeaderKind, Packet, UdpHeader};

use zerocopy::byteorder::network_endian::U16;

/// Small kernel without host signal handlers
pub fn test_kernel() -> Kernel {
    let mut config = KernelConfig::default();
    config.interrupts.host_signals = false;
    config.packets.pool_size = 64;
    config.memory.context_arena_size = 16 * 1024;
    match Kernel::new(config) {
        Ok(kernel) => kernel,
        Err(e) => panic!("test kernel: {}", e),
    }
}

/// UDP packet addressed to `dest:port` carrying `data`
pub fn udp_packet(kernel: &Kernel, src: Address, dest: Address, port: u16, data: &[u8]) -> Packet {
    let mut p = kernel.packet_alloc().unwrap();
    p.ipv6.src = src;
    p.ipv6.dest = dest;
    p.routing.dest = dest;
    p.append_header(HeaderKind::Udp, UdpHeader::SIZE).unwrap();
    p.set_data_len(data.len()).unwrap();
    p.data_mut().copy_from_slice(data);
    let udp = p.udp_mut().unwrap();
    udp.dest_port = U16::new(port);
    udp.length = U16::new((UdpHeader::SIZE + data.len()) as u16);
    p
}
