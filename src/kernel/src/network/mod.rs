//! Network subsystem
//!
//! Contexts talk to each other and to the outside world in IPv6 datagrams.
//! Each context builds its own [`stack::NetStack`] out of interfaces
//! (native or shared memory), filters and UDP sockets; the kernel only
//! moves packets between context queues.

pub mod addr;
pub mod checksum;
pub mod filter;
pub mod icmp;
pub mod interface;
pub mod ip;
pub mod ipv6;
pub mod native;
pub mod packet;
pub mod queue;
pub mod router;
pub mod shm;
pub mod stack;
pub mod udp;

pub use addr::{Address, AddressMask};
pub use packet::{Packet, MTU};
pub use stack::NetStack;
pub use udp::UdpSocket;
