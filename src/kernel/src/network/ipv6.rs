//! Inbound IPv6 header chain validation

use crate::error::KernelError;
use crate::network::packet::{Frame, HeaderKind, Ipv6Header};

const OPTION_PAD1: u8 = 0;

/// Why an inbound datagram was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Drop silently
    Discard(KernelError),
    /// Drop and answer with ICMP Parameter Problem (unrecognized option);
    /// `pointer` is the offending byte's offset in the datagram
    ParameterProblem { pointer: u32, error: KernelError },
}

impl Rejection {
    pub fn error(&self) -> KernelError {
        match self {
            Rejection::Discard(e) => *e,
            Rejection::ParameterProblem { error, .. } => *error,
        }
    }
}

/// Check every header before a datagram is handed up
///
/// Hop-by-hop and destination options are parsed: padding is skipped and
/// unknown options are treated according to the two high bits of their
/// type. Fragments and unknown headers are refused.
pub fn validate(frame: &Frame) -> Result<(), Rejection> {
    if frame.ipv6.version() != 6 {
        return Err(Rejection::Discard(KernelError::WrongProtocol));
    }
    for header in frame.headers() {
        match header.kind() {
            Some(HeaderKind::HopByHop | HeaderKind::Destination) => {
                let bytes = &frame.payload()[header.offset..header.offset + header.len];
                check_options(frame, header.offset, bytes)?;
            }
            Some(HeaderKind::Routing) => {}
            Some(HeaderKind::Fragment) => {
                return Err(Rejection::Discard(KernelError::FragmentsNotSupported))
            }
            Some(HeaderKind::Udp | HeaderKind::Tcp | HeaderKind::Icmp) => {}
            Some(HeaderKind::NoNext) | None => {
                return Err(Rejection::Discard(KernelError::NotImplemented))
            }
        }
    }
    Ok(())
}

fn check_options(frame: &Frame, header_offset: usize, bytes: &[u8]) -> Result<(), Rejection> {
    let mut pos = 2;
    while pos < bytes.len() {
        let kind = bytes[pos];
        if kind == OPTION_PAD1 {
            pos += 1;
            continue;
        }
        let len = bytes.get(pos + 1).copied().unwrap_or(0) as usize;
        match kind >> 6 {
            0 => {}
            1 => return Err(Rejection::Discard(KernelError::OptionNotSupported)),
            category => {
                if category == 3 && frame.ipv6.dest.is_multicast() {
                    return Err(Rejection::Discard(KernelError::OptionNotSupported));
                }
                let pointer = (Ipv6Header::SIZE + header_offset + pos) as u32;
                return Err(Rejection::ParameterProblem {
                    pointer,
                    error: KernelError::OptionNotSupported,
                });
            }
        }
        pos += 2 + len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{PacketPool, UdpHeader};

    fn with_option(pool: &PacketPool, option: [u8; 2]) -> crate::network::packet::Packet {
        let mut p = pool.alloc().unwrap();
        let hop = p.append_header(HeaderKind::HopByHop, 8).unwrap();
        // Pad1, then the option with two bytes of data, then Pad1
        p.payload[hop + 2] = OPTION_PAD1;
        p.payload[hop + 3] = option[0];
        p.payload[hop + 4] = option[1];
        p.append_header(HeaderKind::Udp, UdpHeader::SIZE).unwrap();
        p
    }

    #[test]
    fn skippable_options_pass() {
        let pool = PacketPool::new(1, 0);
        // PadN carrying two bytes
        let p = with_option(&pool, [1, 2]);
        assert_eq!(validate(&p), Ok(()));
    }

    #[test]
    fn option_categories() {
        let pool = PacketPool::new(1, 0);
        let p = with_option(&pool, [0x40 | 7, 2]);
        assert_eq!(validate(&p), Err(Rejection::Discard(KernelError::OptionNotSupported)));
        drop(p);

        let p = with_option(&pool, [0x80 | 7, 2]);
        assert_eq!(
            validate(&p),
            Err(Rejection::ParameterProblem { pointer: 43, error: KernelError::OptionNotSupported })
        );
        drop(p);

        let mut p = with_option(&pool, [0xc0 | 7, 2]);
        p.ipv6.dest = "ff02::1".parse().unwrap();
        assert_eq!(validate(&p), Err(Rejection::Discard(KernelError::OptionNotSupported)));
    }

    #[test]
    fn fragments_are_refused() {
        let pool = PacketPool::new(1, 0);
        let mut p = pool.alloc().unwrap();
        p.append_header(HeaderKind::Fragment, 8).unwrap();
        p.append_header(HeaderKind::Udp, UdpHeader::SIZE).unwrap();
        assert_eq!(validate(&p), Err(Rejection::Discard(KernelError::FragmentsNotSupported)));
    }
}
