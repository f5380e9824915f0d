//! Internet checksums for UDP, ICMPv6 and TCP
//!
//! Ones'-complement sum of 16-bit big-endian words over the IPv6
//! pseudo-header and the upper-layer segment. Words are assembled from
//! bytes, so the result does not depend on host byte order.

use crate::error::{KernelError, Result};
use crate::network::addr::Address;
use crate::network::packet::{Frame, HeaderKind};

/// Accumulate `data` into a running sum; an odd trailing byte is padded
/// with zero on the right
pub fn sum(initial: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut acc = initial;
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u64) << 8;
    }
    acc
}

pub fn fold(mut acc: u64) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

pub fn pseudo_header(src: &Address, dest: &Address, len: u32, next_header: u8) -> u64 {
    let acc = sum(0, &src.0);
    let acc = sum(acc, &dest.0);
    let acc = sum(acc, &len.to_be_bytes());
    sum(acc, &[0, 0, 0, next_header])
}

/// Byte offset of the checksum field inside a header of `kind`
fn checksum_field(kind: HeaderKind) -> Result<usize> {
    match kind {
        HeaderKind::Udp => Ok(6),
        HeaderKind::Icmp => Ok(2),
        HeaderKind::Tcp => Ok(16),
        _ => Err(KernelError::WrongProtocol),
    }
}

/// Checksum over the segment starting at the `kind` header, as currently
/// stored; zero means a correctly checksummed segment
pub fn compute(frame: &Frame, kind: HeaderKind) -> Result<u16> {
    checksum_field(kind)?;
    let header = frame.seek_header(kind)?;
    let segment = &frame.payload()[header.offset..];
    let acc = pseudo_header(&frame.ipv6.src, &frame.ipv6.dest, segment.len() as u32, kind as u8);
    Ok(!fold(sum(acc, segment)))
}

/// Compute and store the checksum of the `kind` segment
pub fn fill(frame: &mut Frame, kind: HeaderKind) -> Result<u16> {
    let field = checksum_field(kind)?;
    let offset = frame.seek_header(kind)?.offset + field;
    frame.payload[offset..offset + 2].fill(0);
    let mut value = compute(frame, kind)?;
    if value == 0 && kind == HeaderKind::Udp {
        value = 0xffff;
    }
    frame.payload[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    Ok(value)
}

pub fn verify(frame: &Frame, kind: HeaderKind) -> Result<bool> {
    Ok(compute(frame, kind)? == 0)
}
