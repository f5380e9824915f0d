//! Bounded packet queue
//!
//! Circular buffer with `start`/`count` bookkeeping. One queue can serve
//! several protocol consumers: `dequeue` takes the oldest packet of the
//! requested protocol and leaves every other packet in its original order.

use crate::error::{Bounced, KernelError};
use crate::network::packet::Packet;

/// Protocol value matching any packet in [`PacketQueue::dequeue`]
pub const ANY_PROTOCOL: u8 = 0;

pub struct PacketQueue {
    slots: Box<[Option<Packet>]>,
    start: usize,
    count: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        PacketQueue {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
            start: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn non_empty(&self) -> bool {
        self.count > 0
    }

    fn index(&self, i: usize) -> usize {
        (self.start + i) % self.slots.len()
    }

    pub fn enqueue(&mut self, packet: Packet) -> Result<(), Bounced> {
        if self.count >= self.slots.len() {
            return Err(Bounced::new(KernelError::QueueFull, packet));
        }
        let i = self.index(self.count);
        self.slots[i] = Some(packet);
        self.count += 1;
        Ok(())
    }

    /// Oldest packet whose protocol is `protocol` ([`ANY_PROTOCOL`] for the
    /// head), or `None` when nothing matches
    pub fn dequeue(&mut self, protocol: u8) -> Option<Packet> {
        if self.count == 0 {
            return None;
        }
        if protocol == ANY_PROTOCOL {
            let res = self.slots[self.start].take();
            self.start = (self.start + 1) % self.slots.len();
            self.count -= 1;
            return res;
        }

        let found = (0..self.count).find(|&i| {
            self.slots[self.index(i)]
                .as_ref()
                .is_some_and(|p| p.protocol() == protocol)
        })?;
        let res = self.slots[self.index(found)].take();
        // close the gap, keeping the rest in order
        for i in found..self.count - 1 {
            let next = self.slots[self.index(i + 1)].take();
            let here = self.index(i);
            self.slots[here] = next;
        }
        self.count -= 1;
        res
    }

    /// Protocols of the queued packets, oldest first
    pub fn protocols(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.count).filter_map(|i| self.slots[self.index(i)].as_ref().map(|p| p.protocol()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{HeaderKind, PacketPool, TcpHeader};
    use proptest::prelude::*;

    fn packet(pool: &PacketPool, kind: HeaderKind, tag: u8) -> Packet {
        let mut p = pool.alloc().unwrap();
        let len = if kind == HeaderKind::Tcp { TcpHeader::SIZE } else { 8 };
        p.append_header(kind, len).unwrap();
        p.set_data_len(1).unwrap();
        p.data_mut()[0] = tag;
        p
    }

    #[test]
    fn full_queue_bounces_without_corruption() {
        let pool = PacketPool::new(8, 0);
        let mut q = PacketQueue::new(2);
        q.enqueue(packet(&pool, HeaderKind::Udp, 1)).unwrap();
        q.enqueue(packet(&pool, HeaderKind::Udp, 2)).unwrap();
        let bounced = q.enqueue(packet(&pool, HeaderKind::Udp, 3)).unwrap_err();
        assert_eq!(bounced.error, KernelError::QueueFull);
        assert_eq!(bounced.packet.as_ref().unwrap().data()[0], 3);
        drop(bounced);
        assert_eq!(q.dequeue(ANY_PROTOCOL).unwrap().data()[0], 1);
        assert_eq!(q.dequeue(ANY_PROTOCOL).unwrap().data()[0], 2);
        assert!(q.dequeue(ANY_PROTOCOL).is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn filtered_dequeue_keeps_others_in_place() {
        let pool = PacketPool::new(8, 0);
        let mut q = PacketQueue::new(4);
        q.enqueue(packet(&pool, HeaderKind::Icmp, 1)).unwrap();
        q.enqueue(packet(&pool, HeaderKind::Tcp, 2)).unwrap();
        q.enqueue(packet(&pool, HeaderKind::Udp, 3)).unwrap();
        q.enqueue(packet(&pool, HeaderKind::Icmp, 4)).unwrap();

        assert_eq!(q.dequeue(HeaderKind::Udp as u8).unwrap().data()[0], 3);
        assert!(q.dequeue(HeaderKind::Udp as u8).is_none());
        assert_eq!(q.protocols().collect::<Vec<_>>(), vec![58, 6, 58]);
        assert_eq!(q.dequeue(HeaderKind::Icmp as u8).unwrap().data()[0], 1);
        assert_eq!(q.dequeue(ANY_PROTOCOL).unwrap().data()[0], 2);
        assert_eq!(q.dequeue(ANY_PROTOCOL).unwrap().data()[0], 4);
        assert!(q.is_empty());
    }

    fn kind_of(i: u8) -> HeaderKind {
        [HeaderKind::Udp, HeaderKind::Icmp, HeaderKind::Tcp][i as usize % 3]
    }

    proptest! {
        #[test]
        fn dequeue_preserves_relative_order(
            kinds in proptest::collection::vec(0u8..3, 0..16),
            wanted in 0u8..3,
            rotate in 0usize..16,
        ) {
            let pool = PacketPool::new(32, 0);
            let mut q = PacketQueue::new(16);
            // move the start index around the ring first
            for _ in 0..rotate {
                q.enqueue(packet(&pool, HeaderKind::Udp, 0)).unwrap();
                q.dequeue(ANY_PROTOCOL).unwrap();
            }
            for (tag, k) in kinds.iter().enumerate() {
                q.enqueue(packet(&pool, kind_of(*k), tag as u8)).unwrap();
            }
            prop_assert!(q.non_empty() == !kinds.is_empty());

            let wanted_kind = kind_of(wanted) as u8;
            let mut got = Vec::new();
            while let Some(p) = q.dequeue(wanted_kind) {
                got.push(p.data()[0]);
            }
            let expected: Vec<u8> = kinds.iter().enumerate()
                .filter(|(_, k)| kind_of(**k) as u8 == wanted_kind)
                .map(|(tag, _)| tag as u8)
                .collect();
            prop_assert_eq!(got, expected);

            let mut rest = Vec::new();
            while let Some(p) = q.dequeue(ANY_PROTOCOL) {
                rest.push(p.data()[0]);
            }
            let expected_rest: Vec<u8> = kinds.iter().enumerate()
                .filter(|(_, k)| kind_of(**k) as u8 != wanted_kind)
                .map(|(tag, _)| tag as u8)
                .collect();
            prop_assert_eq!(rest, expected_rest);
            prop_assert_eq!(pool.in_use(), 0);
        }
    }
}
