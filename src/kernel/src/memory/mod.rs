//! Memory range tracking
//!
//! The kernel does not page; it keeps books on which physical extents exist
//! and which owners have mapped which parts of them:
//! - **Physical ranges**: contiguous extents of one type, kept in address
//!   order, split on allocation and coalesced on free
//! - **Logical ranges**: one owner's window onto a physical range, linked
//!   both into the physical range's user list and the owner's list
//!
//! Windows onto one physical range never overlap and never extend past it.

pub mod arena;

use crate::error::{KernelError, Result};
use crate::process::ContextId;
use arena::{Arena, Handle};
use std::collections::BTreeMap;

pub const PAGE_SIZE: u64 = 4096;

bitflags::bitflags! {
    /// Access flags of a logical range
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u32 {
        const WRITABLE      = 1 << 0;
        const GROWABLE_UP   = 1 << 1;
        const GROWABLE_DOWN = 1 << 2;
        const COPY_ON_WRITE = 1 << 3;
        const GLOBAL        = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalType {
    Ram,
    Rom,
    Io,
}

/// Whose address space a logical range belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryOwner {
    Kernel,
    Context(ContextId),
}

pub type PhysicalId = Handle<PhysicalRange>;
pub type LogicalId = Handle<LogicalRange>;

#[derive(Debug)]
pub struct PhysicalRange {
    addr: u64,
    len: u64,
    kind: PhysicalType,
    in_use: bool,
    prev: Option<PhysicalId>,
    next: Option<PhysicalId>,
    first_user: Option<LogicalId>,
}

#[derive(Debug)]
pub struct LogicalRange {
    physical: PhysicalId,
    owner: MemoryOwner,
    offset: u64,
    len: u64,
    flags: MemoryFlags,
    segment: u16,
    prev_user: Option<LogicalId>,
    next_user: Option<LogicalId>,
    prev_in_owner: Option<LogicalId>,
    next_in_owner: Option<LogicalId>,
}

#[derive(Debug, Default)]
struct OwnerTable {
    first: Option<LogicalId>,
    last: Option<LogicalId>,
    segment_min: u16,
    segment_max: u16,
}

impl PhysicalRange {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn kind(&self) -> PhysicalType {
        self.kind
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn end(&self) -> u64 {
        self.addr + self.len
    }
}

impl LogicalRange {
    pub fn physical(&self) -> PhysicalId {
        self.physical
    }

    pub fn owner(&self) -> MemoryOwner {
        self.owner
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    pub fn segment(&self) -> u16 {
        self.segment
    }

    fn overlaps(&self, offset: u64, len: u64) -> bool {
        offset < self.offset + self.len && self.offset < offset + len
    }
}

/// Round `len` up to a whole number of pages, `None` past the address space
pub fn page_round_up(len: u64) -> Option<u64> {
    len.div_ceil(PAGE_SIZE).checked_mul(PAGE_SIZE)
}

#[derive(Default)]
pub struct MemoryTracker {
    physical: Arena<PhysicalRange>,
    logical: Arena<LogicalRange>,
    first: Option<PhysicalId>,
    owners: BTreeMap<MemoryOwner, OwnerTable>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn physical(&self, id: PhysicalId) -> Result<&PhysicalRange> {
        self.physical.get(id).ok_or(KernelError::InvalidArg)
    }

    pub fn logical(&self, id: LogicalId) -> Result<&LogicalRange> {
        self.logical.get(id).ok_or(KernelError::InvalidArg)
    }

    /// Address the logical range starts at
    pub fn logical_addr(&self, id: LogicalId) -> Result<u64> {
        let logical = self.logical(id)?;
        Ok(self.physical(logical.physical)?.addr + logical.offset)
    }

    /// Announce an extent of memory, page-rounded, as available
    pub fn define(&mut self, addr: u64, len: u64, kind: PhysicalType) -> Result<PhysicalId> {
        if len == 0 || addr % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArg);
        }
        let len = page_round_up(len).ok_or(KernelError::InvalidArg)?;
        let end = addr.checked_add(len).ok_or(KernelError::InvalidArg)?;

        let mut before = None;
        let mut cur = self.first;
        while let Some(id) = cur {
            let range = self.physical(id)?;
            if range.addr < end && addr < range.end() {
                return Err(KernelError::AddressInUse);
            }
            if range.addr > addr {
                break;
            }
            before = Some(id);
            cur = range.next;
        }

        let id = self.physical.insert(PhysicalRange {
            addr,
            len,
            kind,
            in_use: false,
            prev: None,
            next: None,
            first_user: None,
        });
        self.link_after(before, id);
        crate::debug!("memory: defined {:?} range {:#x}+{:#x}", kind, addr, len);
        Ok(id)
    }

    /// First-fit allocation of `len` bytes of `kind`, starting on a multiple
    /// of `alignment` (page alignment when zero)
    pub fn alloc(&mut self, kind: PhysicalType, len: u64, alignment: u64) -> Result<PhysicalId> {
        if len == 0 {
            return Err(KernelError::InvalidArg);
        }
        let len = page_round_up(len).ok_or(KernelError::OutOfMemory)?;
        let alignment = alignment.max(PAGE_SIZE);

        let mut cur = self.first;
        while let Some(id) = cur {
            let range = self.physical(id)?;
            cur = range.next;
            if range.kind != kind || !self.is_reusable(id) {
                continue;
            }
            let (base, end) = (range.addr, range.end());
            let misalignment = base % alignment;
            let start = if misalignment == 0 {
                Some(base)
            } else {
                base.checked_add(alignment - misalignment)
            };
            let Some(start) = start.filter(|s| s.checked_add(len).is_some_and(|e| e <= end)) else {
                continue;
            };

            let mut found = id;
            if start > base {
                found = self.split(id, start - base)?;
            }
            if self.physical(found)?.len > len {
                self.split(found, len)?;
            }
            if let Some(range) = self.physical.get_mut(found) {
                range.in_use = true;
            }
            crate::trace!("memory: allocated {:#x}+{:#x}", start, len);
            return Ok(found);
        }

        crate::warn!("memory: no {:?} range of {:#x} bytes available", kind, len);
        Err(KernelError::OutOfMemory)
    }

    /// Return a physical range to the available pool, merging it with free
    /// neighbours of the same type
    pub fn free(&mut self, id: PhysicalId) -> Result<()> {
        let range = self.physical(id)?;
        if range.first_user.is_some() {
            return Err(KernelError::ResourceInUse);
        }
        if !range.in_use {
            return Err(KernelError::ResourceNotInUse);
        }
        if let Some(range) = self.physical.get_mut(id) {
            range.in_use = false;
        }
        self.coalesce(id)
    }

    /// A range can be handed out again once nobody maps it and it is not
    /// allocated
    pub fn is_reusable(&self, id: PhysicalId) -> bool {
        self.physical
            .get(id)
            .is_some_and(|r| !r.in_use && r.first_user.is_none())
    }

    /// Map a window `[offset, offset+len)` of `physical` for `owner`; a zero
    /// `len` maps the rest of the range
    pub fn map(
        &mut self,
        physical: PhysicalId,
        owner: MemoryOwner,
        offset: u64,
        len: u64,
        flags: MemoryFlags,
    ) -> Result<LogicalId> {
        let range = self.physical(physical)?;
        if flags.contains(MemoryFlags::COPY_ON_WRITE) && !flags.contains(MemoryFlags::WRITABLE) {
            return Err(KernelError::InvalidArg);
        }
        if range.kind == PhysicalType::Rom && flags.contains(MemoryFlags::WRITABLE) {
            return Err(KernelError::InvalidArg);
        }
        if offset % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArg);
        }
        if offset >= range.len {
            return Err(KernelError::OutOfBounds);
        }
        let len = if len == 0 { range.len - offset } else { len };
        if offset.checked_add(len).map_or(true, |end| end > range.len) {
            return Err(KernelError::OutOfBounds);
        }

        // keep the user list sorted by offset
        let mut before = None;
        let mut cur = range.first_user;
        while let Some(id) = cur {
            let user = self.logical(id)?;
            if user.overlaps(offset, len) {
                return Err(KernelError::OutOfBounds);
            }
            if user.offset > offset {
                break;
            }
            before = Some(id);
            cur = user.next_user;
        }

        let segment = self.new_segment_id(owner)?;
        let id = self.logical.insert(LogicalRange {
            physical,
            owner,
            offset,
            len,
            flags,
            segment,
            prev_user: None,
            next_user: None,
            prev_in_owner: None,
            next_in_owner: None,
        });
        self.link_user_after(physical, before, id)?;
        self.link_into_owner(id)?;
        Ok(id)
    }

    /// Unmap a logical range from both its physical range and its owner
    pub fn release(&mut self, id: LogicalId) -> Result<()> {
        let logical = self.logical(id)?;
        let (physical, owner) = (logical.physical, logical.owner);
        let (prev_user, next_user) = (logical.prev_user, logical.next_user);
        let (prev_in_owner, next_in_owner) = (logical.prev_in_owner, logical.next_in_owner);

        match prev_user {
            Some(prev) => self.logical_mut(prev)?.next_user = next_user,
            None => self.physical_mut(physical)?.first_user = next_user,
        }
        if let Some(next) = next_user {
            self.logical_mut(next)?.prev_user = prev_user;
        }

        let table = self.owners.get_mut(&owner).ok_or(KernelError::InvalidArg)?;
        if prev_in_owner.is_none() {
            table.first = next_in_owner;
        }
        if next_in_owner.is_none() {
            table.last = prev_in_owner;
        }
        let empty = table.first.is_none();
        if let Some(prev) = prev_in_owner {
            self.logical_mut(prev)?.next_in_owner = next_in_owner;
        }
        if let Some(next) = next_in_owner {
            self.logical_mut(next)?.prev_in_owner = prev_in_owner;
        }
        if empty {
            self.owners.remove(&owner);
        }

        self.logical.remove(id);
        Ok(())
    }

    /// Release every range `owner` holds
    pub fn release_owner(&mut self, owner: MemoryOwner) -> Result<()> {
        for id in self.owner_ranges(owner) {
            self.release(id)?;
        }
        Ok(())
    }

    /// Logical ranges onto `physical`, in offset order
    pub fn users(&self, physical: PhysicalId) -> Vec<LogicalId> {
        let mut res = Vec::new();
        let mut cur = self.physical.get(physical).and_then(|r| r.first_user);
        while let Some(id) = cur {
            res.push(id);
            cur = self.logical.get(id).and_then(|l| l.next_user);
        }
        res
    }

    /// Logical ranges of `owner`, in address order
    pub fn owner_ranges(&self, owner: MemoryOwner) -> Vec<LogicalId> {
        let mut res = Vec::new();
        let mut cur = self.owners.get(&owner).and_then(|t| t.first);
        while let Some(id) = cur {
            res.push(id);
            cur = self.logical.get(id).and_then(|l| l.next_in_owner);
        }
        res
    }

    /// Physical ranges in address order
    pub fn ranges(&self) -> impl Iterator<Item = (PhysicalId, &PhysicalRange)> + '_ {
        let mut cur = self.first;
        core::iter::from_fn(move || {
            let id = cur?;
            let range = self.physical.get(id)?;
            cur = range.next;
            Some((id, range))
        })
    }

    pub fn avail(&self) -> impl Iterator<Item = (PhysicalId, &PhysicalRange)> + '_ {
        self.ranges().filter(|(_, r)| !r.in_use)
    }

    pub fn in_use(&self) -> impl Iterator<Item = (PhysicalId, &PhysicalRange)> + '_ {
        self.ranges().filter(|(_, r)| r.in_use)
    }

    fn physical_mut(&mut self, id: PhysicalId) -> Result<&mut PhysicalRange> {
        self.physical.get_mut(id).ok_or(KernelError::InvalidArg)
    }

    fn logical_mut(&mut self, id: LogicalId) -> Result<&mut LogicalRange> {
        self.logical.get_mut(id).ok_or(KernelError::InvalidArg)
    }

    fn link_after(&mut self, before: Option<PhysicalId>, id: PhysicalId) {
        let next = match before {
            Some(b) => self.physical.get(b).and_then(|r| r.next),
            None => self.first,
        };
        if let Some(range) = self.physical.get_mut(id) {
            range.prev = before;
            range.next = next;
        }
        match before.and_then(|b| self.physical.get_mut(b)) {
            Some(b) => b.next = Some(id),
            None => self.first = Some(id),
        }
        if let Some(n) = next.and_then(|n| self.physical.get_mut(n)) {
            n.prev = Some(id);
        }
    }

    fn unlink(&mut self, id: PhysicalId) -> Option<PhysicalRange> {
        let range = self.physical.remove(id)?;
        match range.prev.and_then(|p| self.physical.get_mut(p)) {
            Some(p) => p.next = range.next,
            None => self.first = range.next,
        }
        if let Some(n) = range.next.and_then(|n| self.physical.get_mut(n)) {
            n.prev = range.prev;
        }
        Some(range)
    }

    /// Cut `id` at `at` bytes; returns the tail, which is free
    fn split(&mut self, id: PhysicalId, at: u64) -> Result<PhysicalId> {
        let range = self.physical_mut(id)?;
        if at == 0 || at >= range.len {
            return Err(KernelError::InvalidArg);
        }
        let tail = PhysicalRange {
            addr: range.addr + at,
            len: range.len - at,
            kind: range.kind,
            in_use: false,
            prev: None,
            next: None,
            first_user: None,
        };
        range.len = at;
        let tail = self.physical.insert(tail);
        self.link_after(Some(id), tail);
        Ok(tail)
    }

    fn coalesce(&mut self, id: PhysicalId) -> Result<()> {
        let mut id = id;
        let range = self.physical(id)?;
        if let Some(prev) = range.prev {
            if self.can_merge(prev, id) {
                let len = self.unlink(id).map_or(0, |r| r.len);
                self.physical_mut(prev)?.len += len;
                id = prev;
            }
        }
        if let Some(next) = self.physical(id)?.next {
            if self.can_merge(id, next) {
                let len = self.unlink(next).map_or(0, |r| r.len);
                self.physical_mut(id)?.len += len;
            }
        }
        Ok(())
    }

    fn can_merge(&self, a: PhysicalId, b: PhysicalId) -> bool {
        match (self.physical.get(a), self.physical.get(b)) {
            (Some(ra), Some(rb)) => {
                ra.kind == rb.kind
                    && ra.end() == rb.addr
                    && self.is_reusable(a)
                    && self.is_reusable(b)
            }
            _ => false,
        }
    }

    fn link_user_after(
        &mut self,
        physical: PhysicalId,
        before: Option<LogicalId>,
        id: LogicalId,
    ) -> Result<()> {
        let next = match before {
            Some(b) => self.logical(b)?.next_user,
            None => self.physical(physical)?.first_user,
        };
        let logical = self.logical_mut(id)?;
        logical.prev_user = before;
        logical.next_user = next;
        match before {
            Some(b) => self.logical_mut(b)?.next_user = Some(id),
            None => self.physical_mut(physical)?.first_user = Some(id),
        }
        if let Some(n) = next {
            self.logical_mut(n)?.prev_user = Some(id);
        }
        Ok(())
    }

    /// Insert into the owner's list keeping it sorted by address
    fn link_into_owner(&mut self, id: LogicalId) -> Result<()> {
        let owner = self.logical(id)?.owner;
        let addr = self.logical_addr(id)?;

        let mut before = None;
        let mut cur = self.owners.get(&owner).and_then(|t| t.first);
        while let Some(c) = cur {
            if c != id {
                if self.logical_addr(c)? > addr {
                    break;
                }
                before = Some(c);
            }
            cur = self.logical(c)?.next_in_owner;
        }

        let next = match before {
            Some(b) => self.logical(b)?.next_in_owner,
            None => self.owners.get(&owner).and_then(|t| t.first),
        };
        let logical = self.logical_mut(id)?;
        logical.prev_in_owner = before;
        logical.next_in_owner = next;
        let table = self.owners.entry(owner).or_default();
        if before.is_none() {
            table.first = Some(id);
        }
        if next.is_none() {
            table.last = Some(id);
        }
        if let Some(b) = before {
            self.logical_mut(b)?.next_in_owner = Some(id);
        }
        if let Some(n) = next {
            self.logical_mut(n)?.prev_in_owner = Some(id);
        }
        Ok(())
    }

    /// Segment ids grow upwards, then downwards from the first one, then
    /// fill holes
    fn new_segment_id(&mut self, owner: MemoryOwner) -> Result<u16> {
        let in_use: Vec<u16> = self
            .owner_ranges(owner)
            .into_iter()
            .filter_map(|id| self.logical.get(id).map(|l| l.segment))
            .collect();
        let table = self.owners.entry(owner).or_default();
        if table.segment_max == 0 {
            table.segment_min = 1;
            table.segment_max = 1;
            return Ok(1);
        }
        if table.segment_max < u16::MAX {
            table.segment_max += 1;
            return Ok(table.segment_max);
        }
        if table.segment_min > 1 {
            table.segment_min -= 1;
            return Ok(table.segment_min);
        }
        (table.segment_min + 1..table.segment_max)
            .find(|id| !in_use.contains(id))
            .ok_or(KernelError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (MemoryTracker, PhysicalId) {
        let mut mem = MemoryTracker::new();
        let ram = mem.define(0x10_0000, 16 * PAGE_SIZE, PhysicalType::Ram).unwrap();
        (mem, ram)
    }

    #[test]
    fn define_rounds_to_pages_and_rejects_overlap() {
        let mut mem = MemoryTracker::new();
        let id = mem.define(0x4000, 100, PhysicalType::Ram).unwrap();
        assert_eq!(mem.physical(id).unwrap().len(), PAGE_SIZE);
        assert_eq!(mem.define(0x4000, PAGE_SIZE, PhysicalType::Rom), Err(KernelError::AddressInUse));
        assert_eq!(mem.avail().count(), 1);
    }

    #[test]
    fn alloc_splits_first_fit_and_respects_type() {
        let (mut mem, _) = tracker();
        mem.define(0x40_0000, 4 * PAGE_SIZE, PhysicalType::Rom).unwrap();
        let a = mem.alloc(PhysicalType::Ram, 3 * PAGE_SIZE, 0).unwrap();
        let range = mem.physical(a).unwrap();
        assert_eq!(range.addr(), 0x10_0000);
        assert_eq!(range.len(), 3 * PAGE_SIZE);
        assert!(range.in_use());

        let rom = mem.alloc(PhysicalType::Rom, PAGE_SIZE, 0).unwrap();
        assert_eq!(mem.physical(rom).unwrap().addr(), 0x40_0000);

        assert_eq!(mem.alloc(PhysicalType::Io, PAGE_SIZE, 0), Err(KernelError::OutOfMemory));
        assert_eq!(mem.alloc(PhysicalType::Ram, 64 * PAGE_SIZE, 0), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn alloc_honours_alignment() {
        let (mut mem, _) = tracker();
        let a = mem.alloc(PhysicalType::Ram, PAGE_SIZE, 0x3000).unwrap();
        assert_eq!(mem.physical(a).unwrap().addr(), 0x10_2000);
        // the skipped head stays available
        assert!(mem.avail().any(|(_, r)| r.addr() == 0x10_0000 && r.len() == 2 * PAGE_SIZE));
    }

    #[test]
    fn free_coalesces_neighbours() {
        let (mut mem, _) = tracker();
        let a = mem.alloc(PhysicalType::Ram, PAGE_SIZE, 0).unwrap();
        let b = mem.alloc(PhysicalType::Ram, PAGE_SIZE, 0).unwrap();
        mem.free(a).unwrap();
        mem.free(b).unwrap();
        let avail: Vec<_> = mem.avail().map(|(_, r)| (r.addr(), r.len())).collect();
        assert_eq!(avail, vec![(0x10_0000, 16 * PAGE_SIZE)]);
        assert_eq!(mem.free(b), Err(KernelError::InvalidArg));
    }

    #[test]
    fn mapping_rules() {
        let (mut mem, _) = tracker();
        let p = mem.alloc(PhysicalType::Ram, 4 * PAGE_SIZE, 0).unwrap();
        let owner = MemoryOwner::Kernel;

        assert_eq!(
            mem.map(p, owner, 0, PAGE_SIZE, MemoryFlags::COPY_ON_WRITE),
            Err(KernelError::InvalidArg)
        );
        assert_eq!(mem.map(p, owner, 100, PAGE_SIZE, MemoryFlags::empty()), Err(KernelError::InvalidArg));
        assert_eq!(
            mem.map(p, owner, 2 * PAGE_SIZE, 3 * PAGE_SIZE, MemoryFlags::empty()),
            Err(KernelError::OutOfBounds)
        );

        let head = mem.map(p, owner, 0, 2 * PAGE_SIZE, MemoryFlags::WRITABLE).unwrap();
        assert_eq!(
            mem.map(p, owner, PAGE_SIZE, PAGE_SIZE, MemoryFlags::empty()),
            Err(KernelError::OutOfBounds)
        );
        // zero length takes the rest
        let tail = mem.map(p, owner, 2 * PAGE_SIZE, 0, MemoryFlags::empty()).unwrap();
        assert_eq!(mem.logical(tail).unwrap().len(), 2 * PAGE_SIZE);
        assert_ne!(mem.logical(head).unwrap().segment(), mem.logical(tail).unwrap().segment());
        assert_eq!(mem.users(p), vec![head, tail]);
    }

    #[test]
    fn oversized_requests_are_refused() {
        let (mut mem, _) = tracker();
        let p = mem.alloc(PhysicalType::Ram, 2 * PAGE_SIZE, 0).unwrap();
        assert_eq!(
            mem.map(p, MemoryOwner::Kernel, PAGE_SIZE, u64::MAX, MemoryFlags::empty()),
            Err(KernelError::OutOfBounds)
        );
        assert!(mem.users(p).is_empty());

        assert_eq!(mem.define(0x4000, u64::MAX - 10, PhysicalType::Ram), Err(KernelError::InvalidArg));
        assert_eq!(
            mem.define(u64::MAX - PAGE_SIZE + 1, 2 * PAGE_SIZE, PhysicalType::Ram),
            Err(KernelError::InvalidArg)
        );
        assert_eq!(mem.alloc(PhysicalType::Ram, u64::MAX, 0), Err(KernelError::OutOfMemory));
        assert_eq!(mem.alloc(PhysicalType::Ram, PAGE_SIZE, 1 << 63), Err(KernelError::OutOfMemory));
        assert_eq!(page_round_up(u64::MAX), None);
    }

    #[test]
    fn rom_cannot_be_mapped_writable() {
        let mut mem = MemoryTracker::new();
        mem.define(0, PAGE_SIZE, PhysicalType::Rom).unwrap();
        let rom = mem.alloc(PhysicalType::Rom, PAGE_SIZE, 0).unwrap();
        assert_eq!(
            mem.map(rom, MemoryOwner::Kernel, 0, 0, MemoryFlags::WRITABLE),
            Err(KernelError::InvalidArg)
        );
    }

    #[test]
    fn release_unlinks_from_both_lists() {
        let (mut mem, _) = tracker();
        let p = mem.alloc(PhysicalType::Ram, 2 * PAGE_SIZE, 0).unwrap();
        let owner = MemoryOwner::Kernel;
        let second = mem.map(p, owner, PAGE_SIZE, PAGE_SIZE, MemoryFlags::empty()).unwrap();
        let first = mem.map(p, owner, 0, PAGE_SIZE, MemoryFlags::empty()).unwrap();
        assert_eq!(mem.owner_ranges(owner), vec![first, second]);

        assert_eq!(mem.free(p), Err(KernelError::ResourceInUse));
        mem.release(first).unwrap();
        assert_eq!(mem.users(p), vec![second]);
        assert_eq!(mem.owner_ranges(owner), vec![second]);
        mem.release_owner(owner).unwrap();
        assert!(mem.users(p).is_empty());
        assert!(mem.owner_ranges(owner).is_empty());

        assert!(!mem.is_reusable(p));
        mem.free(p).unwrap();
        // the freed range merged back into the pool
        assert_eq!(mem.avail().count(), 1);
        assert!(mem.alloc(PhysicalType::Ram, 16 * PAGE_SIZE, 0).is_ok());
    }
}
