use super::{align_size_up, Address, SIZE_ALIGNMENT};
use crate::object::prelude::Ptr;
use crate::os;

pub type SegmentPtr = Ptr<HeapSegment>;

/// Which generation a segment belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum GenId {
    Gen0 = 0,
    Gen1 = 1,
    Gen2 = 2,
    Loh = 3,
}

/// A carved region of the single heap reservation. The header lives at the
/// region start; usable memory begins at `start`. Memory between `committed`
/// and `end` is reserved but inaccessible until grown.
#[repr(C)]
pub struct HeapSegment {
    start: Address,
    committed: Address,
    end: Address,
    /// Allocation high-water mark; the linear heap walk parses [start, used).
    used: Address,
    gen: GenId,
    next: SegmentPtr,
}

impl HeapSegment {
    pub const HEADER_SIZE: usize = align_size_up(std::mem::size_of::<HeapSegment>(), SIZE_ALIGNMENT);

    /// Lay a segment header over `[base, base + size)` of already reserved
    /// memory and commit the first page for the header.
    pub fn init(base: Address, size: usize, gen: GenId) -> Option<SegmentPtr> {
        let initial = align_size_up(Self::HEADER_SIZE, os::page_size());
        if !os::commit_memory(base, initial) {
            return None;
        }
        let seg: SegmentPtr = Ptr::from_addr(base);
        let s = seg.as_mut_ref();
        s.start = base.uoffset(Self::HEADER_SIZE);
        s.committed = base.uoffset(initial);
        s.end = base.uoffset(size);
        s.used = s.start;
        s.gen = gen;
        s.next = SegmentPtr::null();
        return Some(seg);
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn used(&self) -> Address {
        self.used
    }

    pub fn gen(&self) -> GenId {
        self.gen
    }

    pub fn next(&self) -> SegmentPtr {
        self.next
    }

    pub fn set_next(&mut self, next: SegmentPtr) {
        self.next = next;
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn free_size(&self) -> usize {
        self.end.diff(self.used)
    }

    /// Bump `used` by `size`, growing the committed range on demand.
    /// Returns the start of the claimed range.
    pub fn claim(&mut self, size: usize) -> Option<Address> {
        let result = self.used;
        let new_used = result.uoffset(size);
        if new_used > self.end {
            return None;
        }
        if new_used > self.committed {
            let grow = align_size_up(new_used.diff(self.committed), os::page_size());
            let grow = grow.min(self.end.diff(self.committed));
            if !os::commit_memory(self.committed, grow) {
                log::warn!("segment commit failed, gen {:?}, {} bytes", self.gen, grow);
                return None;
            }
            self.committed = self.committed.uoffset(grow);
        }
        self.used = new_used;
        return Some(result);
    }

    /// Drop all allocations, keeping the committed range for reuse.
    pub fn reset(&mut self) {
        self.used = self.start;
    }
}
