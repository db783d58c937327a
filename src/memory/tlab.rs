//! Thread-local allocation buffer. Small objects bump-allocate here with no
//! locking; each minor collection reclaims every TLAB, and a thread gets a
//! new one from gen0 on its next small allocation.

use super::heap::Heap;
use super::Address;

pub struct Tlab {
    head: Address,
    current: Address,
    /// Soft limit. The bytes in [limit, limit + reserve) are kept back so
    /// retirement can always place a filler array.
    limit: Address,
}

impl Tlab {
    pub const fn new() -> Tlab {
        Tlab {
            head: Address::null(),
            current: Address::null(),
            limit: Address::null(),
        }
    }

    pub fn reset(&mut self) {
        self.head = Address::null();
        self.current = Address::null();
        self.limit = Address::null();
    }

    pub fn is_valid(&self) -> bool {
        self.head.is_not_null()
    }

    pub fn head(&self) -> Address {
        self.head
    }

    pub fn current(&self) -> Address {
        self.current
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    /// Take over `[start, start + size)`; the usable part excludes the
    /// filler reserve at the end.
    pub fn fill(&mut self, start: Address, size: usize, reserve: usize) {
        debug_assert!(size > reserve);
        self.head = start;
        self.current = start;
        self.limit = start.uoffset(size - reserve);
    }

    /// Bump-allocate `size` bytes (block header included), or `None` when
    /// the buffer is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<Address> {
        if !self.is_valid() {
            return None;
        }
        let result = self.current;
        let advance = result.uoffset(size);
        if advance > self.limit {
            return None;
        }
        self.current = advance;
        return Some(result);
    }

    /// Fill the unused tail with a dummy int[] so the generation parses
    /// linearly, then drop the buffer.
    pub fn retire(&mut self, heap: &Heap) {
        if !self.is_valid() {
            return;
        }
        let hard_limit = self.limit.uoffset(heap.tlab_reserve_size());
        let remaining = hard_limit.diff(self.current);
        heap.fill_with_filler(self.current, remaining);
        self.reset();
    }
}
