//! Card table and brick table for tracking old-to-young references.
//!
//! One byte of card table covers `1 << CARD_BYTE_SHIFT` bytes of heap. The
//! write barrier dirties the whole byte, so concurrent stores can only
//! over-approximate, never lose a dirty bit. The table is "translated":
//! `translated + (addr >> CARD_BYTE_SHIFT)` indexes it directly without
//! subtracting the heap base on every barrier.
//!
//! A brick covers two cards; its entry records the offset of the first object
//! header inside the brick (entry - 1), 0 when unassigned, or a negative
//! back-jump in bricks, so a scan can start parsing at a dirty card without
//! walking from the segment start.

use super::{Address, align_size_up};
use crate::object::prelude::Ptr;
use crate::os;

#[cfg(target_pointer_width = "64")]
pub const CARD_BYTE_SHIFT: usize = 11;
#[cfg(not(target_pointer_width = "64"))]
pub const CARD_BYTE_SHIFT: usize = 10;

pub const CARD_SIZE: usize = 1 << CARD_BYTE_SHIFT;
pub const BRICK_SIZE: usize = CARD_SIZE * 2;

const CARD_DIRTY: u8 = 0xFF;

fn card_index(addr: Address) -> usize {
    addr.as_usize() >> CARD_BYTE_SHIFT
}

pub struct CardTable {
    lowest: Address,
    highest: Address,
    /// `translated + card_index(addr)` is the card byte of `addr`.
    translated: Ptr<u8>,
    bricks: Ptr<i16>,
    storage: Address,
    storage_size: usize,
}

impl CardTable {
    pub fn new(lowest: Address, highest: Address) -> Option<CardTable> {
        let card_count = card_index(highest.offset(-1)) - card_index(lowest) + 1;
        let brick_count = highest.diff(lowest) / BRICK_SIZE + 1;
        let alloc_size = align_size_up(
            card_count + brick_count * std::mem::size_of::<i16>(),
            os::page_size(),
        );

        let mem = os::reserve_memory(alloc_size);
        if mem.is_null() {
            return None;
        }
        if !os::commit_memory(mem, alloc_size) {
            os::release_memory(mem, alloc_size);
            return None;
        }

        let translated: Ptr<u8> = Ptr::from_usize(mem.as_usize().wrapping_sub(card_index(lowest)));
        return Some(CardTable {
            lowest,
            highest,
            translated,
            bricks: Ptr::from_addr(mem.uoffset(card_count)),
            storage: mem,
            storage_size: alloc_size,
        });
    }

    pub fn destroy(&self) {
        os::release_memory(self.storage, self.storage_size);
    }

    #[inline(always)]
    fn card_byte(&self, addr: Address) -> Ptr<u8> {
        debug_assert!(addr >= self.lowest && addr < self.highest);
        self.translated.offset(card_index(addr) as isize)
    }

    #[inline(always)]
    pub fn dirty(&self, addr: Address) {
        *self.card_byte(addr).as_mut_ref() = CARD_DIRTY;
    }

    #[inline(always)]
    pub fn is_dirty(&self, addr: Address) -> bool {
        *self.card_byte(addr).as_ref() != 0
    }

    /// Clear every card covering `[from, to)`.
    pub fn clear_range(&self, from: Address, to: Address) {
        let first = self.card_byte(from);
        let count = card_index(to.offset(-1)) - card_index(from) + 1;
        for i in 0..count {
            *first.offset(i as isize).as_mut_ref() = 0;
        }
    }

    /// Walk the dirty cards covering `[from, to)`, reporting each dirty card
    /// as its heap address range.
    pub fn each_dirty_card<F: FnMut(Address, Address)>(&self, from: Address, to: Address, mut f: F) {
        let mut card = card_index(from);
        let last = card_index(to.offset(-1));
        while card <= last {
            if *self.translated.offset(card as isize).as_ref() != 0 {
                let card_start = Address::from_usize(card << CARD_BYTE_SHIFT);
                let card_end = card_start.uoffset(CARD_SIZE);
                f(card_start.max(from), card_end.min(to));
            }
            card += 1;
        }
    }

    fn brick_index(&self, addr: Address) -> usize {
        addr.diff(self.lowest) / BRICK_SIZE
    }

    fn brick_base(&self, index: usize) -> Address {
        self.lowest.uoffset(index * BRICK_SIZE)
    }

    fn brick_entry(&self, index: usize) -> i16 {
        *self.bricks.offset(index as isize).as_ref()
    }

    fn set_brick_entry(&self, index: usize, value: i16) {
        *self.bricks.offset(index as isize).as_mut_ref() = value;
    }

    /// Record a freshly allocated block at `start` spanning `size` bytes.
    /// Only the first object start in a brick is recorded; bricks covered by
    /// the block's tail get back-jump entries so a scan starting there finds
    /// the spanning header.
    pub fn record_block(&self, start: Address, size: usize) {
        let first = self.brick_index(start);
        if self.brick_entry(first) == 0 {
            let offset = start.diff(self.brick_base(first));
            debug_assert!(offset + 1 <= i16::MAX as usize);
            self.set_brick_entry(first, (offset + 1) as i16);
        }
        let last = self.brick_index(start.uoffset(size).offset(-1));
        let mut b = first + 1;
        while b <= last {
            if self.brick_entry(b) == 0 {
                let back = (b - first).min(i16::MAX as usize);
                self.set_brick_entry(b, -(back as i16));
            }
            b += 1;
        }
    }

    /// Find an object start at or before `addr` to begin a linear parse,
    /// bounded below by `floor` (the segment data start).
    pub fn find_scan_start(&self, addr: Address, floor: Address) -> Address {
        let mut b = self.brick_index(addr);
        let floor_brick = self.brick_index(floor);
        loop {
            let e = self.brick_entry(b);
            if e > 0 {
                let start = self.brick_base(b).uoffset((e - 1) as usize);
                if start <= addr {
                    return start.max(floor);
                }
                // First start in this brick is past addr; the covering object
                // begins in an earlier brick.
                if b == floor_brick {
                    return floor;
                }
                b -= 1;
            } else if e < 0 {
                let back = (-e) as usize;
                if b < floor_brick + back {
                    return floor;
                }
                b -= back;
            } else {
                if b == floor_brick {
                    return floor;
                }
                b -= 1;
            }
        }
    }

    /// Forget all block starts in `[from, to)`.
    pub fn clear_bricks(&self, from: Address, to: Address) {
        let mut b = self.brick_index(from);
        let last = self.brick_index(to.offset(-1));
        while b <= last {
            self.set_brick_entry(b, 0);
            b += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CardTable {
        crate::os::init();
        let base = os::reserve_memory(1 << 20);
        assert!(base.is_not_null());
        CardTable::new(base, base.uoffset(1 << 20)).unwrap()
    }

    #[test]
    fn dirty_and_clear() {
        let ct = table();
        let addr = ct.lowest.uoffset(CARD_SIZE * 3 + 17);
        assert!(!ct.is_dirty(addr));
        ct.dirty(addr);
        assert!(ct.is_dirty(addr));
        // The whole card is dirty, not just the byte's address.
        assert!(ct.is_dirty(ct.lowest.uoffset(CARD_SIZE * 3)));
        ct.clear_range(ct.lowest, ct.highest);
        assert!(!ct.is_dirty(addr));
    }

    #[test]
    fn brick_scan_start() {
        let ct = table();
        let floor = ct.lowest;
        // A block spanning three bricks starting inside the first.
        let start = floor.uoffset(64);
        ct.record_block(start, BRICK_SIZE * 2 + 128);
        assert_eq!(ct.find_scan_start(start.uoffset(8), floor), start);
        // A scan landing in a tail brick jumps back to the spanning header.
        let in_tail = floor.uoffset(BRICK_SIZE * 2 + 32);
        assert_eq!(ct.find_scan_start(in_tail, floor), start);
    }
}
