//! Generational stop-the-world heap.
//!
//! One reservation is carved into chained segments: gen0 (a TLAB hand-out
//! region plus a dedicated region for objects too big for a TLAB), two
//! survivor semispaces forming gen1, gen2, and the non-moving large-object
//! heap. A translated card table with a brick table covers the whole range.
//!
//! Every heap block starts with a one-word header recording its kind, size
//! and survival age; the header is what makes generations parse linearly and
//! what carries the forwarding state during a copy.

use super::card_table::CardTable;
use super::segment::{GenId, HeapSegment, SegmentPtr};
use super::{align_size_up, zero_memory, Address, MB, SIZE_ALIGNMENT};
use crate::metadata::BasicType;
use crate::object::prelude::*;
use crate::object::{JavaArray, Object, OBJECT_FLAG_GC_MARK_0, OBJECT_FLAG_GC_MARK_1};
use crate::os;
use crate::thread::{self, SpinLock, ThreadPtr, VMThreadContext};
use crate::vm::VMPtr;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

pub const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<usize>();
pub const MIN_OBJECT_SIZE: usize = std::mem::size_of::<ObjectHeader>();

/// TLAB hand-out unit.
pub const TLAB_SIZE: usize = 8 * 1024;
/// Objects above tlab_size / ratio bypass the TLAB.
pub const TLAB_MAX_ALLOC_RATIO: usize = 4;
/// Objects at or above this size go to the large-object heap.
pub const LARGE_OBJECT_SIZE: usize = 85 * 1000;
/// Survivals of a young collection before promotion to gen2.
pub const GC_PROMOTE_AGE: usize = 5;

const AGE_SHIFT: usize = 2;
const AGE_MASK: usize = 0xFF << AGE_SHIFT;
const SIZE_SHIFT: usize = 10;
const KIND_MASK: usize = 0x3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockKind {
    Free = 0,
    Normal = 1,
    Forwarded = 2,
}

/// The word preceding every heap object.
#[repr(C)]
pub struct BlockHeader {
    word: usize,
}

impl BlockHeader {
    #[inline(always)]
    pub fn at(addr: Address) -> Ptr<BlockHeader> {
        Ptr::from_addr(addr)
    }

    #[inline(always)]
    pub fn of_object(obj: Address) -> Ptr<BlockHeader> {
        Ptr::from_addr(obj.offset(-(BLOCK_HEADER_SIZE as isize)))
    }

    pub fn init(&mut self, kind: BlockKind, block_size: usize) {
        debug_assert!(block_size % SIZE_ALIGNMENT == 0);
        self.word = kind as usize | ((block_size / SIZE_ALIGNMENT) << SIZE_SHIFT);
    }

    pub fn kind(&self) -> BlockKind {
        match self.word & KIND_MASK {
            1 => BlockKind::Normal,
            2 => BlockKind::Forwarded,
            _ => BlockKind::Free,
        }
    }

    pub fn set_kind(&mut self, kind: BlockKind) {
        self.word = (self.word & !KIND_MASK) | kind as usize;
    }

    /// Total block size including this header.
    pub fn block_size(&self) -> usize {
        (self.word >> SIZE_SHIFT) * SIZE_ALIGNMENT
    }

    pub fn set_block_size(&mut self, block_size: usize) {
        debug_assert!(block_size % SIZE_ALIGNMENT == 0);
        self.word = (self.word & (KIND_MASK | AGE_MASK)) | ((block_size / SIZE_ALIGNMENT) << SIZE_SHIFT);
    }

    pub fn age(&self) -> usize {
        (self.word & AGE_MASK) >> AGE_SHIFT
    }

    pub fn set_age(&mut self, age: usize) {
        self.word = (self.word & !AGE_MASK) | ((age & 0xFF) << AGE_SHIFT);
    }

    pub fn object(&self) -> ObjectPtr {
        ObjectPtr::from_usize(self as *const BlockHeader as usize + BLOCK_HEADER_SIZE)
    }

    pub fn is_end_marker(&self) -> bool {
        self.word == 0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GcType {
    Nop = 0,
    Minor = 1,
    Major = 2,
}

struct GcControl {
    required: GcType,
    completed: u64,
    last: GcType,
    running: bool,
}

pub struct GcStats {
    pub minor_count: u64,
    pub minor_last_ms: u128,
    pub major_count: u64,
    pub major_last_ms: u128,
}

pub struct HeapConfig {
    pub max_heap: usize,
    pub young_size: usize,
    pub loh_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            max_heap: 512 * MB,
            young_size: 32 * MB,
            loh_size: 128 * MB,
        }
    }
}

pub struct Heap {
    reservation: Address,
    reservation_size: usize,
    lowest: Address,
    highest: Address,

    card_table: CardTable,

    segments: SegmentPtr,
    eden_tlab: SegmentPtr,
    eden_direct: SegmentPtr,
    survivors: [SegmentPtr; 2],
    /// Index of the from-space; survivors[1 - active] is the copy target.
    survivor_from: usize,
    gen2: SegmentPtr,
    loh: SegmentPtr,

    young_lock: SpinLock,
    loh_lock: Mutex<Vec<(Address, usize)>>,

    tlab_size: usize,
    tlab_max_alloc: usize,

    filler_class: JClassPtr,

    vm: VMPtr,
    gc_control: Mutex<GcControl>,
    gc_cond: Condvar,
    gc_thread: ThreadPtr,
    gc_count: u64,
    mark_flag: usize,
    stats: GcStats,
}

impl Heap {
    pub fn create(config: &HeapConfig) -> Option<Heap> {
        let max_heap = align_size_up(config.max_heap, os::page_size());
        let young = align_size_up(config.young_size, os::page_size());
        let loh_size = align_size_up(config.loh_size, os::page_size());

        let eden_tlab_size = align_size_up(young / 4 * 3, os::page_size());
        let eden_direct_size = young - eden_tlab_size;
        let survivor_size = align_size_up(young / 4, os::page_size());
        let fixed = young + survivor_size * 2 + loh_size;
        if max_heap <= fixed + 8 * MB {
            log::warn!("heap too small: max {} fixed {}", max_heap, fixed);
            return None;
        }
        let gen2_size = max_heap - fixed;

        let reservation = os::reserve_memory(max_heap);
        if reservation.is_null() {
            return None;
        }

        let mut cursor = reservation;
        let mut carve = |size: usize, gen: GenId| -> Option<SegmentPtr> {
            let seg = HeapSegment::init(cursor, size, gen)?;
            cursor = cursor.uoffset(size);
            Some(seg)
        };

        let eden_tlab = carve(eden_tlab_size, GenId::Gen0)?;
        let eden_direct = carve(eden_direct_size, GenId::Gen0)?;
        let surv0 = carve(survivor_size, GenId::Gen1)?;
        let surv1 = carve(survivor_size, GenId::Gen1)?;
        let gen2 = carve(gen2_size, GenId::Gen2)?;
        let loh = carve(loh_size, GenId::Loh)?;

        // Chain the segments lowest to highest.
        eden_tlab.as_mut_ref().set_next(eden_direct);
        eden_direct.as_mut_ref().set_next(surv0);
        surv0.as_mut_ref().set_next(surv1);
        surv1.as_mut_ref().set_next(gen2);
        gen2.as_mut_ref().set_next(loh);

        let lowest = reservation;
        let highest = reservation.uoffset(max_heap);
        let card_table = CardTable::new(lowest, highest)?;

        let tlab_size = TLAB_SIZE;
        return Some(Heap {
            reservation,
            reservation_size: max_heap,
            lowest,
            highest,
            card_table,
            segments: eden_tlab,
            eden_tlab,
            eden_direct,
            survivors: [surv0, surv1],
            survivor_from: 0,
            gen2,
            loh,
            young_lock: SpinLock::new(),
            loh_lock: Mutex::new(Vec::new()),
            tlab_size,
            tlab_max_alloc: tlab_size / TLAB_MAX_ALLOC_RATIO,
            filler_class: JClassPtr::null(),
            vm: VMPtr::null(),
            gc_control: Mutex::new(GcControl {
                required: GcType::Nop,
                completed: 0,
                last: GcType::Nop,
                running: false,
            }),
            gc_cond: Condvar::new(),
            gc_thread: ThreadPtr::null(),
            gc_count: 0,
            mark_flag: OBJECT_FLAG_GC_MARK_0,
            stats: GcStats {
                minor_count: 0,
                minor_last_ms: 0,
                major_count: 0,
                major_last_ms: 0,
            },
        });
    }

    pub fn destroy(&self) {
        self.card_table.destroy();
        os::release_memory(self.reservation, self.reservation_size);
    }

    pub fn set_vm(&mut self, vm: VMPtr) {
        self.vm = vm;
    }

    pub fn set_filler_class(&mut self, clazz: JClassPtr) {
        self.filler_class = clazz;
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn current_mark_flag(&self) -> usize {
        self.mark_flag
    }

    pub fn in_heap(&self, addr: Address) -> bool {
        addr >= self.lowest && addr < self.highest
    }

    /// Gen0 + gen1: the generations whose objects move in a minor GC.
    pub fn is_ephemeral(&self, addr: Address) -> bool {
        addr >= self.eden_tlab.start() && addr < self.survivors[1].end()
    }

    pub fn is_old(&self, addr: Address) -> bool {
        self.in_heap(addr) && !self.is_ephemeral(addr)
    }

    pub fn tlab_size(&self) -> usize {
        self.tlab_size
    }

    pub fn card_is_dirty(&self, addr: Address) -> bool {
        self.card_table.is_dirty(addr)
    }

    /// Slack kept at the TLAB end so retirement can always place a filler.
    pub fn tlab_reserve_size(&self) -> usize {
        align_size_up(BLOCK_HEADER_SIZE + JavaArray::size_of(BasicType::Int, 0), SIZE_ALIGNMENT)
    }

    /// Young-generation bytes currently handed out (TLABs count in full).
    pub fn young_used(&self) -> usize {
        self.eden_tlab.used().diff(self.eden_tlab.start())
            + self.eden_direct.used().diff(self.eden_direct.start())
            + self.survivors[self.survivor_from].used().diff(self.survivors[self.survivor_from].start())
    }

    //*****************************************************************************************************
    // Allocation
    //*****************************************************************************************************

    /// Allocate a zeroed object of `size` bytes (object header included,
    /// block header excluded). Null when the heap is exhausted; the caller
    /// surfaces OutOfMemoryError.
    pub fn alloc(&mut self, thread: ThreadPtr, size: usize) -> Address {
        let size = align_size_up(size.max(MIN_OBJECT_SIZE), SIZE_ALIGNMENT);
        let total = size + BLOCK_HEADER_SIZE;

        // Allocation is a safepoint: give a pending GC its chance first.
        thread::checkpoint(thread);

        if total <= self.tlab_max_alloc {
            loop {
                let tlab = &mut thread.as_mut_ref().tlab;
                if let Some(block) = tlab.alloc(total) {
                    return self.init_block(block, total, BlockKind::Normal);
                }
                if !self.refill_tlab(thread) {
                    return Address::null();
                }
            }
        } else if size >= LARGE_OBJECT_SIZE {
            return self.alloc_loh(thread, size);
        } else {
            return self.alloc_young_direct(thread, total);
        }
    }

    fn init_block(&self, block: Address, total: usize, kind: BlockKind) -> Address {
        zero_memory(block, total);
        BlockHeader::at(block).as_mut_ref().init(kind, total);
        return block.uoffset(BLOCK_HEADER_SIZE);
    }

    /// Hand the thread a fresh TLAB, retiring the exhausted one. Triggers a
    /// minor collection when gen0 is full.
    fn refill_tlab(&mut self, thread: ThreadPtr) -> bool {
        let reserve = self.tlab_reserve_size();
        thread.as_mut_ref().tlab.retire(self);

        self.young_lock.enter(thread);
        loop {
            if let Some(start) = self.eden_tlab.as_mut_ref().claim(self.tlab_size) {
                thread.as_mut_ref().tlab.fill(start, self.tlab_size, reserve);
                self.young_lock.exit();
                return true;
            }

            // Eden exhausted.
            self.young_lock.exit();
            self.trigger_gc(thread, GcType::Minor);
            self.young_lock.enter(thread);

            if self.eden_tlab.free_size() < self.tlab_size {
                // A full collection could not make room either.
                self.young_lock.exit();
                return false;
            }
        }
    }

    /// Gen0 allocation outside any TLAB, from a cursor distinct from the
    /// TLAB hand-out cursor.
    fn alloc_young_direct(&mut self, thread: ThreadPtr, total: usize) -> Address {
        self.young_lock.enter(thread);
        loop {
            if let Some(block) = self.eden_direct.as_mut_ref().claim(total) {
                self.young_lock.exit();
                return self.init_block(block, total, BlockKind::Normal);
            }

            self.young_lock.exit();
            self.trigger_gc(thread, GcType::Minor);
            self.young_lock.enter(thread);

            if self.eden_direct.free_size() < total {
                self.young_lock.exit();
                return Address::null();
            }
        }
    }

    /// Large-object allocation: first fit from the sweep free list, then the
    /// bump cursor, with a major collection between attempts.
    pub fn alloc_loh(&mut self, thread: ThreadPtr, size: usize) -> Address {
        let size = align_size_up(size.max(MIN_OBJECT_SIZE), SIZE_ALIGNMENT);
        let total = size + BLOCK_HEADER_SIZE;

        thread::checkpoint(thread);

        let mut attempted_gc = false;
        loop {
            if let Some(block) = self.claim_loh(total) {
                let obj = self.init_block(block, total, BlockKind::Normal);
                self.card_table.record_block(block, total);
                return obj;
            }
            if attempted_gc {
                return Address::null();
            }
            attempted_gc = true;
            self.trigger_gc(thread, GcType::Major);
        }
    }

    fn claim_loh(&mut self, total: usize) -> Option<Address> {
        let mut free = self.loh_lock.lock();
        if let Some(pos) = free.iter().position(|&(_, sz)| sz >= total) {
            let (addr, sz) = free[pos];
            let remainder = sz - total;
            if remainder >= BLOCK_HEADER_SIZE + MIN_OBJECT_SIZE {
                free[pos] = (addr.uoffset(total), remainder);
                BlockHeader::at(addr.uoffset(total))
                    .as_mut_ref()
                    .init(BlockKind::Free, remainder);
            } else {
                free.remove(pos);
            }
            return Some(addr);
        }
        drop(free);
        return self.loh.as_mut_ref().claim(total);
    }

    /// Class blocks: stable LOH allocations that are never collected. The
    /// pinned flag keeps the sweep away from them.
    pub fn alloc_class_block(&mut self, thread: ThreadPtr, size: usize) -> Address {
        let obj = self.alloc_loh(thread, size);
        if obj.is_not_null() {
            Object::set_pinned(ObjectPtr::from_addr(obj));
        }
        return obj;
    }

    /// Stable, manually freed storage for runtime bookkeeping (class maps,
    /// resolved field tables, JNI reference tables).
    pub fn alloc_uncollectable(size: usize) -> Address {
        let total = size + 16;
        let layout = std::alloc::Layout::from_size_align(total, 16).expect("bad layout");
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Address::null();
        }
        unsafe {
            *(base as *mut usize) = total;
        }
        return Address::new(base).uoffset(16);
    }

    pub fn free_uncollectable(addr: Address) {
        if addr.is_null() {
            return;
        }
        let base = addr.offset(-16);
        let total = unsafe { *(base.raw_ptr() as *const usize) };
        let layout = std::alloc::Layout::from_size_align(total, 16).expect("bad layout");
        unsafe {
            std::alloc::dealloc(base.as_mut_raw_ptr(), layout);
        }
    }

    /// Fill `[start, start + size)` with a dummy int[] so linear parsing
    /// walks over it.
    pub fn fill_with_filler(&self, start: Address, size: usize) {
        if size == 0 {
            return;
        }
        debug_assert!(self.filler_class.is_not_null());
        debug_assert!(size >= self.tlab_reserve_size());
        debug_assert!(size % SIZE_ALIGNMENT == 0);

        BlockHeader::at(start).as_mut_ref().init(BlockKind::Normal, size);
        let arr: JArrayPtr = Ptr::from_addr(start.uoffset(BLOCK_HEADER_SIZE));
        let header = JavaArray::header_size(BasicType::Int);
        let element_bytes = size - BLOCK_HEADER_SIZE - header;
        Object::set_class_word(arr.cast(), 0);
        Object::set_class(arr.cast(), self.filler_class);
        Object::set_monitor(arr.cast(), crate::monitor::MonitorPtr::null());
        JavaArray::set_length(arr, (element_bytes / BasicType::Int.size()) as JInt);
    }

    //*****************************************************************************************************
    // Write barrier
    //*****************************************************************************************************

    /// Dirty the card of `slot` when an old-generation holder stores a
    /// reference into the ephemeral generations.
    #[inline]
    pub fn write_barrier(&self, slot: Address, holder: Address, value: ObjectPtr) {
        if value.is_null() {
            return;
        }
        if self.is_ephemeral(value.as_address()) && self.is_old(holder) {
            self.card_table.dirty(slot);
        }
    }

    //*****************************************************************************************************
    // GC coordination
    //*****************************************************************************************************

    pub fn start_gc_thread(&mut self, vm: VMPtr) {
        {
            let mut control = self.gc_control.lock();
            control.running = true;
        }
        let heap_ptr: Ptr<Heap> = Ptr::from_ref(self);
        std::thread::Builder::new()
            .name("gc".to_string())
            .stack_size(2 * MB)
            .spawn(move || {
                let ctx = VMThreadContext::create(vm);
                thread::attach(ctx);
                heap_ptr.as_mut_ref().gc_thread = ctx;
                heap_ptr.as_mut_ref().gc_thread_main(ctx);
            })
            .expect("failed to start gc thread");
    }

    pub fn shutdown_gc_thread(&mut self) {
        let mut control = self.gc_control.lock();
        control.running = false;
        self.gc_cond.notify_all();
    }

    /// Request a collection and block (inside the safe region) until it has
    /// completed. Returns the type of collection that ran.
    pub fn trigger_gc(&mut self, thread: ThreadPtr, ty: GcType) -> GcType {
        if ty == GcType::Nop {
            return GcType::Nop;
        }
        let target = {
            let mut control = self.gc_control.lock();
            debug_assert!(control.running, "gc requested before gc thread start");
            if control.required < ty {
                control.required = ty;
            }
            self.gc_cond.notify_all();
            control.completed + 1
        };

        thread::enter_saferegion(thread);
        let last = {
            let mut control = self.gc_control.lock();
            while control.completed < target && control.running {
                self.gc_cond.wait(&mut control);
            }
            control.last
        };
        thread::leave_saferegion(thread);
        return last;
    }

    fn gc_thread_main(&mut self, ctx: ThreadPtr) {
        log::debug!("gc thread running");
        loop {
            let ty = {
                let mut control = self.gc_control.lock();
                while control.required == GcType::Nop && control.running {
                    self.gc_cond.wait(&mut control);
                }
                if !control.running {
                    break;
                }
                let ty = control.required;
                control.required = GcType::Nop;
                ty
            };

            self.collect(ctx, ty);

            {
                let mut control = self.gc_control.lock();
                control.completed += 1;
                control.last = ty;
                self.gc_cond.notify_all();
            }
        }
        log::debug!("gc thread terminated");
    }

    //*****************************************************************************************************
    // Collection
    //*****************************************************************************************************

    fn collect(&mut self, gc_ctx: ThreadPtr, ty: GcType) {
        let vm = self.vm;
        thread::stop_the_world(vm, gc_ctx);
        thread::wait_until_world_stopped(vm, gc_ctx);

        let start = Instant::now();
        self.gc_count += 1;
        // Alternate the mark bit so the previous cycle's marks are stale.
        self.mark_flag = if self.gc_count & 1 == 0 {
            OBJECT_FLAG_GC_MARK_0
        } else {
            OBJECT_FLAG_GC_MARK_1
        };

        // Every TLAB is reclaimed by a young collection; retire them so the
        // generation parses linearly.
        thread::each_managed_thread(vm, |t| {
            t.as_mut_ref().tlab.retire(self);
        });

        let young_only = ty == GcType::Minor;
        self.mark_phase(vm, young_only);

        // The dirty cards have served as minor roots; rebuild them from the
        // survivors during fixup.
        self.card_table.clear_range(self.gen2.start(), self.gen2.end());
        self.card_table.clear_range(self.loh.start(), self.loh.end());

        self.copy_young();
        self.fixup_phase(vm);

        if ty == GcType::Major {
            self.sweep_loh();
        }

        // Recycle gen0 and flip the survivor spaces.
        self.eden_tlab.as_mut_ref().reset();
        self.eden_direct.as_mut_ref().reset();
        self.survivors[self.survivor_from].as_mut_ref().reset();
        self.survivor_from = 1 - self.survivor_from;

        let elapsed = start.elapsed().as_millis();
        match ty {
            GcType::Minor => {
                self.stats.minor_count += 1;
                self.stats.minor_last_ms = elapsed;
            }
            GcType::Major => {
                self.stats.major_count += 1;
                self.stats.major_last_ms = elapsed;
            }
            GcType::Nop => {}
        }
        log::info!(
            "gc #{} {:?} took {}ms, young used {}",
            self.gc_count,
            ty,
            elapsed,
            self.young_used()
        );

        thread::resume_the_world(vm, gc_ctx);
    }

    //*****************************************************************************************************
    // Mark
    //*****************************************************************************************************

    fn mark_phase(&mut self, vm: VMPtr, young_only: bool) {
        let mut work: Vec<ObjectPtr> = Vec::with_capacity(1024);

        thread::each_managed_thread(vm, |t| {
            self.push_root(&mut work, t.current_thread);
            self.push_root(&mut work, t.exception);
            crate::stack::each_frame(t, |frame| {
                crate::stack::each_frame_ref(frame, |slot| {
                    self.push_root(&mut work, *slot);
                });
            });
        });

        vm.as_ref().native_state.each_global_ref(|slot| {
            self.push_root(&mut work, *slot);
        });

        vm.as_ref().string_pool.each_object(|obj| {
            self.push_root(&mut work, obj);
        });

        if young_only {
            // Old objects holding young references have dirty cards; scan
            // them as additional roots.
            self.scan_dirty_cards(&mut work, self.gen2);
            self.scan_dirty_cards(&mut work, self.loh);
        } else {
            vm.as_ref().class_loader.each_class(|clazz| {
                self.mark_class_roots(&mut work, clazz);
            });
        }

        while let Some(obj) = work.pop() {
            self.mark_object(&mut work, obj, young_only);
        }
    }

    fn push_root(&self, work: &mut Vec<ObjectPtr>, obj: ObjectPtr) {
        if obj.is_not_null() {
            work.push(obj);
        }
    }

    fn mark_class_roots(&self, work: &mut Vec<ObjectPtr>, clazz: JClassPtr) {
        let obj = JClass::as_object(clazz);
        if Object::is_marked(obj, self.mark_flag) {
            return;
        }
        Object::set_marked(obj, self.mark_flag);
        self.push_root(work, clazz.class_loader);
        self.push_root(work, clazz.class_instance);
        for f in clazz.statics_slice() {
            if f.is_reference {
                self.push_root(work, JClass::read_static_ref(clazz, f.offset));
            }
        }
        if clazz.super_class.is_not_null() {
            self.mark_class_roots(work, clazz.super_class);
        }
        for it in clazz.interfaces_slice() {
            self.mark_class_roots(work, *it);
        }
    }

    fn mark_object(&self, work: &mut Vec<ObjectPtr>, obj: ObjectPtr, young_only: bool) {
        if obj.is_null() {
            return;
        }
        let clazz = Object::class_of(obj);
        if clazz.is_null() {
            // A class block reached through a reference slot.
            self.mark_class_roots(work, obj.cast());
            return;
        }
        if young_only && !self.is_ephemeral(obj.as_address()) {
            // Old holders of young references are scanned through the card
            // table; the rest of the old graph is out of scope for a minor
            // collection.
            return;
        }
        if Object::is_marked(obj, self.mark_flag) {
            return;
        }
        Object::set_marked(obj, self.mark_flag);

        if self.is_ephemeral(obj.as_address()) {
            let header = BlockHeader::of_object(obj.as_address());
            let age = header.age();
            header.as_mut_ref().set_age(age + 1);
        }

        let info = clazz.info;
        if info.is_array() {
            if !matches!(info.element_type(), BasicType::Object | BasicType::Array) {
                return;
            }
            let arr: JArrayPtr = obj.cast();
            let len = JavaArray::length(arr) as usize;
            for i in 0..len {
                let slot: Ptr<ObjectPtr> =
                    Ptr::from_addr(JavaArray::element_at(arr, BasicType::Object, i));
                self.push_root(work, *slot.as_ref());
            }
            return;
        }

        if !clazz.has_reference {
            return;
        }
        for f in clazz.fields_slice() {
            if f.is_reference && !f.is_static {
                self.push_root(work, Object::read_ref(obj, f.offset));
            }
        }
    }

    fn scan_dirty_cards(&self, work: &mut Vec<ObjectPtr>, seg: SegmentPtr) {
        if seg.used() == seg.start() {
            return;
        }
        let mut marked: Vec<ObjectPtr> = Vec::new();
        self.card_table
            .each_dirty_card(seg.start(), seg.used(), |card_start, card_end| {
                let mut cursor = self.card_table.find_scan_start(card_start, seg.start());
                while cursor < card_end && cursor < seg.used() {
                    let header = BlockHeader::at(cursor);
                    if header.is_end_marker() {
                        break;
                    }
                    let size = header.block_size();
                    if header.kind() == BlockKind::Normal {
                        let obj = header.object();
                        if cursor.uoffset(size) > card_start {
                            marked.push(obj);
                        }
                    }
                    cursor = cursor.uoffset(size);
                }
            });
        for obj in marked {
            // The holder itself stays put; only its young referents matter.
            self.push_old_holder_refs(work, obj);
        }
    }

    fn push_old_holder_refs(&self, work: &mut Vec<ObjectPtr>, obj: ObjectPtr) {
        let clazz = Object::class_of(obj);
        if clazz.is_null() {
            // Dirty class block: its statics may hold young references.
            let clazz: JClassPtr = obj.cast();
            for f in clazz.statics_slice() {
                if f.is_reference {
                    self.push_root(work, JClass::read_static_ref(clazz, f.offset));
                }
            }
            return;
        }
        let info = clazz.info;
        if info.is_array() {
            if matches!(info.element_type(), BasicType::Object | BasicType::Array) {
                let arr: JArrayPtr = obj.cast();
                for i in 0..JavaArray::length(arr) as usize {
                    let slot: Ptr<ObjectPtr> =
                        Ptr::from_addr(JavaArray::element_at(arr, BasicType::Object, i));
                    self.push_root(work, *slot.as_ref());
                }
            }
            return;
        }
        for f in clazz.fields_slice() {
            if f.is_reference && !f.is_static {
                self.push_root(work, Object::read_ref(obj, f.offset));
            }
        }
    }

    //*****************************************************************************************************
    // Copy + fixup
    //*****************************************************************************************************

    /// Evacuate every marked ephemeral object: survivors that reached the
    /// promotion age go to gen2, the rest to the empty survivor space. The
    /// old block is stamped with a forwarding pointer.
    fn copy_young(&mut self) {
        let survivor_to = self.survivors[1 - self.survivor_from];
        for seg in [self.eden_tlab, self.eden_direct, self.survivors[self.survivor_from]] {
            let mut cursor = seg.start();
            while cursor < seg.used() {
                let header = BlockHeader::at(cursor);
                if header.is_end_marker() {
                    break;
                }
                let size = header.block_size();
                if header.kind() == BlockKind::Normal {
                    let obj = header.object();
                    if Object::is_marked(obj, self.mark_flag) {
                        self.evacuate(header, size, survivor_to);
                    }
                }
                cursor = cursor.uoffset(size);
            }
        }
    }

    fn evacuate(&mut self, src: Ptr<BlockHeader>, size: usize, survivor_to: SegmentPtr) {
        // The mark phase already bumped the age of every live young object.
        let age = src.age();
        let promote = age >= GC_PROMOTE_AGE;

        // Survivor overflow spills into gen2 early rather than failing the
        // collection.
        let (dest, to_old) = if promote {
            (self.gen2.as_mut_ref().claim(size), true)
        } else {
            match survivor_to.as_mut_ref().claim(size) {
                Some(d) => (Some(d), false),
                None => (self.gen2.as_mut_ref().claim(size), true),
            }
        };
        // A failed claim here would leave a half-forwarded heap; this is the
        // GC-phase invariant violation the error policy treats as fatal.
        let dest = dest.unwrap_or_else(|| {
            eprintln!("aotvm: heap exhausted during evacuation");
            std::process::abort();
        });

        unsafe {
            std::ptr::copy_nonoverlapping(src.as_address().raw_ptr(), dest.as_mut_raw_ptr(), size);
        }
        if to_old {
            self.card_table.record_block(dest, size);
        }

        let new_obj = dest.uoffset(BLOCK_HEADER_SIZE);
        src.as_mut_ref().set_kind(BlockKind::Forwarded);
        Object::set_class_word(src.object(), new_obj.as_usize());
    }

    #[inline]
    fn forwarded(&self, obj: ObjectPtr) -> ObjectPtr {
        if obj.is_null() || !self.is_ephemeral(obj.as_address()) {
            return obj;
        }
        let header = BlockHeader::of_object(obj.as_address());
        if header.kind() == BlockKind::Forwarded {
            return ObjectPtr::from_usize(Object::class_word(obj));
        }
        return obj;
    }

    fn fix_slot(&self, slot: &mut ObjectPtr) {
        *slot = self.forwarded(*slot);
    }

    fn fixup_phase(&mut self, vm: VMPtr) {
        // Roots first.
        thread::each_managed_thread(vm, |t| {
            let ctx = t.as_mut_ref();
            ctx.current_thread = self.forwarded(ctx.current_thread);
            ctx.exception = self.forwarded(ctx.exception);
            crate::stack::each_frame(t, |frame| {
                crate::stack::each_frame_ref(frame, |slot| {
                    self.fix_slot(slot);
                });
            });
        });
        vm.as_ref().native_state.each_global_ref(|slot| {
            self.fix_slot(slot);
        });
        vm.as_mut_ref().string_pool.fix_objects(|obj| self.forwarded(obj));

        // Then every live block's reference fields. Survivor copies carry
        // stale pointers to other moved objects; old-generation holders may
        // point at survivors.
        let survivor_to = self.survivors[1 - self.survivor_from];
        for seg in [survivor_to, self.gen2, self.loh] {
            let dirty_cards = seg.gen() != GenId::Gen1;
            let mut cursor = seg.start();
            while cursor < seg.used() {
                let header = BlockHeader::at(cursor);
                if header.is_end_marker() {
                    break;
                }
                let size = header.block_size();
                if header.kind() == BlockKind::Normal {
                    self.fix_object_refs(header.object(), dirty_cards);
                }
                cursor = cursor.uoffset(size);
            }
        }
    }

    fn fix_object_refs(&self, obj: ObjectPtr, dirty_cards: bool) {
        let clazz = Object::class_of(obj);
        if clazz.is_null() {
            let clazz: JClassPtr = obj.cast();
            for f in clazz.statics_slice() {
                if f.is_reference {
                    let slot: Ptr<ObjectPtr> = clazz.cast::<u8>().offset(f.offset as isize).cast();
                    let fixed = self.forwarded(*slot.as_ref());
                    *slot.as_mut_ref() = fixed;
                    if dirty_cards && fixed.is_not_null() && self.is_ephemeral(fixed.as_address()) {
                        self.card_table.dirty(slot.as_address());
                    }
                }
            }
            return;
        }
        let info = clazz.info;
        if info.is_array() {
            if matches!(info.element_type(), BasicType::Object | BasicType::Array) {
                let arr: JArrayPtr = obj.cast();
                for i in 0..JavaArray::length(arr) as usize {
                    let slot: Ptr<ObjectPtr> =
                        Ptr::from_addr(JavaArray::element_at(arr, BasicType::Object, i));
                    let fixed = self.forwarded(*slot.as_ref());
                    *slot.as_mut_ref() = fixed;
                    if dirty_cards && fixed.is_not_null() && self.is_ephemeral(fixed.as_address()) {
                        self.card_table.dirty(slot.as_address());
                    }
                }
            }
            return;
        }
        if !clazz.has_reference {
            return;
        }
        for f in clazz.fields_slice() {
            if f.is_reference && !f.is_static {
                let addr = Object::field_addr(obj, f.offset);
                let slot: Ptr<ObjectPtr> = Ptr::from_addr(addr);
                let fixed = self.forwarded(*slot.as_ref());
                *slot.as_mut_ref() = fixed;
                if dirty_cards && fixed.is_not_null() && self.is_ephemeral(fixed.as_address()) {
                    self.card_table.dirty(addr);
                }
            }
        }
    }

    //*****************************************************************************************************
    // LOH sweep
    //*****************************************************************************************************

    /// Thread unmarked large objects onto the free list, coalescing
    /// neighbours. Class blocks are pinned and never freed.
    fn sweep_loh(&mut self) {
        let mut free = self.loh_lock.lock();
        free.clear();

        let seg = self.loh;
        let mut cursor = seg.start();
        let mut pending: Option<(Address, usize)> = None;
        while cursor < seg.used() {
            let header = BlockHeader::at(cursor);
            if header.is_end_marker() {
                break;
            }
            let size = header.block_size();
            let dead = match header.kind() {
                BlockKind::Free => true,
                BlockKind::Normal => {
                    let obj = header.object();
                    !Object::is_pinned(obj) && !Object::is_marked(obj, self.mark_flag)
                }
                BlockKind::Forwarded => false,
            };
            if dead {
                match pending {
                    Some((start, acc)) => pending = Some((start, acc + size)),
                    None => pending = Some((cursor, size)),
                }
            } else if let Some((start, acc)) = pending.take() {
                BlockHeader::at(start).as_mut_ref().init(BlockKind::Free, acc);
                free.push((start, acc));
            }
            cursor = cursor.uoffset(size);
        }
        if let Some((start, acc)) = pending {
            BlockHeader::at(start).as_mut_ref().init(BlockKind::Free, acc);
            free.push((start, acc));
        }
        log::debug!("loh sweep: {} free ranges", free.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classloader;
    use crate::string_pool;
    use crate::test_support::run_default;

    #[test]
    fn block_header_round_trip() {
        let mut h = BlockHeader { word: 0 };
        assert!(h.is_end_marker());
        h.init(BlockKind::Normal, 64);
        assert_eq!(h.kind(), BlockKind::Normal);
        assert_eq!(h.block_size(), 64);
        assert_eq!(h.age(), 0);
        h.set_age(3);
        assert_eq!(h.age(), 3);
        assert_eq!(h.block_size(), 64);
        h.set_kind(BlockKind::Forwarded);
        assert_eq!(h.kind(), BlockKind::Forwarded);
        assert_eq!(h.age(), 3);
    }

    #[test]
    fn tlab_retire_leaves_one_filler_array() {
        run_default(|vm, thread| {
            let heap = &mut vm.as_mut_ref().heap;
            // Prime the TLAB with one small allocation.
            let obj = heap.alloc(thread, 16);
            assert!(obj.is_not_null());

            let tlab_current = thread.tlab.current();
            let tlab_limit = thread.tlab.limit();
            let span = tlab_limit.uoffset(heap.tlab_reserve_size()).diff(tlab_current);

            thread.as_mut_ref().tlab.retire(heap);

            // The retired tail parses as exactly one int[] whose block size
            // equals the span.
            let header = BlockHeader::at(tlab_current);
            assert_eq!(header.kind(), BlockKind::Normal);
            assert_eq!(header.block_size(), span);
            let filler = header.object();
            let clazz = Object::class_of(filler);
            assert!(clazz.is_not_null());
            assert_eq!(clazz.name(), "[I");
            let expected_len =
                (span - BLOCK_HEADER_SIZE - JavaArray::header_size(BasicType::Int)) / 4;
            assert_eq!(JavaArray::length(filler.cast()) as usize, expected_len);
        });
    }

    #[test]
    fn minor_gc_reclaims_garbage() {
        run_default(|vm, thread| {
            let object_class = vm.as_ref().class_loader.object_class();
            for _ in 0..100_000 {
                let obj = classloader::alloc_instance(thread, object_class);
                assert!(obj.is_not_null());
            }
            let heap = &mut vm.as_mut_ref().heap;
            let before = heap.young_used();
            assert!(before > 100_000 * MIN_OBJECT_SIZE / 2);

            heap.trigger_gc(thread, GcType::Minor);

            // Nothing was rooted, so the young generation drops back to (at
            // most) a couple of TLABs worth of slack.
            assert!(heap.young_used() <= 2 * heap.tlab_size());
            assert_eq!(heap.stats().minor_count, 1);
        });
    }

    #[test]
    fn minor_gc_moves_rooted_objects_and_fixes_references() {
        run_default(|vm, thread| {
            let frame = crate::stack::Frame::push_java(thread, None, 4, 0);
            let payload = string_pool::create_string(thread, "payload");
            assert!(payload.is_not_null());
            frame.as_mut_ref().java_mut().operand_stack.push_object(payload);

            let before = frame.java().operand_stack.peek(1).expect_object();
            vm.as_mut_ref().heap.trigger_gc(thread, GcType::Minor);
            let after = frame.java().operand_stack.peek(1).expect_object();

            // The object moved out of eden and the root was rewritten.
            assert!(after.is_not_null());
            assert!(after != before);
            assert_eq!(Object::class_of(after).name(), "java/lang/String");
            assert_eq!(string_pool::java_string_to_rust(after), "payload");

            // Marks from the collection leave the class pointer intact.
            let clazz = Object::class_of(after);
            assert!(clazz == vm.as_ref().class_loader.string_class());

            crate::stack::Frame::pop(thread);
        });
    }

    #[test]
    fn survivors_age_and_get_promoted() {
        run_default(|vm, thread| {
            let frame = crate::stack::Frame::push_java(thread, None, 4, 0);
            let payload = string_pool::create_string(thread, "old-timer");
            frame.as_mut_ref().java_mut().operand_stack.push_object(payload);

            for _ in 0..GC_PROMOTE_AGE + 1 {
                vm.as_mut_ref().heap.trigger_gc(thread, GcType::Minor);
            }
            let survivor = frame.java().operand_stack.peek(1).expect_object();
            let heap = &vm.as_ref().heap;
            assert!(heap.is_old(survivor.as_address()));
            assert_eq!(string_pool::java_string_to_rust(survivor), "old-timer");

            crate::stack::Frame::pop(thread);
        });
    }

    #[test]
    fn write_barrier_dirties_cards_for_old_to_young_stores() {
        run_default(|vm, thread| {
            // Class blocks live in the old generation; storing a young
            // reference into a static must dirty the class block's card.
            let frame = crate::stack::Frame::push_java(thread, None, 4, 0);
            let young = string_pool::create_string(thread, "young");
            frame.as_mut_ref().java_mut().operand_stack.push_object(young);

            let system = classloader::get_class_by_name_init(thread, "java/lang/System");
            assert!(system.is_not_null());
            let offset = crate::rt::JAVA_LANG_SYSTEM.static_fields[0].offset;
            let slot = system.as_address().uoffset(offset);

            let heap = &vm.as_ref().heap;
            assert!(heap.is_old(system.as_address()));
            assert!(heap.is_ephemeral(young.as_address()));
            heap.write_barrier(slot, system.as_address(), young);
            assert!(heap.card_is_dirty(slot));

            crate::stack::Frame::pop(thread);
        });
    }
}
