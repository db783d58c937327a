//! Native bridge: local-reference tables, the safe-region boundary around
//! native calls, and symbol binding.
//!
//! While a thread executes native code it stays in the safe region, so the
//! GC may move objects under it; the native side only holds handles
//! (pointers into the frame's reference tables) and converts them to raw
//! objects strictly outside the safe region.

pub mod jni;

use crate::exception;
use crate::memory::heap::Heap;
use crate::memory::Address;
use crate::metadata::MethodInfo;
use crate::object::prelude::*;
use crate::stack::{Frame, FrameData, FramePtr};
use crate::thread::{self, SpinLock, ThreadPtr, VMThreadContext};
use ::jni::sys::jobject;
use std::collections::HashMap;

/// Local references a native frame can hold before a chained table is
/// allocated.
pub const INLINE_REF_CAPACITY: usize = 16;

/// Marks a slot freed by DeleteLocalRef so it can be reused.
static DELETED_MARK: u8 = 0;

fn deleted_handle() -> ObjectPtr {
    ObjectPtr::new(&DELETED_MARK as *const u8 as *const _)
}

/// Fill value of unused slots; odd, so no aligned heap object can live
/// there.
const BAD_HANDLE: usize = 0xABAB_ABAB;

fn bad_handle() -> ObjectPtr {
    ObjectPtr::from_usize(BAD_HANDLE)
}

#[repr(C)]
pub struct RefTable {
    next: Ptr<RefTable>,
    capacity: i32,
    top: i32,
    objects: Ptr<ObjectPtr>,
}

impl RefTable {
    fn clear(&mut self) {
        self.top = 0;
        for i in 0..self.capacity {
            *self.objects.offset(i as isize).as_mut_ref() = bad_handle();
        }
    }

    fn init(&mut self, storage: Ptr<ObjectPtr>, capacity: i32) {
        self.next = Ptr::null();
        self.capacity = capacity;
        self.top = 0;
        self.objects = storage;
        self.clear();
    }
}

pub struct NativeFrameData {
    /// Head of the table chain; the inline table is always the tail.
    ref_table: Ptr<RefTable>,
    inline_table: RefTable,
    inline_refs: [ObjectPtr; INLINE_REF_CAPACITY],
}

impl NativeFrameData {
    pub fn new() -> NativeFrameData {
        NativeFrameData {
            ref_table: Ptr::null(),
            inline_table: RefTable {
                next: Ptr::null(),
                capacity: 0,
                top: 0,
                objects: Ptr::null(),
            },
            inline_refs: [ObjectPtr::null(); INLINE_REF_CAPACITY],
        }
    }

    /// Called once the frame has its final address (it lives in a Box).
    pub fn wire_inline_table(&mut self) {
        let storage = Ptr::new(self.inline_refs.as_ptr());
        self.inline_table.init(storage, INLINE_REF_CAPACITY as i32);
        self.ref_table = Ptr::from_ref(&self.inline_table);
    }

    pub fn each_table_ref<F: FnMut(&mut ObjectPtr)>(&mut self, f: &mut F) {
        // Deleted-slot reuse can fill entries above `top`, so walk the full
        // capacity and let the fill values screen out unused slots.
        let mut table = self.ref_table;
        while table.is_not_null() {
            for i in 0..table.capacity {
                let slot = table.objects.offset(i as isize).as_mut_ref();
                if slot.is_not_null() && *slot != deleted_handle() && *slot != bad_handle() {
                    f(slot);
                }
            }
            table = table.next;
        }
    }
}

impl Drop for NativeFrameData {
    fn drop(&mut self) {
        // Chained tables are uncollectable allocations; the inline table is
        // part of the frame itself.
        let mut table = self.ref_table;
        while table.is_not_null() {
            let next = table.next;
            if table.as_usize() != (&self.inline_table as *const RefTable as usize) {
                Heap::free_uncollectable(table.as_address());
            }
            table = next;
        }
    }
}

fn top_native_frame(thread: ThreadPtr) -> FramePtr {
    let top = thread.top_frame;
    debug_assert!(top.is_not_null());
    debug_assert!(matches!(top.as_ref().data, FrameData::Native(_)));
    return top;
}

//*********************************************************************************************************
// Safe-region boundary
//*********************************************************************************************************

pub fn enter_jni(thread: ThreadPtr) {
    debug_assert!(!thread::in_saferegion(thread));
    thread::enter_saferegion(thread);
}

pub fn exit_jni(thread: ThreadPtr) {
    debug_assert!(thread::in_saferegion(thread));
    thread::leave_saferegion(thread);
    debug_assert!(!thread::in_saferegion(thread));
}

//*********************************************************************************************************
// Handles
//*********************************************************************************************************

/// Allocate a local reference in the current native frame. Must run outside
/// the safe region: the raw pointer has to be stable while it is stored.
pub fn get_local_ref(thread: ThreadPtr, obj: ObjectPtr) -> jobject {
    debug_assert!(!thread::in_saferegion(thread));
    if obj.is_null() {
        return std::ptr::null_mut();
    }

    let frame = top_native_frame(thread);
    let data = frame.as_mut_ref().native_mut();

    let mut max_capacity: i32 = 8;
    let mut table = data.ref_table;
    if table.is_not_null() {
        if table.top < table.capacity {
            let slot = table.objects.offset(table.top as isize);
            table.as_mut_ref().top += 1;
            *slot.as_mut_ref() = obj;
            return slot.as_usize() as jobject;
        }
        // Reuse a deleted slot anywhere in the chain.
        while table.is_not_null() {
            max_capacity = max_capacity.max(table.capacity);
            for i in 0..table.capacity {
                let slot = table.objects.offset(i as isize);
                if *slot.as_ref() == deleted_handle() {
                    *slot.as_mut_ref() = obj;
                    return slot.as_usize() as jobject;
                }
            }
            table = table.next;
        }
    }

    // Every table is saturated: chain a new one with doubled capacity.
    let new_capacity = max_capacity.min(1024) * 2;
    let storage = Heap::alloc_uncollectable(
        std::mem::size_of::<RefTable>() + new_capacity as usize * std::mem::size_of::<ObjectPtr>(),
    );
    debug_assert!(storage.is_not_null());
    let new_table: Ptr<RefTable> = Ptr::from_addr(storage);
    let objects: Ptr<ObjectPtr> =
        Ptr::from_addr(storage.uoffset(std::mem::size_of::<RefTable>()));
    new_table.as_mut_ref().init(objects, new_capacity);

    new_table.as_mut_ref().next = data.ref_table;
    data.ref_table = new_table;

    return get_local_ref(thread, obj);
}

/// Convert a handle back to the raw object. Must run outside the safe
/// region, where the pointer is stable.
pub fn dereference(thread: ThreadPtr, handle: jobject) -> ObjectPtr {
    debug_assert!(!thread::in_saferegion(thread));
    if handle.is_null() {
        return ObjectPtr::null();
    }
    let slot: Ptr<ObjectPtr> = Ptr::from_usize(handle as usize);
    let obj = *slot.as_ref();
    debug_assert!(obj != deleted_handle());
    debug_assert!(obj != bad_handle());
    return obj;
}

pub fn delete_local_ref(_thread: ThreadPtr, handle: jobject) {
    if handle.is_null() {
        return;
    }
    let slot: Ptr<ObjectPtr> = Ptr::from_usize(handle as usize);
    *slot.as_mut_ref() = deleted_handle();
}

//*********************************************************************************************************
// Symbol binding
//*********************************************************************************************************

/// An erased native entry point. The generated trampoline knows the true
/// signature and casts at the call site.
#[derive(Clone, Copy)]
pub struct NativeSymbol(pub *const ());

unsafe impl Send for NativeSymbol {}
unsafe impl Sync for NativeSymbol {}

/// The env pointer handed to native code is the thread context itself.
pub type RawJniEnv = *mut VMThreadContext;

pub fn env_of(thread: ThreadPtr) -> RawJniEnv {
    thread.as_mut_raw_ptr()
}

pub fn thread_of(env: RawJniEnv) -> ThreadPtr {
    ThreadPtr::new(env)
}

pub struct NativeState {
    lock: SpinLock,
    builtins: HashMap<&'static str, NativeSymbol>,
    cache: HashMap<usize, NativeSymbol>,
    library: Option<libloading::Library>,

    global_lock: SpinLock,
    global_refs: Vec<Ptr<ObjectPtr>>,
}

impl NativeState {
    pub fn new() -> NativeState {
        NativeState {
            lock: SpinLock::new(),
            builtins: HashMap::new(),
            cache: HashMap::new(),
            library: None,
            global_lock: SpinLock::new(),
            global_refs: Vec::new(),
        }
    }

    /// Open the running image so translator-mangled symbols resolve.
    pub fn init(&mut self) {
        #[cfg(unix)]
        {
            self.library = Some(libloading::os::unix::Library::this().into());
        }
        #[cfg(windows)]
        {
            if let Ok(lib) = libloading::os::windows::Library::this() {
                self.library = Some(lib.into());
            }
        }
    }

    pub fn register_builtin(&mut self, name: &'static str, symbol: NativeSymbol) {
        self.builtins.insert(name, symbol);
    }

    fn find_symbol(&self, name: &str) -> Option<NativeSymbol> {
        if let Some(sym) = self.builtins.get(name) {
            return Some(*sym);
        }
        let lib = self.library.as_ref()?;
        let symbol: libloading::Symbol<'_, *const std::ffi::c_void> =
            unsafe { lib.get(name.as_bytes()).ok()? };
        return Some(NativeSymbol(*symbol as *const ()));
    }

    pub fn each_global_ref<F: FnMut(&mut ObjectPtr)>(&self, mut f: F) {
        for slot in &self.global_refs {
            let r = slot.as_mut_ref();
            if r.is_not_null() {
                f(r);
            }
        }
    }

    pub fn new_global_ref(&mut self, thread: ThreadPtr, obj: ObjectPtr) -> jobject {
        self.global_lock.enter(thread);
        let storage = Heap::alloc_uncollectable(std::mem::size_of::<ObjectPtr>());
        let slot: Ptr<ObjectPtr> = Ptr::from_addr(storage);
        *slot.as_mut_ref() = obj;
        self.global_refs.push(slot);
        self.global_lock.exit();
        return slot.as_usize() as jobject;
    }

    pub fn delete_global_ref(&mut self, thread: ThreadPtr, handle: jobject) {
        if handle.is_null() {
            return;
        }
        self.global_lock.enter(thread);
        let slot: Ptr<ObjectPtr> = Ptr::from_usize(handle as usize);
        if let Some(pos) = self.global_refs.iter().position(|s| *s == slot) {
            self.global_refs.remove(pos);
            Heap::free_uncollectable(Address::from_usize(handle as usize));
        }
        self.global_lock.exit();
    }
}

/// Resolve a native method: builtin registry first, then the image symbols,
/// short name before long name. Misses raise UnsatisfiedLinkError.
pub fn bind_method(thread: ThreadPtr, method: &'static MethodInfo) -> Option<NativeSymbol> {
    debug_assert!(method.is_native());
    let names = match method.native {
        Some(names) => names,
        None => {
            exception::set_unsatisfied_link(thread, method.name);
            return None;
        }
    };

    let vm = thread.vm();
    let state = &mut vm.as_mut_ref().native_state;
    let key = method as *const MethodInfo as usize;

    state.lock.enter(thread);
    if let Some(sym) = state.cache.get(&key) {
        let sym = *sym;
        state.lock.exit();
        return Some(sym);
    }
    log::debug!("resolving native method {}", names.long_name);
    let resolved = state
        .find_symbol(names.short_name)
        .or_else(|| state.find_symbol(names.long_name));
    if let Some(sym) = resolved {
        state.cache.insert(key, sym);
    }
    state.lock.exit();

    if resolved.is_none() {
        exception::set_unsatisfied_link(thread, names.long_name);
    }
    return resolved;
}

/// Root native frame pushed when a thread attaches, so JNI helpers always
/// find a reference table.
pub fn make_root_frame(thread: ThreadPtr) -> FramePtr {
    Frame::push_native(thread)
}
