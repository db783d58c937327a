use crate::memory::Address;
use std::ops::{Deref, DerefMut};

pub struct Ptr<T> {
    ptr: *const T,
}

impl<T> Ptr<T> {
    pub const fn new(ptr: *const T) -> Ptr<T> {
        Ptr { ptr }
    }

    pub const fn from_addr(addr: Address) -> Ptr<T> {
        Ptr {
            ptr: addr.raw_ptr() as _,
        }
    }

    pub const fn from_usize(addr: usize) -> Ptr<T> {
        Self::from_addr(Address::from_usize(addr))
    }

    pub fn from_ref(r: &T) -> Ptr<T> {
        Ptr { ptr: r as *const T }
    }

    pub const fn null() -> Ptr<T> {
        Ptr {
            ptr: std::ptr::null(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn is_not_null(&self) -> bool {
        !self.ptr.is_null()
    }

    pub fn cast<S>(&self) -> Ptr<S> {
        Ptr {
            ptr: self.ptr as *const S,
        }
    }

    pub fn as_raw_ptr(&self) -> *const T {
        self.ptr
    }

    pub fn as_mut_raw_ptr(&self) -> *mut T {
        self.ptr as _
    }

    pub fn as_address(&self) -> Address {
        Address::new(self.ptr.cast())
    }

    pub fn as_usize(&self) -> usize {
        self.ptr as usize
    }

    pub fn as_ref(&self) -> &'static T {
        debug_assert!(self.is_not_null());
        unsafe { &*self.ptr }
    }

    pub fn as_mut_ref(&self) -> &'static mut T {
        debug_assert!(self.is_not_null());
        unsafe { &mut *(self.ptr as *mut T) }
    }

    pub fn offset(&self, offset: isize) -> Ptr<T> {
        Ptr::new(self.ptr.wrapping_offset(offset))
    }

    pub fn offset_bytes(&self, offset: isize) -> Ptr<T> {
        Ptr::from_addr(self.as_address().offset(offset))
    }

    pub fn as_slice(&self, len: usize) -> &'static [T] {
        unsafe { std::slice::from_raw_parts(self.ptr, len) }
    }

    pub fn as_mut_slice(&self, len: usize) -> &'static mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut T, len) }
    }
}

impl<T> Deref for Ptr<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        debug_assert!(self.is_not_null());
        unsafe { &*self.ptr }
    }
}

impl<T> DerefMut for Ptr<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        debug_assert!(self.is_not_null());
        unsafe { &mut *(self.ptr as *mut T) }
    }
}

impl<T> Copy for Ptr<T> {}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Ptr<T> {
        *self
    }
}

impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Ptr<T> {}

impl<T> std::fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Ptr(0x{:x})", self.ptr as usize))
    }
}

// Raw runtime pointers are shared across threads under the runtime's own
// locking and safepoint discipline.
unsafe impl<T> Send for Ptr<T> {}
unsafe impl<T> Sync for Ptr<T> {}
