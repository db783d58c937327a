//! The minimum JNI surface (JNI 1.x semantics).
//!
//! The env pointer is the thread context; handles are pointers into the
//! native frame's reference tables. Each function leaves the safe region to
//! touch raw objects and re-enters it before returning, mirroring the
//! boundary discipline native code itself must follow.

use super::{dereference, enter_jni, env_of, exit_jni, get_local_ref, thread_of, RawJniEnv};
use crate::classloader;
use crate::exception;
use crate::memory::heap::Heap;
use crate::memory::Address;
use crate::metadata::BasicType;
use crate::object::prelude::*;
use crate::object::{JavaArray, Object};
use crate::string_pool;
use ::jni::sys::{jboolean, jbyte, jint, jobject, jsize, JNI_TRUE};

pub use super::env_of as env;

pub type JFieldId = Ptr<ResolvedField>;

fn with_raw_access<R>(env: RawJniEnv, f: impl FnOnce(crate::thread::ThreadPtr) -> R) -> R {
    let thread = thread_of(env);
    exit_jni(thread);
    let result = f(thread);
    enter_jni(thread);
    return result;
}

fn class_of_handle(thread: crate::thread::ThreadPtr, cls: jobject) -> JClassPtr {
    let obj = dereference(thread, cls);
    debug_assert!(obj.is_not_null());
    // jclass handles reference the class block itself.
    debug_assert!(Object::class_of(obj).is_null());
    return obj.cast();
}

/// GetFieldID causes an uninitialized class to be initialized.
pub fn get_field_id(env: RawJniEnv, cls: jobject, name: &str, sig: &str) -> JFieldId {
    with_raw_access(env, |thread| {
        let clazz = class_of_handle(thread, cls);
        let vm = thread.vm();
        if !vm.as_mut_ref().class_loader.init_class(thread, clazz) {
            return JFieldId::null();
        }
        match classloader::field_find(clazz, name, sig) {
            Some(field) if !field.is_static => field,
            _ => {
                exception::set_no_such_field(thread, name);
                JFieldId::null()
            }
        }
    })
}

pub fn get_static_field_id(env: RawJniEnv, cls: jobject, name: &str, sig: &str) -> JFieldId {
    with_raw_access(env, |thread| {
        let clazz = class_of_handle(thread, cls);
        let vm = thread.vm();
        if !vm.as_mut_ref().class_loader.init_class(thread, clazz) {
            return JFieldId::null();
        }
        match classloader::field_find(clazz, name, sig) {
            Some(field) if field.is_static => field,
            _ => {
                exception::set_no_such_field(thread, name);
                JFieldId::null()
            }
        }
    })
}

pub fn get_object_field(env: RawJniEnv, obj: jobject, field: JFieldId) -> jobject {
    debug_assert!(field.is_not_null() && !field.is_static);
    with_raw_access(env, |thread| {
        let object = dereference(thread, obj);
        if object.is_null() {
            exception::set_null_pointer(thread, field.info.name);
            return std::ptr::null_mut();
        }
        let value = Object::read_ref(object, field.offset);
        return get_local_ref(thread, value);
    })
}

pub fn get_int_field(env: RawJniEnv, obj: jobject, field: JFieldId) -> jint {
    debug_assert!(field.is_not_null() && !field.is_static);
    with_raw_access(env, |thread| {
        let object = dereference(thread, obj);
        if object.is_null() {
            exception::set_null_pointer(thread, field.info.name);
            return 0;
        }
        let slot: Ptr<JInt> = object.cast::<u8>().offset(field.offset as isize).cast();
        return *slot.as_ref();
    })
}

pub fn set_static_object_field(env: RawJniEnv, cls: jobject, field: JFieldId, value: jobject) {
    debug_assert!(field.is_not_null() && field.is_static);
    with_raw_access(env, |thread| {
        let clazz = class_of_handle(thread, cls);
        let obj = dereference(thread, value);
        JClass::write_static_ref(clazz, field.offset, obj);
        thread.vm().as_ref().heap.write_barrier(
            clazz.as_address().uoffset(field.offset),
            clazz.as_address(),
            obj,
        );
    })
}

pub fn get_string_utf_length(env: RawJniEnv, string: jobject) -> jsize {
    with_raw_access(env, |thread| {
        let s = dereference(thread, string);
        if s.is_null() {
            exception::set_null_pointer(thread, "string");
            return 0;
        }
        return string_pool::java_string_to_rust(s).len() as jsize;
    })
}

/// Always returns a fresh copy; `is_copy` is set to JNI_TRUE. The copy must
/// be released with [release_string_utf_chars].
pub fn get_string_utf_chars(env: RawJniEnv, string: jobject, is_copy: Option<&mut jboolean>) -> *const u8 {
    with_raw_access(env, |thread| {
        let s = dereference(thread, string);
        if s.is_null() {
            exception::set_null_pointer(thread, "string");
            return std::ptr::null();
        }
        let utf8 = string_pool::java_string_to_rust(s);
        let storage = Heap::alloc_uncollectable(utf8.len() + 1);
        if storage.is_null() {
            exception::set_oom(thread);
            return std::ptr::null();
        }
        unsafe {
            std::ptr::copy_nonoverlapping(utf8.as_ptr(), storage.as_mut_raw_ptr(), utf8.len());
            *storage.uoffset(utf8.len()).as_mut_raw_ptr() = 0;
        }
        if let Some(flag) = is_copy {
            *flag = JNI_TRUE;
        }
        return storage.raw_ptr();
    })
}

pub fn release_string_utf_chars(_env: RawJniEnv, _string: jobject, utf: *const u8) {
    Heap::free_uncollectable(Address::new(utf));
}

pub fn get_array_length(env: RawJniEnv, array: jobject) -> jsize {
    with_raw_access(env, |thread| {
        let arr = dereference(thread, array);
        if arr.is_null() {
            exception::set_null_pointer(thread, "array");
            return 0;
        }
        return JavaArray::length(arr.cast());
    })
}

pub fn get_byte_array_region(env: RawJniEnv, array: jobject, start: jsize, len: jsize, buf: &mut [jbyte]) {
    debug_assert!(buf.len() >= len as usize);
    with_raw_access(env, |thread| {
        let arr = dereference(thread, array);
        if arr.is_null() {
            exception::set_null_pointer(thread, "array");
            return;
        }
        let arr: JArrayPtr = arr.cast();
        let length = JavaArray::length(arr);
        if start < 0 || len < 0 || start + len > length {
            exception::set_array_index_out_of_bounds(thread, start + len, length);
            return;
        }
        let src = JavaArray::element_at(arr, BasicType::Byte, start as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.raw_ptr() as *const jbyte,
                buf.as_mut_ptr(),
                len as usize,
            );
        }
    })
}
