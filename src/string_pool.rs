//! The translator's string constant pool and on-demand interning.
//!
//! Three parallel slots per constant: the UTF-8 literal, the id of the
//! thread currently building the instance, and the cached String object.
//! Interning is guarded by the java/lang/String class monitor; a recursive
//! request from the initializing thread is unrecoverable.

use crate::bytecode;
use crate::classloader;
use crate::exception;
use crate::metadata::BasicType;
use crate::monitor;
use crate::object::prelude::*;
use crate::object::{JavaArray, Object};
use crate::rt;
use crate::stack::Frame;
use crate::thread::ThreadPtr;

pub struct StringPool {
    literals: Vec<&'static str>,
    init_threads: Vec<JLong>,
    objects: Vec<ObjectPtr>,
}

impl StringPool {
    pub fn new(literals: &'static [&'static str]) -> StringPool {
        StringPool {
            literals: literals.to_vec(),
            init_threads: vec![0; literals.len()],
            objects: vec![ObjectPtr::null(); literals.len()],
        }
    }

    pub fn len(&self) -> usize {
        self.literals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    pub fn each_object<F: FnMut(ObjectPtr)>(&self, mut f: F) {
        for obj in &self.objects {
            if obj.is_not_null() {
                f(*obj);
            }
        }
    }

    pub fn fix_objects<F: Fn(ObjectPtr) -> ObjectPtr>(&mut self, f: F) {
        for obj in self.objects.iter_mut() {
            if obj.is_not_null() {
                *obj = f(*obj);
            }
        }
    }
}

fn string_value_offset() -> usize {
    rt::JAVA_LANG_STRING.instance_fields[0].offset
}

/// Build a java/lang/String from a Rust string, keeping the intermediate
/// char[] rooted on a scratch frame across the second allocation.
pub fn create_string(thread: ThreadPtr, s: &str) -> ObjectPtr {
    let frame = Frame::push_java(thread, None, 2, 0);

    let units: Vec<JChar> = s.encode_utf16().collect();
    let arr = bytecode::array_new(thread, "[C", units.len() as JInt);
    if arr.is_null() {
        Frame::pop(thread);
        return ObjectPtr::null();
    }
    for (i, unit) in units.iter().enumerate() {
        let slot: Ptr<JChar> = Ptr::from_addr(JavaArray::element_at(arr, BasicType::Char, i));
        *slot.as_mut_ref() = *unit;
    }
    frame.as_mut_ref().java_mut().operand_stack.push_object(arr.cast());

    let vm = thread.vm();
    let string_class = vm.as_ref().class_loader.string_class();
    debug_assert!(string_class.is_not_null());
    let obj = classloader::alloc_instance(thread, string_class);
    if obj.is_not_null() {
        // The array may have moved while the String was allocated.
        let arr = frame.java().operand_stack.peek(1).expect_object();
        let offset = string_value_offset();
        Object::write_ref(obj, offset, arr);
        vm.as_ref()
            .heap
            .write_barrier(Object::field_addr(obj, offset), obj.as_address(), arr);
    }
    Frame::pop(thread);
    return obj;
}

/// The `ldc` entry: return the interned String for a constant-pool slot,
/// creating it on first use.
pub fn constant(thread: ThreadPtr, index: usize) -> ObjectPtr {
    let vm = thread.vm();
    debug_assert!(index < vm.as_ref().string_pool.len());

    {
        let obj = vm.as_ref().string_pool.objects[index];
        if obj.is_not_null() {
            return obj;
        }
    }

    let string_class = vm.as_ref().class_loader.string_class();
    let lock_obj = JClass::as_object(string_class);

    monitor::monitor_enter(thread, lock_obj);
    loop {
        let init_thread = vm.as_ref().string_pool.init_threads[index];
        if init_thread == 0 {
            break;
        }
        if init_thread == thread.thread_id {
            monitor::monitor_exit(thread, lock_obj);
            // The constant's own construction looped back into itself.
            eprintln!("aotvm: recursive string constant initialization at {}", index);
            std::process::abort();
        }
        monitor::monitor_wait(thread, lock_obj, 0, 0);
    }
    {
        // Another thread may have finished it while we waited.
        let obj = vm.as_ref().string_pool.objects[index];
        if obj.is_not_null() {
            monitor::monitor_exit(thread, lock_obj);
            return obj;
        }
    }
    vm.as_mut_ref().string_pool.init_threads[index] = thread.thread_id;
    monitor::monitor_exit(thread, lock_obj);

    log::trace!("interning string constant {}", index);
    let literal = vm.as_ref().string_pool.literals[index];
    let s = create_string(thread, literal);
    if s.is_null() {
        // Allocation failed; release the slot so another attempt can run.
        monitor::monitor_enter(thread, lock_obj);
        vm.as_mut_ref().string_pool.init_threads[index] = 0;
        monitor::monitor_notify_all(thread, lock_obj);
        monitor::monitor_exit(thread, lock_obj);
        if !exception::occurred(thread) {
            exception::set_oom(thread);
        }
        return ObjectPtr::null();
    }

    // Keep the new instance rooted across the monitor operations.
    let frame = Frame::push_java(thread, None, 1, 0);
    frame.as_mut_ref().java_mut().operand_stack.push_object(s);

    monitor::monitor_enter(thread, lock_obj);
    let s = frame.java().operand_stack.peek(1).expect_object();
    vm.as_mut_ref().string_pool.objects[index] = s;
    vm.as_mut_ref().string_pool.init_threads[index] = 0;
    monitor::monitor_notify_all(thread, lock_obj);
    monitor::monitor_exit(thread, lock_obj);

    Frame::pop(thread);
    return s;
}

/// Read a java/lang/String back into a Rust string.
pub fn java_string_to_rust(s: ObjectPtr) -> String {
    debug_assert!(s.is_not_null());
    let value = Object::read_ref(s, string_value_offset());
    if value.is_null() {
        return String::new();
    }
    let arr: JArrayPtr = value.cast();
    let len = JavaArray::length(arr) as usize;
    let mut units = Vec::with_capacity(len);
    for i in 0..len {
        let slot: Ptr<JChar> = Ptr::from_addr(JavaArray::element_at(arr, BasicType::Char, i));
        units.push(*slot.as_ref());
    }
    return String::from_utf16_lossy(&units);
}
