//! Pending-exception plumbing and handler matching.
//!
//! A thrown object is stored on the thread context; intrinsics that may
//! throw set it and return. Generated code checks `occurred` after each such
//! call and asks `catch_in_frame` for the label of the innermost matching
//! handler, falling out of the method (after popping its frame) when there
//! is none. There is no non-local jump: propagation across native frames is
//! a conventional return plus a post-call check.

use crate::classloader;
use crate::metadata::{pretty_descriptor, ClassInfoRef};
use crate::object::class::class_assignable;
use crate::object::prelude::*;
use crate::object::Object;
use crate::rt;
use crate::stack::{Frame, FramePtr};
use crate::string_pool;
use crate::thread::ThreadPtr;

pub fn occurred(thread: ThreadPtr) -> bool {
    thread.exception.is_not_null()
}

pub fn set(thread: ThreadPtr, ex: ObjectPtr) {
    thread.as_mut_ref().exception = ex;
}

pub fn clear(thread: ThreadPtr) -> ObjectPtr {
    let ex = thread.exception;
    thread.as_mut_ref().exception = ObjectPtr::null();
    return ex;
}

/// A handler covers the throw point when the current label lies in
/// [start, end) and its type (None = catch-all) is assignable from the
/// thrown class.
fn matches(ex: ObjectPtr, current_label: i32, start: i32, end: i32, catch_type: Option<ClassInfoRef>) -> bool {
    if current_label < start || current_label >= end {
        return false;
    }
    match catch_type {
        None => true,
        Some(t) => class_assignable(Object::class_of(ex).info.as_ref(), t),
    }
}

/// Resolve the pending exception against `frame`'s handler chain. On a match
/// the deeper frames are popped, the operand stack is cleared down to the
/// thrown object, and the handler label is returned for the generated code
/// to jump to. Otherwise the exception stays pending.
pub fn catch_in_frame(thread: ThreadPtr, frame: FramePtr) -> Option<i32> {
    if !occurred(thread) {
        return None;
    }
    Frame::pop_deeper(thread, frame);
    let ex = clear(thread);
    debug_assert!(ex.is_not_null());

    let label = frame.java().current_label;
    let mut target = None;
    for h in &frame.java().handlers {
        if matches(ex, label, h.start, h.end, h.catch_type) {
            target = Some(h.handler);
            break;
        }
    }
    match target {
        Some(handler) => {
            let data = frame.as_mut_ref().java_mut();
            data.operand_stack.clear();
            data.operand_stack.push_object(ex);
            return Some(handler);
        }
        None => {
            set(thread, ex);
            return None;
        }
    }
}

//*********************************************************************************************************
// Constructors
//*********************************************************************************************************

/// Allocate a throwable of `info` with a message, without running `<init>`:
/// the runtime writes the message field directly.
pub fn new_throwable(thread: ThreadPtr, info: ClassInfoRef, message: &str) -> ObjectPtr {
    let prev = clear(thread);

    let clazz = classloader::get_class_init(thread, info);
    if clazz.is_null() {
        set(thread, prev);
        return ObjectPtr::null();
    }

    // Scratch frame keeps the message reachable across the allocation.
    let frame = Frame::push_java(thread, None, 2, 0);
    let msg_obj = string_pool::create_string(thread, message);
    frame.as_mut_ref().java_mut().operand_stack.push_object(msg_obj);

    let obj = classloader::alloc_instance(thread, clazz);
    if obj.is_not_null() {
        if let Some(field) = classloader::field_find(clazz, "detailMessage", "Ljava/lang/String;") {
            // The message may have moved while the throwable was allocated.
            let msg_obj = frame.java().operand_stack.peek(1).expect_object();
            Object::write_ref(obj, field.offset, msg_obj);
            thread
                .vm()
                .as_ref()
                .heap
                .write_barrier(Object::field_addr(obj, field.offset), obj.as_address(), msg_obj);
        }
    }
    Frame::pop(thread);
    set(thread, prev);
    return obj;
}

pub fn set_new(thread: ThreadPtr, info: ClassInfoRef, message: &str) {
    let ex = new_throwable(thread, info, message);
    if ex.is_null() {
        set_oom(thread);
        return;
    }
    set(thread, ex);
}

pub fn set_null_pointer(thread: ThreadPtr, what: &str) {
    set_new(thread, &rt::JAVA_LANG_NULL_POINTER_EXCEPTION, what);
}

pub fn set_arithmetic(thread: ThreadPtr, message: &str) {
    set_new(thread, &rt::JAVA_LANG_ARITHMETIC_EXCEPTION, message);
}

pub fn set_class_cast(thread: ThreadPtr, from: ClassInfoRef, to: ClassInfoRef) {
    let message = format!(
        "{} cannot be cast to {}",
        pretty_descriptor(from.name),
        pretty_descriptor(to.name)
    );
    set_new(thread, &rt::JAVA_LANG_CLASS_CAST_EXCEPTION, &message);
}

pub fn set_array_index_out_of_bounds(thread: ThreadPtr, index: JInt, length: JInt) {
    let message = format!("Index {} out of bounds for length {}", index, length);
    set_new(thread, &rt::JAVA_LANG_ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, &message);
}

pub fn set_negative_array_size(thread: ThreadPtr, length: JInt) {
    set_new(thread, &rt::JAVA_LANG_NEGATIVE_ARRAY_SIZE_EXCEPTION, &length.to_string());
}

pub fn set_array_store(thread: ThreadPtr, array_type: ClassInfoRef, element_type: ClassInfoRef) {
    let message = format!(
        "{} into {}",
        pretty_descriptor(element_type.name),
        pretty_descriptor(array_type.name)
    );
    set_new(thread, &rt::JAVA_LANG_ARRAY_STORE_EXCEPTION, &message);
}

pub fn set_illegal_monitor_state(thread: ThreadPtr, message: &str) {
    set_new(thread, &rt::JAVA_LANG_ILLEGAL_MONITOR_STATE_EXCEPTION, message);
}

pub fn set_abstract_method_error(thread: ThreadPtr, message: &str) {
    set_new(thread, &rt::JAVA_LANG_ABSTRACT_METHOD_ERROR, message);
}

pub fn set_incompatible_class_change(thread: ThreadPtr, message: &str) {
    set_new(thread, &rt::JAVA_LANG_INCOMPATIBLE_CLASS_CHANGE_ERROR, message);
}

pub fn set_no_such_field(thread: ThreadPtr, name: &str) {
    set_new(thread, &rt::JAVA_LANG_NO_SUCH_FIELD_ERROR, name);
}

pub fn set_unsatisfied_link(thread: ThreadPtr, symbol: &str) {
    set_new(thread, &rt::JAVA_LANG_UNSATISFIED_LINK_ERROR, symbol);
}

pub fn set_no_class_def_found(thread: ThreadPtr, name: &str) {
    set_new(thread, &rt::JAVA_LANG_NO_CLASS_DEF_FOUND_ERROR, name);
}

pub fn set_exception_in_initializer(thread: ThreadPtr, class_name: &str) {
    set_new(thread, &rt::JAVA_LANG_EXCEPTION_IN_INITIALIZER_ERROR, class_name);
}

/// Out of memory escalates to abort only when even the error object cannot
/// be built.
pub fn set_oom(thread: ThreadPtr) {
    let ex = new_throwable(thread, &rt::JAVA_LANG_OUT_OF_MEMORY_ERROR, "Java heap space");
    if ex.is_null() {
        eprintln!("aotvm: OutOfMemoryError while constructing OutOfMemoryError");
        std::process::abort();
    }
    set(thread, ex);
}

/// Wrap a `<clinit>` failure: JLS 5.5 step 11 rethrows Errors as-is and
/// wraps everything else in ExceptionInInitializerError.
pub fn wrap_initializer_failure(thread: ThreadPtr, class_name: &str) {
    let ex = thread.exception;
    debug_assert!(ex.is_not_null());
    let info = Object::class_of(ex).info.as_ref();
    if class_assignable(info, &rt::JAVA_LANG_ERROR) {
        return;
    }
    clear(thread);
    set_exception_in_initializer(thread, class_name);
}
