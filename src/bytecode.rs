//! Bytecode-level intrinsics called by translated method bodies.
//!
//! Generated code owns its frame and labels; these functions manipulate the
//! operand stack and locals with full JLS semantics for the corner cases
//! (signed rollover, division edge cases, shift masking, NaN orderings).
//! Anything that can throw stores the exception on the thread context and
//! returns; the generated caller checks `exception::occurred` and branches
//! to its handler chain.

use crate::classloader::{alloc_instance, get_class_by_name, get_class_by_name_init, get_class_init};
use crate::exception;
use crate::memory::Address;
use crate::metadata::{BasicType, ClassInfoRef, MethodRoutine};
use crate::monitor;
use crate::object::class::class_assignable;
use crate::object::prelude::*;
use crate::object::{JavaArray, Object};
use crate::stack::{Frame, FramePtr, OperandStack, Slot};
use crate::string_pool;
use crate::thread::{ThreadPtr, ThreadResult};
use paste::paste;

#[inline(always)]
fn read_mem<T: Copy>(addr: Address) -> T {
    unsafe { std::ptr::read(addr.raw_ptr() as *const T) }
}

#[inline(always)]
fn write_mem<T>(addr: Address, value: T) {
    unsafe {
        std::ptr::write(addr.as_mut_raw_ptr() as *mut T, value);
    }
}

#[inline(always)]
fn caller_stack(caller: FramePtr) -> &'static mut OperandStack {
    &mut caller.as_mut_ref().java_mut().operand_stack
}

pub fn line(frame: FramePtr, line: u16) {
    frame.as_mut_ref().java_mut().current_line = line;
}

pub fn label(frame: FramePtr, label: i32) {
    frame.as_mut_ref().java_mut().current_label = label;
}

/// Pop `argument_count` slots from the caller's operand stack into this
/// frame's locals.
pub fn prepare_arguments(frame: FramePtr, argument_count: usize) {
    let caller = frame.prev();
    debug_assert!(caller.is_not_null() && caller.is_java());
    frame.as_mut_ref().java_mut().transfer_arguments(caller, argument_count);
}

/// Instance-method prologue: validate the receiver in local 0 and make its
/// class the frame's class.
pub fn check_objref(thread: ThreadPtr, frame: FramePtr) {
    let receiver = frame.java().locals.get(0).expect_object();
    if receiver.is_null() {
        exception::set_null_pointer(thread, "this");
        return;
    }
    frame.as_mut_ref().this_class = Object::class_of(receiver);
}

//*********************************************************************************************************
// Arithmetic
//*********************************************************************************************************

macro_rules! def_int_arith {
    ($($name:ident, $pop:ident, $push:ident, $op:ident;)*) => {
        $(
            pub fn $name(stack: &mut OperandStack) {
                let v2 = stack.$pop();
                let v1 = stack.$pop();
                stack.$push(v1.$op(v2));
            }
        )*
    };
}

def_int_arith!(
    iadd, pop_int, push_int, wrapping_add;
    isub, pop_int, push_int, wrapping_sub;
    imul, pop_int, push_int, wrapping_mul;
    ladd, pop_long, push_long, wrapping_add;
    lsub, pop_long, push_long, wrapping_sub;
    lmul, pop_long, push_long, wrapping_mul;
);

macro_rules! def_float_arith {
    ($($name:ident, $pop:ident, $push:ident, $op:tt;)*) => {
        $(
            pub fn $name(stack: &mut OperandStack) {
                let v2 = stack.$pop();
                let v1 = stack.$pop();
                stack.$push(v1 $op v2);
            }
        )*
    };
}

def_float_arith!(
    fadd, pop_float, push_float, +;
    fsub, pop_float, push_float, -;
    fmul, pop_float, push_float, *;
    fdiv, pop_float, push_float, /;
    dadd, pop_double, push_double, +;
    dsub, pop_double, push_double, -;
    dmul, pop_double, push_double, *;
    ddiv, pop_double, push_double, /;
);

pub fn idiv(thread: ThreadPtr, stack: &mut OperandStack) {
    let v2 = stack.pop_int();
    let v1 = stack.pop_int();
    if v2 == 0 {
        exception::set_arithmetic(thread, "/ by zero");
        return;
    }
    // Integer.MIN_VALUE / -1 rolls over to Integer.MIN_VALUE.
    stack.push_int(v1.wrapping_div(v2));
}

pub fn ldiv(thread: ThreadPtr, stack: &mut OperandStack) {
    let v2 = stack.pop_long();
    let v1 = stack.pop_long();
    if v2 == 0 {
        exception::set_arithmetic(thread, "/ by zero");
        return;
    }
    stack.push_long(v1.wrapping_div(v2));
}

pub fn irem(thread: ThreadPtr, stack: &mut OperandStack) {
    let v2 = stack.pop_int();
    let v1 = stack.pop_int();
    if v2 == 0 {
        exception::set_arithmetic(thread, "% by zero");
        return;
    }
    stack.push_int(v1.wrapping_rem(v2));
}

pub fn lrem(thread: ThreadPtr, stack: &mut OperandStack) {
    let v2 = stack.pop_long();
    let v1 = stack.pop_long();
    if v2 == 0 {
        exception::set_arithmetic(thread, "% by zero");
        return;
    }
    stack.push_long(v1.wrapping_rem(v2));
}

/// fmod on f32 misbehaves near zero; widen to f64 first.
pub fn frem(stack: &mut OperandStack) {
    let v2 = stack.pop_float();
    let v1 = stack.pop_float();
    stack.push_float((v1 as JDouble % v2 as JDouble) as JFloat);
}

pub fn drem(stack: &mut OperandStack) {
    let v2 = stack.pop_double();
    let v1 = stack.pop_double();
    stack.push_double(v1 % v2);
}

pub fn ineg(stack: &mut OperandStack) {
    let v = stack.pop_int();
    stack.push_int(v.wrapping_neg());
}

pub fn lneg(stack: &mut OperandStack) {
    let v = stack.pop_long();
    stack.push_long(v.wrapping_neg());
}

pub fn fneg(stack: &mut OperandStack) {
    let v = stack.pop_float();
    stack.push_float(-v);
}

pub fn dneg(stack: &mut OperandStack) {
    let v = stack.pop_double();
    stack.push_double(-v);
}

// Shift counts are masked to 5 bits for int, 6 for long. The shift count of
// the long forms arrives as an int on the stack.

pub fn ishl(stack: &mut OperandStack) {
    let s = stack.pop_int() as u32 & 0x1F;
    let v = stack.pop_int();
    stack.push_int(v.wrapping_shl(s));
}

pub fn ishr(stack: &mut OperandStack) {
    let s = stack.pop_int() as u32 & 0x1F;
    let v = stack.pop_int();
    stack.push_int(v >> s);
}

pub fn iushr(stack: &mut OperandStack) {
    let s = stack.pop_int() as u32 & 0x1F;
    let v = stack.pop_int();
    stack.push_int(((v as u32) >> s) as JInt);
}

pub fn lshl(stack: &mut OperandStack) {
    let s = stack.pop_int() as u32 & 0x3F;
    let v = stack.pop_long();
    stack.push_long(v.wrapping_shl(s));
}

pub fn lshr(stack: &mut OperandStack) {
    let s = stack.pop_int() as u32 & 0x3F;
    let v = stack.pop_long();
    stack.push_long(v >> s);
}

pub fn lushr(stack: &mut OperandStack) {
    let s = stack.pop_int() as u32 & 0x3F;
    let v = stack.pop_long();
    stack.push_long(((v as u64) >> s) as JLong);
}

def_float_arith!(
    iand, pop_int, push_int, &;
    ior, pop_int, push_int, |;
    ixor, pop_int, push_int, ^;
    land, pop_long, push_long, &;
    lor, pop_long, push_long, |;
    lxor, pop_long, push_long, ^;
);

//*********************************************************************************************************
// Conversions
//*********************************************************************************************************

macro_rules! def_conv {
    ($($name:ident, $pop:ident, $push:ident, $ty:ty;)*) => {
        $(
            pub fn $name(stack: &mut OperandStack) {
                let v = stack.$pop();
                stack.$push(v as $ty);
            }
        )*
    };
}

// Float-to-int conversions follow Java: NaN becomes 0 and out-of-range
// values saturate, which is what Rust `as` does.
def_conv!(
    i2l, pop_int, push_long, JLong;
    i2f, pop_int, push_float, JFloat;
    i2d, pop_int, push_double, JDouble;
    l2i, pop_long, push_int, JInt;
    l2f, pop_long, push_float, JFloat;
    l2d, pop_long, push_double, JDouble;
    f2i, pop_float, push_int, JInt;
    f2l, pop_float, push_long, JLong;
    f2d, pop_float, push_double, JDouble;
    d2i, pop_double, push_int, JInt;
    d2l, pop_double, push_long, JLong;
    d2f, pop_double, push_float, JFloat;
);

pub fn i2b(stack: &mut OperandStack) {
    let v = stack.pop_int();
    stack.push_int(v as JByte as JInt);
}

pub fn i2s(stack: &mut OperandStack) {
    let v = stack.pop_int();
    stack.push_int(v as JShort as JInt);
}

/// char is zero-extended.
pub fn i2c(stack: &mut OperandStack) {
    let v = stack.pop_int();
    stack.push_int(v as JChar as JInt);
}

//*********************************************************************************************************
// Comparisons
//*********************************************************************************************************

pub fn lcmp(stack: &mut OperandStack) {
    let v2 = stack.pop_long();
    let v1 = stack.pop_long();
    stack.push_int(if v1 == v2 {
        0
    } else if v1 > v2 {
        1
    } else {
        -1
    });
}

macro_rules! def_fp_cmp {
    ($($name:ident, $pop:ident, $nan:literal;)*) => {
        $(
            pub fn $name(stack: &mut OperandStack) {
                let v2 = stack.$pop();
                let v1 = stack.$pop();
                let result = if v1.is_nan() || v2.is_nan() {
                    $nan
                } else if v1 == v2 {
                    0
                } else if v1 > v2 {
                    1
                } else {
                    -1
                };
                stack.push_int(result);
            }
        )*
    };
}

def_fp_cmp!(
    fcmpl, pop_float, -1;
    fcmpg, pop_float, 1;
    dcmpl, pop_double, -1;
    dcmpg, pop_double, 1;
);

//*********************************************************************************************************
// Branches
//*********************************************************************************************************

macro_rules! def_branch_if {
    ($($name:ident, $op:tt;)*) => {
        $(
            pub fn $name(stack: &mut OperandStack) -> bool {
                let v = stack.pop_int();
                v $op 0
            }
        )*
    };
}

def_branch_if!(
    ifeq, ==;
    ifne, !=;
    iflt, <;
    ifle, <=;
    ifgt, >;
    ifge, >=;
);

macro_rules! def_branch_icmp {
    ($($name:ident, $op:tt;)*) => {
        $(
            pub fn $name(stack: &mut OperandStack) -> bool {
                let v2 = stack.pop_int();
                let v1 = stack.pop_int();
                v1 $op v2
            }
        )*
    };
}

def_branch_icmp!(
    if_icmpeq, ==;
    if_icmpne, !=;
    if_icmplt, <;
    if_icmple, <=;
    if_icmpgt, >;
    if_icmpge, >=;
);

pub fn if_acmpeq(stack: &mut OperandStack) -> bool {
    let v2 = stack.pop_object();
    let v1 = stack.pop_object();
    v1 == v2
}

pub fn if_acmpne(stack: &mut OperandStack) -> bool {
    !if_acmpeq(stack)
}

pub fn ifnull(stack: &mut OperandStack) -> bool {
    stack.pop_object().is_null()
}

/// tableswitch / lookupswitch key; the generated code matches on it.
pub fn switch_index(stack: &mut OperandStack) -> JInt {
    stack.pop_int()
}

//*********************************************************************************************************
// ldc
//*********************************************************************************************************

/// ldc of a class constant resolves without initializing.
pub fn ldc_class(thread: ThreadPtr, caller: FramePtr, class_name: &str) {
    let clazz = get_class_by_name(thread, class_name);
    if clazz.is_null() {
        return;
    }
    caller_stack(caller).push_object(clazz.class_instance);
}

pub fn ldc_string(thread: ThreadPtr, caller: FramePtr, constant_index: usize) {
    let s = string_pool::constant(thread, constant_index);
    if exception::occurred(thread) {
        return;
    }
    caller_stack(caller).push_object(s);
}

//*********************************************************************************************************
// Class resolution, new, checkcast, instanceof
//*********************************************************************************************************

/// getstatic/putstatic/invokestatic/new trigger resolution plus
/// initialization of the owning class.
pub fn resolve_class(thread: ThreadPtr, info: ClassInfoRef) -> JClassPtr {
    get_class_init(thread, info)
}

pub fn new_instance(thread: ThreadPtr, caller: FramePtr, info: ClassInfoRef) {
    let clazz = resolve_class(thread, info);
    if clazz.is_null() {
        return;
    }
    debug_assert!(!clazz.is_primitive());
    let obj = alloc_instance(thread, clazz);
    if obj.is_null() {
        return;
    }
    caller_stack(caller).push_object(obj);
}

pub fn instanceof(stack: &mut OperandStack, info: ClassInfoRef) {
    let obj = stack.pop_object();
    let result = obj.is_not_null() && class_assignable(Object::class_of(obj).info.as_ref(), info);
    stack.push_int(result as JInt);
}

/// instanceof against an array descriptor; resolves the array class first.
pub fn instanceof_desc(thread: ThreadPtr, caller: FramePtr, desc: &str) {
    let target = get_class_by_name(thread, desc);
    if target.is_null() {
        return;
    }
    instanceof(caller_stack(caller), target.info.as_ref());
}

pub fn checkcast(thread: ThreadPtr, stack: &mut OperandStack, info: ClassInfoRef) {
    let obj = *stack.peek(1);
    let obj = obj.expect_object();
    if obj.is_null() {
        return;
    }
    let from = Object::class_of(obj).info.as_ref();
    if !class_assignable(from, info) {
        exception::set_class_cast(thread, from, info);
    }
}

pub fn checkcast_desc(thread: ThreadPtr, caller: FramePtr, desc: &str) {
    let target = get_class_by_name(thread, desc);
    if target.is_null() {
        return;
    }
    checkcast(thread, caller_stack(caller), target.info.as_ref());
}

//*********************************************************************************************************
// Field access
//*********************************************************************************************************

macro_rules! def_field_access {
    ($($kind:ident, $ty:ty, $pop:ident, $push:ident, $to_mem:expr, $to_slot:expr;)*) => {
        paste! {
            $(
                pub fn [<getfield_ $kind>](
                    thread: ThreadPtr,
                    stack: &mut OperandStack,
                    info: ClassInfoRef,
                    field_index: u16,
                ) {
                    let obj = stack.pop_object();
                    if obj.is_null() {
                        exception::set_null_pointer(thread, info.instance_fields[field_index as usize].declaring.unwrap_or(info).name);
                        return;
                    }
                    let offset = info.instance_fields[field_index as usize].offset;
                    let raw: $ty = read_mem(Object::field_addr(obj, offset));
                    stack.$push(($to_slot)(raw));
                }

                pub fn [<putfield_ $kind>](
                    thread: ThreadPtr,
                    stack: &mut OperandStack,
                    info: ClassInfoRef,
                    field_index: u16,
                ) {
                    let value = stack.$pop();
                    let obj = stack.pop_object();
                    if obj.is_null() {
                        exception::set_null_pointer(thread, info.instance_fields[field_index as usize].declaring.unwrap_or(info).name);
                        return;
                    }
                    let offset = info.instance_fields[field_index as usize].offset;
                    write_mem::<$ty>(Object::field_addr(obj, offset), ($to_mem)(value));
                }

                pub fn [<getstatic_ $kind>](
                    thread: ThreadPtr,
                    caller: FramePtr,
                    info: ClassInfoRef,
                    field_index: u16,
                ) {
                    let clazz = resolve_class(thread, info);
                    if clazz.is_null() {
                        return;
                    }
                    let offset = info.static_fields[field_index as usize].offset;
                    let raw: $ty = read_mem(clazz.as_address().uoffset(offset));
                    caller_stack(caller).$push(($to_slot)(raw));
                }

                pub fn [<putstatic_ $kind>](
                    thread: ThreadPtr,
                    caller: FramePtr,
                    info: ClassInfoRef,
                    field_index: u16,
                ) {
                    let clazz = resolve_class(thread, info);
                    if clazz.is_null() {
                        return;
                    }
                    let value = caller_stack(caller).$pop();
                    let offset = info.static_fields[field_index as usize].offset;
                    write_mem::<$ty>(clazz.as_address().uoffset(offset), ($to_mem)(value));
                }
            )*
        }
    };
}

def_field_access!(
    boolean, JBoolean, pop_int, push_int, (|v: JInt| v as JBoolean), (|v: JBoolean| v as JInt);
    byte, JByte, pop_int, push_int, (|v: JInt| v as JByte), (|v: JByte| v as JInt);
    char, JChar, pop_int, push_int, (|v: JInt| v as JChar), (|v: JChar| v as JInt);
    short, JShort, pop_int, push_int, (|v: JInt| v as JShort), (|v: JShort| v as JInt);
    int, JInt, pop_int, push_int, (|v: JInt| v), (|v: JInt| v);
    long, JLong, pop_long, push_long, (|v: JLong| v), (|v: JLong| v);
    float, JFloat, pop_float, push_float, (|v: JFloat| v), (|v: JFloat| v);
    double, JDouble, pop_double, push_double, (|v: JDouble| v), (|v: JDouble| v);
);

pub fn getfield_object(thread: ThreadPtr, stack: &mut OperandStack, info: ClassInfoRef, field_index: u16) {
    let obj = stack.pop_object();
    if obj.is_null() {
        exception::set_null_pointer(thread, info.name);
        return;
    }
    let offset = info.instance_fields[field_index as usize].offset;
    stack.push_object(Object::read_ref(obj, offset));
}

pub fn putfield_object(thread: ThreadPtr, stack: &mut OperandStack, info: ClassInfoRef, field_index: u16) {
    let value = stack.pop_object();
    let obj = stack.pop_object();
    if obj.is_null() {
        exception::set_null_pointer(thread, info.name);
        return;
    }
    let offset = info.instance_fields[field_index as usize].offset;
    Object::write_ref(obj, offset, value);
    thread
        .vm()
        .as_ref()
        .heap
        .write_barrier(Object::field_addr(obj, offset), obj.as_address(), value);
}

pub fn getstatic_object(thread: ThreadPtr, caller: FramePtr, info: ClassInfoRef, field_index: u16) {
    let clazz = resolve_class(thread, info);
    if clazz.is_null() {
        return;
    }
    let offset = info.static_fields[field_index as usize].offset;
    caller_stack(caller).push_object(JClass::read_static_ref(clazz, offset));
}

pub fn putstatic_object(thread: ThreadPtr, caller: FramePtr, info: ClassInfoRef, field_index: u16) {
    let clazz = resolve_class(thread, info);
    if clazz.is_null() {
        return;
    }
    let value = caller_stack(caller).pop_object();
    let offset = info.static_fields[field_index as usize].offset;
    JClass::write_static_ref(clazz, offset, value);
    thread
        .vm()
        .as_ref()
        .heap
        .write_barrier(clazz.as_address().uoffset(offset), clazz.as_address(), value);
}

//*********************************************************************************************************
// Arrays
//*********************************************************************************************************

/// Allocate an array of the class named by `desc` (which loads the component
/// type), length-checked.
pub fn array_new(thread: ThreadPtr, desc: &str, length: JInt) -> JArrayPtr {
    let clazz = get_class_by_name_init(thread, desc);
    if clazz.is_null() {
        return JArrayPtr::null();
    }
    if length < 0 {
        exception::set_negative_array_size(thread, length);
        return JArrayPtr::null();
    }
    let element = clazz.info.element_type();
    let size = JavaArray::size_of(element, length as usize);
    let vm = thread.vm();
    let addr = vm.as_mut_ref().heap.alloc(thread, size);
    if addr.is_null() {
        exception::set_oom(thread);
        return JArrayPtr::null();
    }
    let arr: JArrayPtr = Ptr::from_addr(addr);
    Object::set_class(arr.cast(), clazz);
    JavaArray::set_length(arr, length);
    return arr;
}

pub fn newarray(thread: ThreadPtr, caller: FramePtr, desc: &str) {
    let length = caller_stack(caller).pop_int();
    let arr = array_new(thread, desc, length);
    if arr.is_null() {
        return;
    }
    caller_stack(caller).push_object(arr.cast());
}

pub fn arraylength(thread: ThreadPtr, stack: &mut OperandStack) {
    let obj = stack.pop_object();
    if obj.is_null() {
        exception::set_null_pointer(thread, "arraylength");
        return;
    }
    debug_assert!(Object::class_of(obj).is_array());
    stack.push_int(JavaArray::length(obj.cast()));
}

fn array_check(thread: ThreadPtr, obj: ObjectPtr, index: JInt) -> Option<JArrayPtr> {
    if obj.is_null() {
        exception::set_null_pointer(thread, "array");
        return None;
    }
    let arr: JArrayPtr = obj.cast();
    let length = JavaArray::length(arr);
    if index < 0 || index >= length {
        exception::set_array_index_out_of_bounds(thread, index, length);
        return None;
    }
    return Some(arr);
}

pub fn array_load(thread: ThreadPtr, stack: &mut OperandStack, t: BasicType) {
    let index = stack.pop_int();
    let obj = stack.pop_object();
    let arr = match array_check(thread, obj, index) {
        Some(arr) => arr,
        None => return,
    };
    let element = JavaArray::element_at(arr, t, index as usize);
    match t {
        BasicType::Boolean | BasicType::Byte => stack.push_int(read_mem::<JByte>(element) as JInt),
        // caload zero-extends.
        BasicType::Char => stack.push_int(read_mem::<JChar>(element) as JInt),
        BasicType::Short => stack.push_int(read_mem::<JShort>(element) as JInt),
        BasicType::Int => stack.push_int(read_mem::<JInt>(element)),
        BasicType::Long => stack.push_long(read_mem::<JLong>(element)),
        BasicType::Float => stack.push_float(read_mem::<JFloat>(element)),
        BasicType::Double => stack.push_double(read_mem::<JDouble>(element)),
        BasicType::Object | BasicType::Array => stack.push_object(read_mem::<ObjectPtr>(element)),
        BasicType::Void => debug_assert!(false, "void array element"),
    }
}

pub fn array_store(thread: ThreadPtr, stack: &mut OperandStack, t: BasicType) {
    let value = stack.pop();
    let index = stack.pop_int();
    let obj = stack.pop_object();
    let arr = match array_check(thread, obj, index) {
        Some(arr) => arr,
        None => return,
    };
    let element = JavaArray::element_at(arr, t, index as usize);
    match t {
        BasicType::Boolean | BasicType::Byte => write_mem(element, value.expect_int() as JByte),
        BasicType::Char => write_mem(element, value.expect_int() as JChar),
        BasicType::Short => write_mem(element, value.expect_int() as JShort),
        BasicType::Int => write_mem(element, value.expect_int()),
        BasicType::Long => write_mem(element, value.expect_long()),
        BasicType::Float => write_mem(element, value.expect_float()),
        BasicType::Double => write_mem(element, value.expect_double()),
        BasicType::Object | BasicType::Array => {
            let v = value.expect_object();
            let array_info = Object::class_of(arr.cast()).info.as_ref();
            if v.is_not_null() {
                let value_info = Object::class_of(v).info.as_ref();
                let component = array_info.element.expect("reference array without component");
                if !class_assignable(value_info, component) {
                    exception::set_array_store(thread, array_info, value_info);
                    return;
                }
            }
            write_mem(element, v);
            thread
                .vm()
                .as_ref()
                .heap
                .write_barrier(element, arr.as_address(), v);
        }
        BasicType::Void => debug_assert!(false, "void array element"),
    }
}

//*********************************************************************************************************
// Invocation
//*********************************************************************************************************

/// Call a translated method body and push its result (if any) onto the
/// caller's operand stack. Subword returns widen to int; char zero-extends.
pub fn invoke_routine(thread: ThreadPtr, caller: FramePtr, routine: MethodRoutine) {
    match routine {
        MethodRoutine::Void(f) => {
            f(thread);
        }
        MethodRoutine::Boolean(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_int(v as JInt);
            }
        }
        MethodRoutine::Byte(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_int(v as JInt);
            }
        }
        MethodRoutine::Char(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_int(v as JInt);
            }
        }
        MethodRoutine::Short(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_int(v as JInt);
            }
        }
        MethodRoutine::Int(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_int(v);
            }
        }
        MethodRoutine::Long(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_long(v);
            }
        }
        MethodRoutine::Float(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_float(v);
            }
        }
        MethodRoutine::Double(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_double(v);
            }
        }
        MethodRoutine::Object(f) => {
            let v = f(thread);
            if !exception::occurred(thread) {
                caller_stack(caller).push_object(v);
            }
        }
    }
}

/// invokestatic: resolve + initialize the class, then call.
pub fn invoke_static(thread: ThreadPtr, caller: FramePtr, info: ClassInfoRef, routine: MethodRoutine) {
    let clazz = resolve_class(thread, info);
    if clazz.is_null() {
        return;
    }
    thread.as_mut_ref().calling_class = clazz;
    invoke_routine(thread, caller, routine);
}

/// invokespecial: direct call, no dispatch.
pub fn invoke_special(thread: ThreadPtr, caller: FramePtr, routine: MethodRoutine) {
    invoke_routine(thread, caller, routine);
}

fn dispatch_receiver(thread: ThreadPtr, caller: FramePtr, argument_count: usize) -> Option<ObjectPtr> {
    debug_assert!(argument_count >= 1);
    let stack = caller_stack(caller);
    debug_assert!(stack.depth() >= argument_count);
    let receiver = stack.peek(argument_count).expect_object();
    if receiver.is_null() {
        exception::set_null_pointer(thread, "this");
        return None;
    }
    return Some(receiver);
}

/// invokevirtual: index the receiver's vtable with the translator-assigned
/// slot.
pub fn invoke_virtual(
    thread: ThreadPtr,
    caller: FramePtr,
    argument_count: usize,
    _declared: ClassInfoRef,
    vtable_index: u16,
) {
    let receiver = match dispatch_receiver(thread, caller, argument_count) {
        Some(r) => r,
        None => return,
    };
    let info = Object::class_of(receiver).info.as_ref();
    debug_assert!((vtable_index as usize) < info.vtable.len());
    let entry = &info.vtable[vtable_index as usize];
    match entry.method.code {
        Some(routine) => invoke_routine(thread, caller, routine),
        None => exception::set_abstract_method_error(thread, entry.method.name),
    }
}

fn itable_lookup(info: ClassInfoRef, interface: ClassInfoRef, method_index: u16) -> Option<u16> {
    for entry in info.itable {
        if entry.interface.same_as(interface) {
            for m in entry.methods {
                if m.method_index == method_index {
                    return Some(m.vtable_index);
                }
            }
            break;
        }
    }
    return info
        .super_class
        .and_then(|sup| itable_lookup(sup, interface, method_index));
}

/// invokeinterface: walk the receiver's itable chain, falling back to the
/// interface's default body.
pub fn invoke_interface(
    thread: ThreadPtr,
    caller: FramePtr,
    argument_count: usize,
    interface: ClassInfoRef,
    method_index: u16,
) {
    let receiver = match dispatch_receiver(thread, caller, argument_count) {
        Some(r) => r,
        None => return,
    };
    let info = Object::class_of(receiver).info.as_ref();
    if let Some(vtable_index) = itable_lookup(info, interface, method_index) {
        let entry = &info.vtable[vtable_index as usize];
        match entry.method.code {
            Some(routine) => return invoke_routine(thread, caller, routine),
            None => {
                exception::set_abstract_method_error(thread, entry.method.name);
                return;
            }
        }
    }
    // No itable entry anywhere: use the interface's default body if present.
    let declared = &interface.methods[method_index as usize];
    match declared.code {
        Some(routine) => invoke_routine(thread, caller, routine),
        None => exception::set_abstract_method_error(thread, declared.name),
    }
}

//*********************************************************************************************************
// Monitors, throw
//*********************************************************************************************************

pub fn monitorenter(thread: ThreadPtr, stack: &mut OperandStack) {
    let obj = stack.peek(1).expect_object();
    if obj.is_null() {
        stack.pop();
        exception::set_null_pointer(thread, "monitorenter");
        return;
    }
    // The receiver stays on the stack while the monitor is installed, so a
    // collection during a contended class-monitor enter cannot lose it.
    let result = monitor::monitor_enter_with(thread, || stack.peek(1).expect_object());
    stack.pop();
    if result != ThreadResult::Success {
        exception::set_illegal_monitor_state(thread, "monitorenter failed");
    }
}

pub fn monitorexit(thread: ThreadPtr, stack: &mut OperandStack) {
    let obj = stack.pop_object();
    if obj.is_null() {
        exception::set_null_pointer(thread, "monitorexit");
        return;
    }
    let result = monitor::monitor_exit(thread, obj);
    if result != ThreadResult::Success {
        exception::set_illegal_monitor_state(thread, "current thread is not owner");
    }
}

pub fn athrow(thread: ThreadPtr, stack: &mut OperandStack) {
    let ex = stack.pop_object();
    if ex.is_null() {
        exception::set_null_pointer(thread, "athrow");
        return;
    }
    exception::set(thread, ex);
}

//*********************************************************************************************************
// Returns
//*********************************************************************************************************

/// Pop the frame and leave; the typed forms read the return value off the
/// operand stack first.
pub fn vreturn(thread: ThreadPtr, _frame: FramePtr) {
    Frame::pop(thread);
}

macro_rules! def_return {
    ($($name:ident, $pop:ident, $ty:ty;)*) => {
        $(
            pub fn $name(thread: ThreadPtr, frame: FramePtr) -> $ty {
                let v = frame.as_mut_ref().java_mut().operand_stack.$pop();
                Frame::pop(thread);
                return v;
            }
        )*
    };
}

def_return!(
    ireturn, pop_int, JInt;
    lreturn, pop_long, JLong;
    freturn, pop_float, JFloat;
    dreturn, pop_double, JDouble;
    areturn, pop_object, ObjectPtr;
);

pub fn zreturn(thread: ThreadPtr, frame: FramePtr) -> JBoolean {
    ireturn(thread, frame) as JBoolean
}

pub fn breturn(thread: ThreadPtr, frame: FramePtr) -> JByte {
    ireturn(thread, frame) as JByte
}

pub fn creturn(thread: ThreadPtr, frame: FramePtr) -> JChar {
    ireturn(thread, frame) as JChar
}

pub fn sreturn(thread: ThreadPtr, frame: FramePtr) -> JShort {
    ireturn(thread, frame) as JShort
}

//*********************************************************************************************************
// Local loads and stores
//*********************************************************************************************************

macro_rules! def_load_store {
    ($($load:ident, $store:ident, $variant:ident;)*) => {
        $(
            pub fn $load(frame: FramePtr, local: usize) {
                let data = frame.as_mut_ref().java_mut();
                let v = data.locals.get(local);
                debug_assert!(matches!(v, Slot::$variant(_)));
                data.operand_stack.push(v);
            }

            pub fn $store(frame: FramePtr, local: usize) {
                let data = frame.as_mut_ref().java_mut();
                let v = data.operand_stack.pop();
                debug_assert!(matches!(v, Slot::$variant(_)));
                data.locals.set(local, v);
                if v.category() == crate::stack::Category::Cat2 {
                    data.locals.set(local + 1, Slot::Invalid);
                }
            }
        )*
    };
}

def_load_store!(
    aload, astore, Object;
    iload, istore, Int;
    lload, lstore, Long;
    fload, fstore, Float;
    dload, dstore, Double;
);

/// iinc: add `amount` to an int local in place.
pub fn iinc(frame: FramePtr, local: usize, amount: JInt) {
    let locals = &mut frame.as_mut_ref().java_mut().locals;
    let v = locals.get(local).expect_int();
    locals.set(local, Slot::Int(v.wrapping_add(amount)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::VMThreadContext;
    use crate::vm::VMPtr;

    fn with_frame(f: impl FnOnce(ThreadPtr, FramePtr)) {
        let thread = VMThreadContext::create(VMPtr::null());
        crate::thread::attach(thread);
        let frame = Frame::push_java(thread, None, 8, 4);
        f(thread, frame);
        Frame::pop(thread);
        VMThreadContext::destroy(thread);
    }

    fn stack(frame: FramePtr) -> &'static mut OperandStack {
        caller_stack(frame)
    }

    #[test]
    fn integer_division_rollover() {
        with_frame(|thread, frame| {
            let stack = stack(frame);
            stack.push_int(JInt::MIN);
            stack.push_int(-1);
            idiv(thread, stack);
            assert_eq!(stack.pop_int(), JInt::MIN);

            stack.push_long(JLong::MIN);
            stack.push_long(-1);
            lrem(thread, stack);
            assert_eq!(stack.pop_long(), 0);
        });
    }

    #[test]
    fn nan_comparisons() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            for v in [1.0f32, f32::NAN, -1.0] {
                stack.push_float(f32::NAN);
                stack.push_float(v);
                fcmpl(stack);
                assert_eq!(stack.pop_int(), -1);

                stack.push_float(f32::NAN);
                stack.push_float(v);
                fcmpg(stack);
                assert_eq!(stack.pop_int(), 1);
            }
            stack.push_double(f64::NAN);
            stack.push_double(f64::NAN);
            dcmpl(stack);
            assert_eq!(stack.pop_int(), -1);
            stack.push_double(f64::NAN);
            stack.push_double(0.5);
            dcmpg(stack);
            assert_eq!(stack.pop_int(), 1);
        });
    }

    #[test]
    fn shift_counts_are_masked() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            for x in [1, -3, 0x1234_5678, JInt::MIN] {
                stack.push_int(x);
                stack.push_int(33);
                ishl(stack);
                let shifted_33 = stack.pop_int();
                stack.push_int(x);
                stack.push_int(1);
                ishl(stack);
                assert_eq!(stack.pop_int(), shifted_33);
            }
            stack.push_long(0x1122_3344_5566_7788);
            stack.push_int(65);
            lshl(stack);
            let shifted_65 = stack.pop_long();
            stack.push_long(0x1122_3344_5566_7788);
            stack.push_int(1);
            lshl(stack);
            assert_eq!(stack.pop_long(), shifted_65);
        });
    }

    #[test]
    fn arithmetic_vs_logical_shift() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            stack.push_int(-8);
            stack.push_int(1);
            ishr(stack);
            assert_eq!(stack.pop_int(), -4);

            stack.push_int(-8);
            stack.push_int(1);
            iushr(stack);
            assert_eq!(stack.pop_int(), ((-8i32 as u32) >> 1) as i32);

            stack.push_long(-8);
            stack.push_int(1);
            lushr(stack);
            assert_eq!(stack.pop_long(), ((-8i64 as u64) >> 1) as i64);
        });
    }

    #[test]
    fn conversions_follow_jls() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            for i in [0, 1, -1, JInt::MAX, JInt::MIN] {
                stack.push_int(i);
                i2l(stack);
                l2i(stack);
                assert_eq!(stack.pop_int(), i);
            }

            stack.push_float(f32::NAN);
            f2i(stack);
            assert_eq!(stack.pop_int(), 0);

            stack.push_float(1e20);
            f2i(stack);
            assert_eq!(stack.pop_int(), JInt::MAX);

            stack.push_double(-1e300);
            d2l(stack);
            assert_eq!(stack.pop_long(), JLong::MIN);

            // i2c zero-extends, i2b sign-extends.
            stack.push_int(-1);
            i2c(stack);
            assert_eq!(stack.pop_int(), 0xFFFF);
            stack.push_int(0x180);
            i2b(stack);
            assert_eq!(stack.pop_int(), -128);
        });
    }

    #[test]
    fn frem_matches_fmod() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            stack.push_float(5.5);
            stack.push_float(2.0);
            frem(stack);
            assert_eq!(stack.pop_float(), 1.5);

            stack.push_double(-7.25);
            stack.push_double(2.0);
            drem(stack);
            assert_eq!(stack.pop_double(), -1.25);
        });
    }

    #[test]
    fn wrapping_add_and_neg() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            stack.push_int(JInt::MAX);
            stack.push_int(1);
            iadd(stack);
            assert_eq!(stack.pop_int(), JInt::MIN);

            stack.push_int(JInt::MIN);
            ineg(stack);
            assert_eq!(stack.pop_int(), JInt::MIN);
        });
    }

    #[test]
    fn branches_pop_and_compare() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            stack.push_int(0);
            assert!(ifeq(stack));
            stack.push_int(3);
            stack.push_int(4);
            assert!(if_icmplt(stack));
            stack.push_object(ObjectPtr::null());
            assert!(ifnull(stack));
            assert_eq!(stack.depth(), 0);
        });
    }

    #[test]
    fn lcmp_ordering() {
        with_frame(|_, frame| {
            let stack = stack(frame);
            stack.push_long(2);
            stack.push_long(1);
            lcmp(stack);
            assert_eq!(stack.pop_int(), 1);
            stack.push_long(1);
            stack.push_long(2);
            lcmp(stack);
            assert_eq!(stack.pop_int(), -1);
            stack.push_long(5);
            stack.push_long(5);
            lcmp(stack);
            assert_eq!(stack.pop_int(), 0);
        });
    }

    #[test]
    fn iinc_in_place() {
        with_frame(|_, frame| {
            frame.as_mut_ref().java_mut().locals.set(0, Slot::Int(40));
            iinc(frame, 0, 2);
            assert_eq!(frame.java().locals.get(0).expect_int(), 42);
        });
    }
}
