//! Built-in core class images: the minimum java/lang surface the runtime
//! itself depends on, written exactly the way the translator emits classes.
//!
//! Every class is a `ClassInfo` literal plus one Rust function per method
//! body. The bodies go through the same frames and intrinsics as any other
//! translated code; only a few runtime-privileged bodies (printStackTrace,
//! the PrintStream natives) touch object memory directly.

use crate::bytecode;
use crate::classloader::{self, BASE_CLASS_BLOCK_SIZE};
use crate::exception;
use crate::memory::align_size_up;
use crate::metadata::*;
use crate::native::{self, NativeState, NativeSymbol, RawJniEnv};
use crate::object::prelude::*;
use crate::object::{Object, ObjectHeader};
use crate::stack::Frame;
use crate::string_pool;
use crate::thread::ThreadPtr;
use ::jni::sys::jobject;

const OBJ: usize = std::mem::size_of::<ObjectHeader>();
const PTR: usize = std::mem::size_of::<usize>();

//*********************************************************************************************************
// java/lang/Object
//*********************************************************************************************************

fn java_lang_object_init(thread: ThreadPtr) {
    let frame = Frame::push_java(thread, Some(&OBJECT_METHODS[0]), 0, 1);
    bytecode::prepare_arguments(frame, 1);
    bytecode::check_objref(thread, frame);
    bytecode::vreturn(thread, frame);
}

static OBJECT_METHODS: [MethodInfo; 1] = [MethodInfo {
    access_flags: METHOD_ACC_PUBLIC,
    name: "<init>",
    descriptor: "()V",
    code: Some(MethodRoutine::Void(java_lang_object_init)),
    native: None,
}];

pub static JAVA_LANG_OBJECT: ClassInfo = ClassInfo {
    access_flags: CLASS_ACC_PUBLIC,
    name: "java/lang/Object",
    super_class: None,
    interfaces: &[],
    fields: &[],
    methods: &OBJECT_METHODS,
    resolve: classloader::resolve_ordinary,
    class_size: BASE_CLASS_BLOCK_SIZE,
    instance_size: OBJ,
    static_fields: &[],
    instance_fields: &[],
    vtable: &[],
    itable: &[],
    clinit: None,
    finalizer: None,
    element: None,
};

//*********************************************************************************************************
// java/lang/Class
//*********************************************************************************************************

static CLASS_FIELDS: [FieldInfo; 1] = [FieldInfo {
    access_flags: FIELD_ACC_FINAL,
    name: "classData",
    descriptor: "J",
}];

static CLASS_INSTANCE_FIELDS: [PreResolvedInstanceField; 1] = [PreResolvedInstanceField {
    declaring: None,
    field_index: 0,
    offset: OBJ,
    is_reference: false,
}];

pub static JAVA_LANG_CLASS: ClassInfo = ClassInfo {
    access_flags: CLASS_ACC_PUBLIC | CLASS_ACC_FINAL,
    name: "java/lang/Class",
    super_class: Some(&JAVA_LANG_OBJECT),
    interfaces: &[],
    fields: &CLASS_FIELDS,
    methods: &[],
    resolve: classloader::resolve_ordinary,
    class_size: BASE_CLASS_BLOCK_SIZE,
    instance_size: OBJ + 8,
    static_fields: &[],
    instance_fields: &CLASS_INSTANCE_FIELDS,
    vtable: &[],
    itable: &[],
    clinit: None,
    finalizer: None,
    element: None,
};

//*********************************************************************************************************
// java/lang/String
//*********************************************************************************************************

static STRING_FIELDS: [FieldInfo; 1] = [FieldInfo {
    access_flags: FIELD_ACC_FINAL,
    name: "value",
    descriptor: "[C",
}];

static STRING_INSTANCE_FIELDS: [PreResolvedInstanceField; 1] = [PreResolvedInstanceField {
    declaring: None,
    field_index: 0,
    offset: OBJ,
    is_reference: true,
}];

pub static JAVA_LANG_STRING: ClassInfo = ClassInfo {
    access_flags: CLASS_ACC_PUBLIC | CLASS_ACC_FINAL,
    name: "java/lang/String",
    super_class: Some(&JAVA_LANG_OBJECT),
    interfaces: &[],
    fields: &STRING_FIELDS,
    methods: &[],
    resolve: classloader::resolve_ordinary,
    class_size: BASE_CLASS_BLOCK_SIZE,
    instance_size: OBJ + PTR,
    static_fields: &[],
    instance_fields: &STRING_INSTANCE_FIELDS,
    vtable: &[],
    itable: &[],
    clinit: None,
    finalizer: None,
    element: None,
};

//*********************************************************************************************************
// Marker interfaces implemented by arrays
//*********************************************************************************************************

macro_rules! def_marker_interface {
    ($ident:ident, $name:literal) => {
        pub static $ident: ClassInfo = ClassInfo {
            access_flags: CLASS_ACC_PUBLIC | CLASS_ACC_INTERFACE | CLASS_ACC_ABSTRACT,
            name: $name,
            super_class: Some(&JAVA_LANG_OBJECT),
            interfaces: &[],
            fields: &[],
            methods: &[],
            resolve: classloader::resolve_ordinary,
            class_size: BASE_CLASS_BLOCK_SIZE,
            instance_size: 0,
            static_fields: &[],
            instance_fields: &[],
            vtable: &[],
            itable: &[],
            clinit: None,
            finalizer: None,
            element: None,
        };
    };
}

def_marker_interface!(JAVA_LANG_CLONEABLE, "java/lang/Cloneable");
def_marker_interface!(JAVA_IO_SERIALIZABLE, "java/io/Serializable");

static ARRAY_INTERFACES: [ClassInfoRef; 2] = [&JAVA_LANG_CLONEABLE, &JAVA_IO_SERIALIZABLE];

pub fn array_interfaces() -> &'static [ClassInfoRef] {
    &ARRAY_INTERFACES
}

//*********************************************************************************************************
// java/lang/Throwable and the exception tree
//*********************************************************************************************************

const THROWABLE_MESSAGE_OFFSET: usize = OBJ;

fn java_lang_throwable_init(thread: ThreadPtr) {
    let frame = Frame::push_java(thread, Some(&THROWABLE_METHODS[0]), 2, 2);
    bytecode::prepare_arguments(frame, 2);
    bytecode::check_objref(thread, frame);
    if exception::occurred(thread) {
        Frame::pop(thread);
        return;
    }
    bytecode::aload(frame, 0);
    bytecode::aload(frame, 1);
    let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
    bytecode::putfield_object(thread, stack, &JAVA_LANG_THROWABLE, 0);
    bytecode::vreturn(thread, frame);
}

fn java_lang_throwable_get_message(thread: ThreadPtr) -> ObjectPtr {
    let frame = Frame::push_java(thread, Some(&THROWABLE_METHODS[1]), 1, 1);
    bytecode::prepare_arguments(frame, 1);
    bytecode::check_objref(thread, frame);
    if exception::occurred(thread) {
        Frame::pop(thread);
        return ObjectPtr::null();
    }
    bytecode::aload(frame, 0);
    let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
    bytecode::getfield_object(thread, stack, &JAVA_LANG_THROWABLE, 0);
    return bytecode::areturn(thread, frame);
}

fn java_lang_throwable_print_stack_trace(thread: ThreadPtr) {
    let frame = Frame::push_java(thread, Some(&THROWABLE_METHODS[2]), 1, 1);
    bytecode::prepare_arguments(frame, 1);
    bytecode::check_objref(thread, frame);
    if exception::occurred(thread) {
        Frame::pop(thread);
        return;
    }
    let this = frame.java().locals.get(0).expect_object();
    let name = Object::class_of(this).name().replace('/', ".");
    let message = Object::read_ref(this, THROWABLE_MESSAGE_OFFSET);
    if message.is_not_null() {
        eprintln!("{}: {}", name, string_pool::java_string_to_rust(message));
    } else {
        eprintln!("{}", name);
    }
    eprint!("{}", crate::stack::stack_trace_string(thread));
    bytecode::vreturn(thread, frame);
}

static THROWABLE_METHODS: [MethodInfo; 3] = [
    MethodInfo {
        access_flags: METHOD_ACC_PUBLIC,
        name: "<init>",
        descriptor: "(Ljava/lang/String;)V",
        code: Some(MethodRoutine::Void(java_lang_throwable_init)),
        native: None,
    },
    MethodInfo {
        access_flags: METHOD_ACC_PUBLIC,
        name: "getMessage",
        descriptor: "()Ljava/lang/String;",
        code: Some(MethodRoutine::Object(java_lang_throwable_get_message)),
        native: None,
    },
    MethodInfo {
        access_flags: METHOD_ACC_PUBLIC,
        name: "printStackTrace",
        descriptor: "()V",
        code: Some(MethodRoutine::Void(java_lang_throwable_print_stack_trace)),
        native: None,
    },
];

static THROWABLE_VTABLE: [VTableEntry; 2] = [
    VTableEntry {
        declaring: &JAVA_LANG_THROWABLE,
        method: &THROWABLE_METHODS[2],
    },
    VTableEntry {
        declaring: &JAVA_LANG_THROWABLE,
        method: &THROWABLE_METHODS[1],
    },
];

static THROWABLE_FIELDS: [FieldInfo; 1] = [FieldInfo {
    access_flags: 0,
    name: "detailMessage",
    descriptor: "Ljava/lang/String;",
}];

static THROWABLE_INSTANCE_FIELDS: [PreResolvedInstanceField; 1] = [PreResolvedInstanceField {
    declaring: None,
    field_index: 0,
    offset: THROWABLE_MESSAGE_OFFSET,
    is_reference: true,
}];

static THROWABLE_INHERITED_FIELDS: [PreResolvedInstanceField; 1] = [PreResolvedInstanceField {
    declaring: Some(&JAVA_LANG_THROWABLE),
    field_index: 0,
    offset: THROWABLE_MESSAGE_OFFSET,
    is_reference: true,
}];

pub static JAVA_LANG_THROWABLE: ClassInfo = ClassInfo {
    access_flags: CLASS_ACC_PUBLIC,
    name: "java/lang/Throwable",
    super_class: Some(&JAVA_LANG_OBJECT),
    interfaces: &[],
    fields: &THROWABLE_FIELDS,
    methods: &THROWABLE_METHODS,
    resolve: classloader::resolve_ordinary,
    class_size: BASE_CLASS_BLOCK_SIZE,
    instance_size: OBJ + PTR,
    static_fields: &[],
    instance_fields: &THROWABLE_INSTANCE_FIELDS,
    vtable: &THROWABLE_VTABLE,
    itable: &[],
    clinit: None,
    finalizer: None,
    element: None,
};

macro_rules! def_throwable_class {
    ($($ident:ident, $name:literal, $super:expr;)*) => {
        $(
            pub static $ident: ClassInfo = ClassInfo {
                access_flags: CLASS_ACC_PUBLIC,
                name: $name,
                super_class: Some($super),
                interfaces: &[],
                fields: &[],
                methods: &[],
                resolve: classloader::resolve_ordinary,
                class_size: BASE_CLASS_BLOCK_SIZE,
                instance_size: OBJ + PTR,
                static_fields: &[],
                instance_fields: &THROWABLE_INHERITED_FIELDS,
                vtable: &THROWABLE_VTABLE,
                itable: &[],
                clinit: None,
                finalizer: None,
                element: None,
            };
        )*
    };
}

def_throwable_class!(
    JAVA_LANG_EXCEPTION, "java/lang/Exception", &JAVA_LANG_THROWABLE;
    JAVA_LANG_ERROR, "java/lang/Error", &JAVA_LANG_THROWABLE;
    JAVA_LANG_RUNTIME_EXCEPTION, "java/lang/RuntimeException", &JAVA_LANG_EXCEPTION;
    JAVA_LANG_INTERRUPTED_EXCEPTION, "java/lang/InterruptedException", &JAVA_LANG_EXCEPTION;
    JAVA_LANG_NULL_POINTER_EXCEPTION, "java/lang/NullPointerException", &JAVA_LANG_RUNTIME_EXCEPTION;
    JAVA_LANG_ARITHMETIC_EXCEPTION, "java/lang/ArithmeticException", &JAVA_LANG_RUNTIME_EXCEPTION;
    JAVA_LANG_CLASS_CAST_EXCEPTION, "java/lang/ClassCastException", &JAVA_LANG_RUNTIME_EXCEPTION;
    JAVA_LANG_ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, "java/lang/ArrayIndexOutOfBoundsException", &JAVA_LANG_RUNTIME_EXCEPTION;
    JAVA_LANG_NEGATIVE_ARRAY_SIZE_EXCEPTION, "java/lang/NegativeArraySizeException", &JAVA_LANG_RUNTIME_EXCEPTION;
    JAVA_LANG_ARRAY_STORE_EXCEPTION, "java/lang/ArrayStoreException", &JAVA_LANG_RUNTIME_EXCEPTION;
    JAVA_LANG_ILLEGAL_MONITOR_STATE_EXCEPTION, "java/lang/IllegalMonitorStateException", &JAVA_LANG_RUNTIME_EXCEPTION;
    JAVA_LANG_INCOMPATIBLE_CLASS_CHANGE_ERROR, "java/lang/IncompatibleClassChangeError", &JAVA_LANG_ERROR;
    JAVA_LANG_NO_SUCH_FIELD_ERROR, "java/lang/NoSuchFieldError", &JAVA_LANG_INCOMPATIBLE_CLASS_CHANGE_ERROR;
    JAVA_LANG_ABSTRACT_METHOD_ERROR, "java/lang/AbstractMethodError", &JAVA_LANG_INCOMPATIBLE_CLASS_CHANGE_ERROR;
    JAVA_LANG_UNSATISFIED_LINK_ERROR, "java/lang/UnsatisfiedLinkError", &JAVA_LANG_ERROR;
    JAVA_LANG_NO_CLASS_DEF_FOUND_ERROR, "java/lang/NoClassDefFoundError", &JAVA_LANG_ERROR;
    JAVA_LANG_EXCEPTION_IN_INITIALIZER_ERROR, "java/lang/ExceptionInInitializerError", &JAVA_LANG_ERROR;
    JAVA_LANG_OUT_OF_MEMORY_ERROR, "java/lang/OutOfMemoryError", &JAVA_LANG_ERROR;
    JAVA_LANG_STACK_OVERFLOW_ERROR, "java/lang/StackOverflowError", &JAVA_LANG_ERROR;
);

//*********************************************************************************************************
// java/lang/Thread
//*********************************************************************************************************

pub const THREAD_NAME_OFFSET: usize = OBJ;
pub const THREAD_PRIORITY_OFFSET: usize = OBJ + PTR;
pub const THREAD_EETOP_OFFSET: usize = align_size_up(OBJ + PTR + 4, 8);

static THREAD_FIELDS: [FieldInfo; 3] = [
    FieldInfo {
        access_flags: 0,
        name: "name",
        descriptor: "Ljava/lang/String;",
    },
    FieldInfo {
        access_flags: 0,
        name: "priority",
        descriptor: "I",
    },
    FieldInfo {
        access_flags: 0,
        name: "eetop",
        descriptor: "J",
    },
];

static THREAD_INSTANCE_FIELDS: [PreResolvedInstanceField; 3] = [
    PreResolvedInstanceField {
        declaring: None,
        field_index: 0,
        offset: THREAD_NAME_OFFSET,
        is_reference: true,
    },
    PreResolvedInstanceField {
        declaring: None,
        field_index: 1,
        offset: THREAD_PRIORITY_OFFSET,
        is_reference: false,
    },
    PreResolvedInstanceField {
        declaring: None,
        field_index: 2,
        offset: THREAD_EETOP_OFFSET,
        is_reference: false,
    },
];

pub static JAVA_LANG_THREAD: ClassInfo = ClassInfo {
    access_flags: CLASS_ACC_PUBLIC,
    name: "java/lang/Thread",
    super_class: Some(&JAVA_LANG_OBJECT),
    interfaces: &[],
    fields: &THREAD_FIELDS,
    methods: &[],
    resolve: classloader::resolve_ordinary,
    class_size: BASE_CLASS_BLOCK_SIZE,
    instance_size: THREAD_EETOP_OFFSET + 8,
    static_fields: &[],
    instance_fields: &THREAD_INSTANCE_FIELDS,
    vtable: &[],
    itable: &[],
    clinit: None,
    finalizer: None,
    element: None,
};

//*********************************************************************************************************
// java/io/PrintStream
//*********************************************************************************************************

const PRINT_STREAM_FD_OFFSET: usize = OBJ;

static PRINTLN_NAMES: NativeNames = NativeNames {
    short_name: "Java_java_io_PrintStream_println",
    long_name: "Java_java_io_PrintStream_println__Ljava_lang_String_2",
};

static PRINT_NAMES: NativeNames = NativeNames {
    short_name: "Java_java_io_PrintStream_print",
    long_name: "Java_java_io_PrintStream_print__Ljava_lang_String_2",
};

/// Generated trampoline for a `(Ljava/lang/String;)V` native instance
/// method: java frame, argument transfer, native frame with handles, the
/// safe-region boundary, then the bound symbol.
fn native_call_string_void(thread: ThreadPtr, method: &'static MethodInfo) {
    let frame = Frame::push_java(thread, Some(method), 0, 2);
    bytecode::prepare_arguments(frame, 2);
    bytecode::check_objref(thread, frame);
    if exception::occurred(thread) {
        Frame::pop(thread);
        return;
    }
    let symbol = match native::bind_method(thread, method) {
        Some(s) => s,
        None => {
            Frame::pop(thread);
            return;
        }
    };
    let this_obj = frame.java().locals.get(0).expect_object();
    let arg_obj = frame.java().locals.get(1).expect_object();

    Frame::push_native(thread);
    let this_handle = native::get_local_ref(thread, this_obj);
    let arg_handle = native::get_local_ref(thread, arg_obj);
    native::enter_jni(thread);
    let entry: extern "C" fn(RawJniEnv, jobject, jobject) =
        unsafe { std::mem::transmute(symbol.0) };
    entry(native::env_of(thread), this_handle, arg_handle);
    native::exit_jni(thread);
    Frame::pop(thread); // native frame, reclaiming the reference tables
    Frame::pop(thread); // java frame
}

fn java_io_print_stream_println(thread: ThreadPtr) {
    native_call_string_void(thread, &PRINT_STREAM_METHODS[0]);
}

fn java_io_print_stream_print(thread: ThreadPtr) {
    native_call_string_void(thread, &PRINT_STREAM_METHODS[1]);
}

fn print_stream_write(env: RawJniEnv, this: jobject, s: jobject, newline: bool) {
    let thread = native::thread_of(env);
    native::exit_jni(thread);
    let stream = native::dereference(thread, this);
    debug_assert!(stream.is_not_null());
    let fd: Ptr<JInt> = stream.cast::<u8>().offset(PRINT_STREAM_FD_OFFSET as isize).cast();
    let fd = *fd.as_ref();
    let str_obj = native::dereference(thread, s);
    let text = if str_obj.is_null() {
        "null".to_string()
    } else {
        string_pool::java_string_to_rust(str_obj)
    };
    native::enter_jni(thread);

    use std::io::Write;
    if fd == 2 {
        let mut err = std::io::stderr();
        if newline {
            let _ = writeln!(err, "{}", text);
        } else {
            let _ = write!(err, "{}", text);
        }
        let _ = err.flush();
    } else {
        let mut out = std::io::stdout();
        if newline {
            let _ = writeln!(out, "{}", text);
        } else {
            let _ = write!(out, "{}", text);
        }
        let _ = out.flush();
    }
}

extern "C" fn builtin_print_stream_println(env: RawJniEnv, this: jobject, s: jobject) {
    print_stream_write(env, this, s, true);
}

extern "C" fn builtin_print_stream_print(env: RawJniEnv, this: jobject, s: jobject) {
    print_stream_write(env, this, s, false);
}

static PRINT_STREAM_METHODS: [MethodInfo; 2] = [
    MethodInfo {
        access_flags: METHOD_ACC_PUBLIC | METHOD_ACC_NATIVE,
        name: "println",
        descriptor: "(Ljava/lang/String;)V",
        code: Some(MethodRoutine::Void(java_io_print_stream_println)),
        native: Some(&PRINTLN_NAMES),
    },
    MethodInfo {
        access_flags: METHOD_ACC_PUBLIC | METHOD_ACC_NATIVE,
        name: "print",
        descriptor: "(Ljava/lang/String;)V",
        code: Some(MethodRoutine::Void(java_io_print_stream_print)),
        native: Some(&PRINT_NAMES),
    },
];

static PRINT_STREAM_VTABLE: [VTableEntry; 2] = [
    VTableEntry {
        declaring: &JAVA_IO_PRINT_STREAM,
        method: &PRINT_STREAM_METHODS[0],
    },
    VTableEntry {
        declaring: &JAVA_IO_PRINT_STREAM,
        method: &PRINT_STREAM_METHODS[1],
    },
];

static PRINT_STREAM_FIELDS: [FieldInfo; 1] = [FieldInfo {
    access_flags: 0,
    name: "fd",
    descriptor: "I",
}];

static PRINT_STREAM_INSTANCE_FIELDS: [PreResolvedInstanceField; 1] = [PreResolvedInstanceField {
    declaring: None,
    field_index: 0,
    offset: PRINT_STREAM_FD_OFFSET,
    is_reference: false,
}];

pub static JAVA_IO_PRINT_STREAM: ClassInfo = ClassInfo {
    access_flags: CLASS_ACC_PUBLIC,
    name: "java/io/PrintStream",
    super_class: Some(&JAVA_LANG_OBJECT),
    interfaces: &[],
    fields: &PRINT_STREAM_FIELDS,
    methods: &PRINT_STREAM_METHODS,
    resolve: classloader::resolve_ordinary,
    class_size: BASE_CLASS_BLOCK_SIZE,
    instance_size: OBJ + 8,
    static_fields: &[],
    instance_fields: &PRINT_STREAM_INSTANCE_FIELDS,
    vtable: &PRINT_STREAM_VTABLE,
    itable: &[],
    clinit: None,
    finalizer: None,
    element: None,
};

/// Translator-assigned vtable slots, for callers that dispatch virtually.
pub const PRINT_STREAM_VTABLE_PRINTLN: u16 = 0;
pub const PRINT_STREAM_VTABLE_PRINT: u16 = 1;

//*********************************************************************************************************
// java/lang/System
//*********************************************************************************************************

fn java_lang_system_initialize(thread: ThreadPtr) {
    let frame = Frame::push_java(thread, Some(&SYSTEM_METHODS[0]), 3, 0);

    // System.out = new PrintStream(1)
    bytecode::new_instance(thread, frame, &JAVA_IO_PRINT_STREAM);
    if exception::occurred(thread) {
        Frame::pop(thread);
        return;
    }
    {
        let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
        stack.dup();
        stack.push_int(1);
        bytecode::putfield_int(thread, stack, &JAVA_IO_PRINT_STREAM, 0);
    }
    bytecode::putstatic_object(thread, frame, &JAVA_LANG_SYSTEM, 0);

    // System.err = new PrintStream(2)
    bytecode::new_instance(thread, frame, &JAVA_IO_PRINT_STREAM);
    if exception::occurred(thread) {
        Frame::pop(thread);
        return;
    }
    {
        let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
        stack.dup();
        stack.push_int(2);
        bytecode::putfield_int(thread, stack, &JAVA_IO_PRINT_STREAM, 0);
    }
    bytecode::putstatic_object(thread, frame, &JAVA_LANG_SYSTEM, 1);

    bytecode::vreturn(thread, frame);
}

static SYSTEM_METHODS: [MethodInfo; 1] = [MethodInfo {
    access_flags: METHOD_ACC_PUBLIC | METHOD_ACC_STATIC,
    name: "initializeSystemClass",
    descriptor: "()V",
    code: Some(MethodRoutine::Void(java_lang_system_initialize)),
    native: None,
}];

static SYSTEM_FIELDS: [FieldInfo; 2] = [
    FieldInfo {
        access_flags: FIELD_ACC_STATIC | FIELD_ACC_FINAL,
        name: "out",
        descriptor: "Ljava/io/PrintStream;",
    },
    FieldInfo {
        access_flags: FIELD_ACC_STATIC | FIELD_ACC_FINAL,
        name: "err",
        descriptor: "Ljava/io/PrintStream;",
    },
];

static SYSTEM_STATIC_FIELDS: [PreResolvedStaticField; 2] = [
    PreResolvedStaticField {
        field_index: 0,
        offset: BASE_CLASS_BLOCK_SIZE,
        is_reference: true,
    },
    PreResolvedStaticField {
        field_index: 1,
        offset: BASE_CLASS_BLOCK_SIZE + PTR,
        is_reference: true,
    },
];

pub static JAVA_LANG_SYSTEM: ClassInfo = ClassInfo {
    access_flags: CLASS_ACC_PUBLIC | CLASS_ACC_FINAL,
    name: "java/lang/System",
    super_class: Some(&JAVA_LANG_OBJECT),
    interfaces: &[],
    fields: &SYSTEM_FIELDS,
    methods: &SYSTEM_METHODS,
    resolve: classloader::resolve_ordinary,
    class_size: BASE_CLASS_BLOCK_SIZE + 2 * PTR,
    instance_size: OBJ,
    static_fields: &SYSTEM_STATIC_FIELDS,
    instance_fields: &[],
    vtable: &[],
    itable: &[],
    clinit: None,
    finalizer: None,
    element: None,
};

/// Static-field slots of java/lang/System.
pub const SYSTEM_STATIC_OUT: u16 = 0;
pub const SYSTEM_STATIC_ERR: u16 = 1;

//*********************************************************************************************************
// Registry
//*********************************************************************************************************

static REGISTRY: [ClassInfoRef; 28] = [
    &JAVA_LANG_OBJECT,
    &JAVA_LANG_CLASS,
    &JAVA_LANG_STRING,
    &JAVA_LANG_CLONEABLE,
    &JAVA_IO_SERIALIZABLE,
    &JAVA_LANG_THROWABLE,
    &JAVA_LANG_EXCEPTION,
    &JAVA_LANG_ERROR,
    &JAVA_LANG_RUNTIME_EXCEPTION,
    &JAVA_LANG_INTERRUPTED_EXCEPTION,
    &JAVA_LANG_NULL_POINTER_EXCEPTION,
    &JAVA_LANG_ARITHMETIC_EXCEPTION,
    &JAVA_LANG_CLASS_CAST_EXCEPTION,
    &JAVA_LANG_ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION,
    &JAVA_LANG_NEGATIVE_ARRAY_SIZE_EXCEPTION,
    &JAVA_LANG_ARRAY_STORE_EXCEPTION,
    &JAVA_LANG_ILLEGAL_MONITOR_STATE_EXCEPTION,
    &JAVA_LANG_INCOMPATIBLE_CLASS_CHANGE_ERROR,
    &JAVA_LANG_NO_SUCH_FIELD_ERROR,
    &JAVA_LANG_ABSTRACT_METHOD_ERROR,
    &JAVA_LANG_UNSATISFIED_LINK_ERROR,
    &JAVA_LANG_NO_CLASS_DEF_FOUND_ERROR,
    &JAVA_LANG_EXCEPTION_IN_INITIALIZER_ERROR,
    &JAVA_LANG_OUT_OF_MEMORY_ERROR,
    &JAVA_LANG_STACK_OVERFLOW_ERROR,
    &JAVA_LANG_THREAD,
    &JAVA_IO_PRINT_STREAM,
    &JAVA_LANG_SYSTEM,
];

pub fn registry() -> &'static [ClassInfoRef] {
    &REGISTRY
}

pub fn register_builtins(state: &mut NativeState) {
    state.register_builtin(
        PRINTLN_NAMES.short_name,
        NativeSymbol(builtin_print_stream_println as *const ()),
    );
    state.register_builtin(
        PRINT_NAMES.short_name,
        NativeSymbol(builtin_print_stream_print as *const ()),
    );
}
