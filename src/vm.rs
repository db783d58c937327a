//! The top-level runtime handle: configuration, the bootstrap sequence, and
//! the process entry helpers the translator's `main` calls into.

use crate::bytecode;
use crate::classloader::{self, BootstrapClassLoader};
use crate::exception;
use crate::memory::heap::{Heap, HeapConfig};
use crate::memory::{Address, MB};
use crate::metadata::{ClassInfoRef, MethodRoutine};
use crate::native::NativeState;
use crate::object::prelude::*;
use crate::object::{JavaArray, Object};
use crate::os;
use crate::rt;
use crate::stack::Frame;
use crate::string_pool::StringPool;
use crate::thread::{self, ThreadList, ThreadPtr, VMThreadContext};
use crate::{metadata, string_pool};

pub type VMPtr = Ptr<VM>;

pub struct VMConfig {
    /// Translator-emitted class registry, appended to the built-in core.
    pub registry: &'static [ClassInfoRef],
    /// Translator-emitted string constant literals.
    pub string_constants: &'static [&'static str],
    pub heap: HeapConfig,
    pub main_class: String,
    pub stack_size: usize,
}

impl Default for VMConfig {
    fn default() -> Self {
        VMConfig {
            registry: &[],
            string_constants: &[],
            heap: HeapConfig::default(),
            main_class: "Main".to_string(),
            stack_size: 2 * MB,
        }
    }
}

#[derive(Debug)]
pub enum VMError {
    InitError(String),
    RuntimeError(String),
}

pub struct VM {
    pub config: VMConfig,
    pub heap: Heap,
    pub class_loader: BootstrapClassLoader,
    pub string_pool: StringPool,
    pub native_state: NativeState,
    pub threads: ThreadList,
}

impl VM {
    /// Create the runtime handle. The VM lives until process exit; a failed
    /// heap reservation at bootstrap is fatal.
    pub fn new(config: VMConfig) -> VMPtr {
        os::init();
        let heap = match Heap::create(&config.heap) {
            Some(heap) => heap,
            None => {
                eprintln!("aotvm: unable to reserve the heap");
                std::process::abort();
            }
        };

        let mut registry: Vec<ClassInfoRef> = Vec::new();
        registry.extend_from_slice(rt::registry());
        registry.extend_from_slice(config.registry);

        let string_pool = StringPool::new(config.string_constants);

        let vm = Box::new(VM {
            config,
            heap,
            class_loader: BootstrapClassLoader::new(registry),
            string_pool,
            native_state: NativeState::new(),
            threads: ThreadList::new(),
        });
        let vm = VMPtr::new(Box::into_raw(vm));
        vm.as_mut_ref().heap.set_vm(vm);
        return vm;
    }

    /// Create a context for the calling OS thread, bind it, register it with
    /// the managed list and give it a root native frame.
    pub fn attach_current_thread(vm: VMPtr) -> ThreadPtr {
        let ctx = VMThreadContext::create(vm);
        thread::attach(ctx);
        thread::managed_add(vm, ctx);
        crate::native::make_root_frame(ctx);
        return ctx;
    }

    pub fn detach_current_thread(vm: VMPtr, ctx: ThreadPtr) {
        ctx.as_mut_ref().tlab.retire(&vm.as_ref().heap);
        while ctx.top_frame.is_not_null() {
            Frame::pop(ctx);
        }
        thread::managed_remove(vm, ctx);
    }

    /// Bootstrap order: native tables, the essential classes (with the
    /// Class-instance fixup), the filler array class, the GC thread, and the
    /// main thread's java/lang/Thread object.
    pub fn init(&mut self, thread: ThreadPtr) -> Result<(), VMError> {
        self.native_state.init();
        rt::register_builtins(&mut self.native_state);

        self.class_loader
            .bootstrap(thread)
            .map_err(VMError::InitError)?;

        let int_array = self.class_loader.find_class(thread, "[I");
        if int_array.is_null() {
            return Err(VMError::InitError("unable to create [I".to_string()));
        }
        self.heap.set_filler_class(int_array);

        self.heap.start_gc_thread(thread.vm());

        self.init_main_thread(thread)?;
        return Ok(());
    }

    /// Create the main thread's java/lang/Thread object before any Java code
    /// runs, wiring eetop to the context and priority to NORM_PRIORITY.
    fn init_main_thread(&mut self, thread: ThreadPtr) -> Result<(), VMError> {
        let clazz = classloader::get_class_by_name_init(thread, "java/lang/Thread");
        if clazz.is_null() {
            exception::clear(thread);
            return Err(VMError::InitError("unable to init java/lang/Thread".to_string()));
        }
        let obj = classloader::alloc_instance(thread, clazz);
        if obj.is_null() {
            exception::clear(thread);
            return Err(VMError::InitError("unable to allocate main Thread".to_string()));
        }
        thread.as_mut_ref().current_thread = obj;

        let eetop: Ptr<JLong> = obj.cast::<u8>().offset(rt::THREAD_EETOP_OFFSET as isize).cast();
        *eetop.as_mut_ref() = thread.as_usize() as JLong;
        let priority: Ptr<JInt> = obj.cast::<u8>().offset(rt::THREAD_PRIORITY_OFFSET as isize).cast();
        *priority.as_mut_ref() = 5; // java.lang.Thread#NORM_PRIORITY

        let name = string_pool::create_string(thread, "main");
        if name.is_not_null() {
            // current_thread is a GC root; re-read it in case the Thread
            // object moved while the name was built.
            let obj = thread.current_thread;
            Object::write_ref(obj, rt::THREAD_NAME_OFFSET, name);
            self.heap
                .write_barrier(Object::field_addr(obj, rt::THREAD_NAME_OFFSET), obj.as_address(), name);
        }
        return Ok(());
    }

    /// Run `java.lang.System.initializeSystemClass`, resolve the user main
    /// class, and invoke `main([Ljava/lang/String;)V`. Exit code 0 on clean
    /// return, nonzero when anything failed; an uncaught exception prints a
    /// stack trace via its own printStackTrace.
    pub fn run_main(&mut self, thread: ThreadPtr, args: &[String]) -> i32 {
        // A java frame to anchor arguments and catch nothing.
        let frame = Frame::push_java(thread, None, 2, 0);

        let system = classloader::get_class_by_name_init(thread, "java/lang/System");
        if system.is_null() {
            return self.report_failure(thread, "could not initialize java/lang/System");
        }
        match classloader::method_find(system.info.as_ref(), "initializeSystemClass", "()V") {
            Some(m) => {
                thread.as_mut_ref().calling_class = system;
                match m.code {
                    Some(routine) => bytecode::invoke_routine(thread, frame, routine),
                    None => return self.report_failure(thread, "initializeSystemClass has no body"),
                }
            }
            None => return self.report_failure(thread, "initializeSystemClass not found"),
        }
        if exception::occurred(thread) {
            return self.report_uncaught(thread, frame);
        }

        let main_class_name = self.config.main_class.replace('.', "/");
        let main_class = classloader::get_class_by_name_init(thread, &main_class_name);
        if main_class.is_null() {
            exception::clear(thread);
            eprintln!("Error: Could not find or load main class {}", self.config.main_class);
            Frame::pop(thread);
            return 1;
        }

        let main_method = match classloader::method_find(
            main_class.info.as_ref(),
            "main",
            "([Ljava/lang/String;)V",
        ) {
            Some(m) => m,
            None => {
                eprintln!(
                    "Error: Main method not found in class {}, please define the main method as:\n   public static void main(String[] args)",
                    self.config.main_class
                );
                Frame::pop(thread);
                return 1;
            }
        };

        // String[] args.
        let arg_array = bytecode::array_new(thread, "[Ljava/lang/String;", args.len() as JInt);
        if arg_array.is_null() {
            return self.report_uncaught(thread, frame);
        }
        frame.as_mut_ref().java_mut().operand_stack.push_object(arg_array.cast());
        for (i, arg) in args.iter().enumerate() {
            let s = string_pool::create_string(thread, arg);
            if s.is_null() {
                return self.report_uncaught(thread, frame);
            }
            // The array may have moved while the string was allocated.
            let arr: JArrayPtr = frame.java().operand_stack.peek(1).expect_object().cast();
            let slot = JavaArray::element_at(arr, metadata::BasicType::Object, i);
            unsafe {
                *(slot.as_mut_raw_ptr() as *mut ObjectPtr) = s;
            }
            self.heap.write_barrier(slot, arr.as_address(), s);
        }

        match main_method.code {
            Some(routine @ MethodRoutine::Void(_)) => {
                bytecode::invoke_static(thread, frame, main_class.info.as_ref(), routine);
            }
            _ => {
                eprintln!("Error: malformed main method in {}", self.config.main_class);
                Frame::pop(thread);
                return 1;
            }
        }

        if exception::occurred(thread) {
            return self.report_uncaught(thread, frame);
        }
        Frame::pop(thread);
        return 0;
    }

    fn report_failure(&self, thread: ThreadPtr, message: &str) -> i32 {
        eprintln!("aotvm: {}", message);
        if exception::occurred(thread) {
            exception::clear(thread);
        }
        Frame::pop(thread);
        return 1;
    }

    /// Print the pending exception through its virtual printStackTrace.
    fn report_uncaught(&mut self, thread: ThreadPtr, anchor: crate::stack::FramePtr) -> i32 {
        let ex = exception::clear(thread);
        eprintln!("Exception in thread \"main\"");
        if ex.is_not_null() {
            self.print_throwable(thread, ex);
        }
        Frame::pop_deeper(thread, anchor);
        Frame::pop(thread);
        return 1;
    }

    fn print_throwable(&mut self, thread: ThreadPtr, ex: ObjectPtr) {
        let frame = Frame::push_java(thread, None, 1, 0);
        frame.as_mut_ref().java_mut().operand_stack.push_object(ex);
        let info = Object::class_of(ex).info.as_ref();
        match classloader::vtable_find(info, "printStackTrace", "()V") {
            Some(index) => {
                bytecode::invoke_virtual(thread, frame, 1, info, index);
            }
            None => {
                eprintln!("{}", crate::metadata::pretty_descriptor(info.name));
            }
        }
        if exception::occurred(thread) {
            // A failure while printing is terminal; drop it.
            exception::clear(thread);
        }
        Frame::pop(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classloader::{self, get_class_init};
    use crate::exception;
    use crate::metadata::*;
    use crate::monitor;
    use crate::object::class::{class_assignable, ClassState};
    use crate::object::Object;
    use crate::rt;
    use crate::stack::Frame;
    use crate::string_pool;
    use crate::test_support::{run_default, run_in_vm, spawn_java_thread};
    use crate::thread::ThreadPtr;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OBJ: usize = std::mem::size_of::<crate::object::ObjectHeader>();

    //*****************************************************************************************************
    // Class-lifecycle images
    //*****************************************************************************************************

    static INIT_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn base_clinit_record(name: &'static str) {
        INIT_ORDER.lock().push(name);
    }

    fn clinit_b(_thread: ThreadPtr) {
        base_clinit_record("B");
    }

    fn clinit_a(_thread: ThreadPtr) {
        base_clinit_record("A");
    }

    static CLASS_B: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "B",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &[],
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: Some(clinit_b),
        finalizer: None,
        element: None,
    };

    static CLASS_A: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "A",
        super_class: Some(&CLASS_B),
        interfaces: &[],
        fields: &[],
        methods: &[],
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: Some(clinit_a),
        finalizer: None,
        element: None,
    };

    static SLOW_INIT_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn clinit_slow(_thread: ThreadPtr) {
        std::thread::sleep(std::time::Duration::from_millis(50));
        SLOW_INIT_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    static CLASS_SLOW: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Slow",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &[],
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: Some(clinit_slow),
        finalizer: None,
        element: None,
    };

    static RECURSIVE_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn clinit_recursive(thread: ThreadPtr) {
        RECURSIVE_RUNS.fetch_add(1, Ordering::SeqCst);
        // A recursive request from the initializing thread completes
        // normally without re-running <clinit>.
        let clazz = get_class_init(thread, &CLASS_RECURSIVE);
        assert!(clazz.is_not_null());
    }

    static CLASS_RECURSIVE: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Recursive",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &[],
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: Some(clinit_recursive),
        finalizer: None,
        element: None,
    };

    static FAILING_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn clinit_failing(thread: ThreadPtr) {
        FAILING_RUNS.fetch_add(1, Ordering::SeqCst);
        exception::set_new(thread, &rt::JAVA_LANG_RUNTIME_EXCEPTION, "clinit failure");
    }

    static CLASS_FAILING: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Failing",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &[],
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: Some(clinit_failing),
        finalizer: None,
        element: None,
    };

    static CLASS_FAILING_SUB: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "FailingSub",
        super_class: Some(&CLASS_FAILING),
        interfaces: &[],
        fields: &[],
        methods: &[],
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    //*****************************************************************************************************
    // Dispatch images: class Animal { int speak() { return 1; } }
    //                  class Dog extends Animal { int speak() { return 2; } }
    //*****************************************************************************************************

    fn animal_speak(thread: ThreadPtr) -> JInt {
        let frame = Frame::push_java(thread, Some(&ANIMAL_METHODS[0]), 1, 1);
        crate::bytecode::prepare_arguments(frame, 1);
        crate::bytecode::check_objref(thread, frame);
        let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
        stack.push_int(1);
        return crate::bytecode::ireturn(thread, frame);
    }

    fn dog_speak(thread: ThreadPtr) -> JInt {
        let frame = Frame::push_java(thread, Some(&DOG_METHODS[0]), 1, 1);
        crate::bytecode::prepare_arguments(frame, 1);
        crate::bytecode::check_objref(thread, frame);
        let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
        stack.push_int(2);
        return crate::bytecode::ireturn(thread, frame);
    }

    static ANIMAL_METHODS: [MethodInfo; 1] = [MethodInfo {
        access_flags: METHOD_ACC_PUBLIC,
        name: "speak",
        descriptor: "()I",
        code: Some(MethodRoutine::Int(animal_speak)),
        native: None,
    }];

    static ANIMAL_VTABLE: [VTableEntry; 1] = [VTableEntry {
        declaring: &CLASS_ANIMAL,
        method: &ANIMAL_METHODS[0],
    }];

    static CLASS_ANIMAL: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Animal",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &ANIMAL_METHODS,
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &ANIMAL_VTABLE,
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    static DOG_METHODS: [MethodInfo; 1] = [MethodInfo {
        access_flags: METHOD_ACC_PUBLIC,
        name: "speak",
        descriptor: "()I",
        code: Some(MethodRoutine::Int(dog_speak)),
        native: None,
    }];

    static DOG_VTABLE: [VTableEntry; 1] = [VTableEntry {
        declaring: &CLASS_DOG,
        method: &DOG_METHODS[0],
    }];

    static CLASS_DOG: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Dog",
        super_class: Some(&CLASS_ANIMAL),
        interfaces: &[],
        fields: &[],
        methods: &DOG_METHODS,
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &DOG_VTABLE,
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    //*****************************************************************************************************
    // Interface images: interface Greeter { default int greet() { return 1; } }
    //                   class Silent implements Greeter {}
    //                   class Loud implements Greeter { int greet() { return 2; } }
    //*****************************************************************************************************

    fn greeter_default_greet(thread: ThreadPtr) -> JInt {
        let frame = Frame::push_java(thread, Some(&GREETER_METHODS[0]), 1, 1);
        crate::bytecode::prepare_arguments(frame, 1);
        crate::bytecode::check_objref(thread, frame);
        let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
        stack.push_int(1);
        return crate::bytecode::ireturn(thread, frame);
    }

    static GREETER_METHODS: [MethodInfo; 1] = [MethodInfo {
        access_flags: METHOD_ACC_PUBLIC,
        name: "greet",
        descriptor: "()I",
        code: Some(MethodRoutine::Int(greeter_default_greet)),
        native: None,
    }];

    static GREETER_IFACES: [ClassInfoRef; 1] = [&IFACE_GREETER];

    static IFACE_GREETER: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC | CLASS_ACC_INTERFACE | CLASS_ACC_ABSTRACT,
        name: "Greeter",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &GREETER_METHODS,
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: 0,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    static CLASS_SILENT: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Silent",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &GREETER_IFACES,
        fields: &[],
        methods: &[],
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    fn loud_greet(thread: ThreadPtr) -> JInt {
        let frame = Frame::push_java(thread, Some(&LOUD_METHODS[0]), 1, 1);
        crate::bytecode::prepare_arguments(frame, 1);
        crate::bytecode::check_objref(thread, frame);
        let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
        stack.push_int(2);
        return crate::bytecode::ireturn(thread, frame);
    }

    static LOUD_METHODS: [MethodInfo; 1] = [MethodInfo {
        access_flags: METHOD_ACC_PUBLIC,
        name: "greet",
        descriptor: "()I",
        code: Some(MethodRoutine::Int(loud_greet)),
        native: None,
    }];

    static LOUD_VTABLE: [VTableEntry; 1] = [VTableEntry {
        declaring: &CLASS_LOUD,
        method: &LOUD_METHODS[0],
    }];

    static LOUD_ITABLE_METHODS: [ITableMethod; 1] = [ITableMethod {
        method_index: 0,
        vtable_index: 0,
    }];

    static LOUD_ITABLE: [ITableEntry; 1] = [ITableEntry {
        interface: &IFACE_GREETER,
        methods: &LOUD_ITABLE_METHODS,
    }];

    static CLASS_LOUD: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Loud",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &GREETER_IFACES,
        fields: &[],
        methods: &LOUD_METHODS,
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &LOUD_VTABLE,
        itable: &LOUD_ITABLE,
        clinit: None,
        finalizer: None,
        element: None,
    };

    static TEST_REGISTRY: [ClassInfoRef; 10] = [
        &CLASS_B,
        &CLASS_A,
        &CLASS_SLOW,
        &CLASS_RECURSIVE,
        &CLASS_FAILING,
        &CLASS_FAILING_SUB,
        &CLASS_ANIMAL,
        &CLASS_DOG,
        &IFACE_GREETER,
        &CLASS_SILENT,
    ];

    fn test_config() -> VMConfig {
        let mut cfg = VMConfig::default();
        cfg.registry = &TEST_REGISTRY;
        cfg.string_constants = &["hello", "world"];
        return cfg;
    }

    //*****************************************************************************************************
    // Lifecycle tests
    //*****************************************************************************************************

    #[test]
    fn superclass_initializes_before_subclass() {
        run_in_vm(test_config(), |_, thread| {
            INIT_ORDER.lock().clear();
            let a = get_class_init(thread, &CLASS_A);
            assert!(a.is_not_null());
            assert_eq!(a.state, ClassState::Initialized);
            assert_eq!(a.super_class.state, ClassState::Initialized);
            assert_eq!(*INIT_ORDER.lock(), vec!["B", "A"]);

            // A second request is a no-op.
            let again = get_class_init(thread, &CLASS_A);
            assert!(again == a);
            assert_eq!(*INIT_ORDER.lock(), vec!["B", "A"]);
        });
    }

    #[test]
    fn concurrent_initialization_runs_clinit_once() {
        run_in_vm(test_config(), |vm, thread| {
            SLOW_INIT_RUNS.store(0, Ordering::SeqCst);
            let mut handles = Vec::new();
            for _ in 0..4 {
                handles.push(spawn_java_thread(vm, |t| {
                    let clazz = get_class_init(t, &CLASS_SLOW);
                    assert!(clazz.is_not_null());
                    assert_eq!(clazz.state, ClassState::Initialized);
                }));
            }
            let clazz = get_class_init(thread, &CLASS_SLOW);
            assert!(clazz.is_not_null());
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(SLOW_INIT_RUNS.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn recursive_clinit_does_not_deadlock() {
        run_in_vm(test_config(), |_, thread| {
            RECURSIVE_RUNS.store(0, Ordering::SeqCst);
            let clazz = get_class_init(thread, &CLASS_RECURSIVE);
            assert!(clazz.is_not_null());
            assert_eq!(clazz.state, ClassState::Initialized);
            assert_eq!(RECURSIVE_RUNS.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn failed_superclass_clinit_poisons_subclass() {
        run_in_vm(test_config(), |_, thread| {
            FAILING_RUNS.store(0, Ordering::SeqCst);
            let sub = get_class_init(thread, &CLASS_FAILING_SUB);
            assert!(sub.is_null());
            assert!(exception::occurred(thread));
            let ex = exception::clear(thread);
            // The failure was wrapped for the JLS 5.5 step-11 rethrow.
            assert_eq!(
                Object::class_of(ex).name(),
                "java/lang/ExceptionInInitializerError"
            );

            // Subsequent attempts fail without re-running <clinit>.
            let again = get_class_init(thread, &CLASS_FAILING_SUB);
            assert!(again.is_null());
            exception::clear(thread);
            assert_eq!(FAILING_RUNS.load(Ordering::SeqCst), 1);

            let vm = thread.vm();
            let failing = vm.as_ref().class_loader.get_loaded(&CLASS_FAILING);
            assert_eq!(failing.state, ClassState::Error);
        });
    }

    //*****************************************************************************************************
    // Dispatch tests
    //*****************************************************************************************************

    #[test]
    fn virtual_dispatch_selects_the_override() {
        run_in_vm(test_config(), |_, thread| {
            let dog_class = get_class_init(thread, &CLASS_DOG);
            assert!(dog_class.is_not_null());

            let frame = Frame::push_java(thread, None, 2, 0);
            let dog = classloader::alloc_instance(thread, dog_class);
            frame.as_mut_ref().java_mut().operand_stack.push_object(dog);

            // ((Animal) dog).speak() dispatches to Dog.speak.
            crate::bytecode::invoke_virtual(thread, frame, 1, &CLASS_ANIMAL, 0);
            assert!(!exception::occurred(thread));
            assert_eq!(frame.as_mut_ref().java_mut().operand_stack.pop_int(), 2);

            // An Animal receiver uses the base implementation.
            let animal_class = get_class_init(thread, &CLASS_ANIMAL);
            let animal = classloader::alloc_instance(thread, animal_class);
            frame.as_mut_ref().java_mut().operand_stack.push_object(animal);
            crate::bytecode::invoke_virtual(thread, frame, 1, &CLASS_ANIMAL, 0);
            assert_eq!(frame.as_mut_ref().java_mut().operand_stack.pop_int(), 1);

            Frame::pop(thread);
        });
    }

    #[test]
    fn virtual_dispatch_on_null_raises_npe() {
        run_in_vm(test_config(), |_, thread| {
            let frame = Frame::push_java(thread, None, 2, 0);
            frame.as_mut_ref().java_mut().operand_stack.push_object(crate::ObjectPtr::null());
            crate::bytecode::invoke_virtual(thread, frame, 1, &CLASS_ANIMAL, 0);
            assert!(exception::occurred(thread));
            let ex = exception::clear(thread);
            assert_eq!(
                Object::class_of(ex).name(),
                "java/lang/NullPointerException"
            );
            Frame::pop(thread);
        });
    }

    #[test]
    fn interface_dispatch_uses_default_body_when_unimplemented() {
        run_in_vm(test_config(), |_, thread| {
            let silent_class = get_class_init(thread, &CLASS_SILENT);
            let frame = Frame::push_java(thread, None, 2, 0);
            let silent = classloader::alloc_instance(thread, silent_class);
            frame.as_mut_ref().java_mut().operand_stack.push_object(silent);
            crate::bytecode::invoke_interface(thread, frame, 1, &IFACE_GREETER, 0);
            assert!(!exception::occurred(thread));
            assert_eq!(frame.as_mut_ref().java_mut().operand_stack.pop_int(), 1);
            Frame::pop(thread);
        });
    }

    #[test]
    fn interface_dispatch_prefers_the_itable() {
        run_in_vm(test_config(), |_, thread| {
            let loud_class = get_class_init(thread, &CLASS_LOUD);
            let frame = Frame::push_java(thread, None, 2, 0);
            let loud = classloader::alloc_instance(thread, loud_class);
            frame.as_mut_ref().java_mut().operand_stack.push_object(loud);
            crate::bytecode::invoke_interface(thread, frame, 1, &IFACE_GREETER, 0);
            assert!(!exception::occurred(thread));
            assert_eq!(frame.as_mut_ref().java_mut().operand_stack.pop_int(), 2);
            Frame::pop(thread);
        });
    }

    //*****************************************************************************************************
    // Exceptions
    //*****************************************************************************************************

    #[test]
    fn athrow_and_handler_matching() {
        run_in_vm(test_config(), |_, thread| {
            let frame = Frame::push_java(thread, None, 2, 0);
            frame
                .as_mut_ref()
                .push_handler(0, 10, 99, Some(&rt::JAVA_LANG_RUNTIME_EXCEPTION));
            crate::bytecode::label(frame, 5);

            let ex = exception::new_throwable(thread, &rt::JAVA_LANG_NULL_POINTER_EXCEPTION, "oops");
            frame.as_mut_ref().java_mut().operand_stack.push_object(ex);
            crate::bytecode::athrow(thread, &mut frame.as_mut_ref().java_mut().operand_stack);
            assert!(exception::occurred(thread));

            // NullPointerException is assignable to the RuntimeException
            // handler covering label 5.
            let target = exception::catch_in_frame(thread, frame);
            assert_eq!(target, Some(99));
            assert!(!exception::occurred(thread));
            let caught = frame.as_mut_ref().java_mut().operand_stack.pop_object();
            assert!(caught == ex || Object::class_of(caught).name() == "java/lang/NullPointerException");

            // Outside the covered range nothing matches.
            crate::bytecode::label(frame, 50);
            exception::set(thread, caught);
            assert_eq!(exception::catch_in_frame(thread, frame), None);
            assert!(exception::occurred(thread));
            exception::clear(thread);

            Frame::pop(thread);
        });
    }

    #[test]
    fn uncaught_exception_carries_its_message() {
        run_in_vm(test_config(), |_, thread| {
            let ex = exception::new_throwable(thread, &rt::JAVA_LANG_RUNTIME_EXCEPTION, "boom");
            assert!(ex.is_not_null());
            exception::set(thread, ex);

            assert!(exception::occurred(thread));
            let pending = exception::clear(thread);
            let message = Object::read_ref(pending, OBJ);
            assert_eq!(string_pool::java_string_to_rust(message), "boom");
        });
    }

    #[test]
    fn checkcast_and_instanceof() {
        run_in_vm(test_config(), |_, thread| {
            let dog_class = get_class_init(thread, &CLASS_DOG);
            let frame = Frame::push_java(thread, None, 2, 0);
            let stack = &mut frame.as_mut_ref().java_mut().operand_stack;

            let dog = classloader::alloc_instance(thread, dog_class);
            stack.push_object(dog);
            crate::bytecode::instanceof(stack, &CLASS_ANIMAL);
            assert_eq!(stack.pop_int(), 1);

            // instanceof on null is false; checkcast on null succeeds.
            stack.push_object(crate::ObjectPtr::null());
            crate::bytecode::instanceof(stack, &CLASS_ANIMAL);
            assert_eq!(stack.pop_int(), 0);
            stack.push_object(crate::ObjectPtr::null());
            crate::bytecode::checkcast(thread, stack, &CLASS_ANIMAL);
            assert!(!exception::occurred(thread));
            stack.pop_object();

            // A failing checkcast raises ClassCastException.
            let animal_class = get_class_init(thread, &CLASS_ANIMAL);
            let animal = classloader::alloc_instance(thread, animal_class);
            stack.push_object(animal);
            crate::bytecode::checkcast(thread, stack, &CLASS_DOG);
            assert!(exception::occurred(thread));
            let ex = exception::clear(thread);
            assert_eq!(Object::class_of(ex).name(), "java/lang/ClassCastException");

            Frame::pop(thread);
        });
    }

    //*****************************************************************************************************
    // Arrays, assignability, strings
    //*****************************************************************************************************

    #[test]
    fn array_classes_and_assignability() {
        run_in_vm(test_config(), |vm, thread| {
            let loader = &mut vm.as_mut_ref().class_loader;
            let int_array = loader.find_class(thread, "[I");
            let dog_array = loader.find_class(thread, "[LDog;");
            let animal_array = loader.find_class(thread, "[LAnimal;");
            assert!(int_array.is_not_null() && dog_array.is_not_null() && animal_array.is_not_null());

            // Same primitive component, covariant reference components.
            assert!(class_assignable(int_array.info.as_ref(), int_array.info.as_ref()));
            assert!(class_assignable(dog_array.info.as_ref(), animal_array.info.as_ref()));
            assert!(!class_assignable(animal_array.info.as_ref(), dog_array.info.as_ref()));
            assert!(!class_assignable(int_array.info.as_ref(), animal_array.info.as_ref()));

            // Arrays implement the core marker interfaces and Object.
            assert!(class_assignable(int_array.info.as_ref(), &rt::JAVA_LANG_CLONEABLE));
            assert!(class_assignable(int_array.info.as_ref(), &rt::JAVA_IO_SERIALIZABLE));
            assert!(class_assignable(int_array.info.as_ref(), &rt::JAVA_LANG_OBJECT));

            // Interface assignability through the hierarchy.
            assert!(class_assignable(&CLASS_LOUD, &IFACE_GREETER));
            assert!(class_assignable(&CLASS_DOG, &CLASS_ANIMAL));
            assert!(!class_assignable(&CLASS_ANIMAL, &CLASS_DOG));
        });
    }

    #[test]
    fn array_store_checks_and_bounds() {
        run_in_vm(test_config(), |_, thread| {
            get_class_init(thread, &CLASS_DOG);
            get_class_init(thread, &CLASS_ANIMAL);

            let frame = Frame::push_java(thread, None, 4, 0);

            // new Animal[2]
            {
                let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
                stack.push_int(2);
            }
            crate::bytecode::newarray(thread, frame, "[LAnimal;");
            assert!(!exception::occurred(thread));

            let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
            let arr = stack.peek(1).expect_object();

            // arr[0] = new Dog() is fine.
            let dog_class = thread.vm().as_ref().class_loader.get_loaded(&CLASS_DOG);
            let dog = classloader::alloc_instance(thread, dog_class);
            stack.push_object(arr);
            stack.push_int(0);
            stack.push_object(dog);
            crate::bytecode::array_store(thread, stack, BasicType::Object);
            assert!(!exception::occurred(thread));

            // Out-of-bounds store raises.
            stack.push_object(arr);
            stack.push_int(5);
            stack.push_object(dog);
            crate::bytecode::array_store(thread, stack, BasicType::Object);
            assert!(exception::occurred(thread));
            let ex = exception::clear(thread);
            assert_eq!(
                Object::class_of(ex).name(),
                "java/lang/ArrayIndexOutOfBoundsException"
            );

            // new String[1]; storing a Dog raises ArrayStoreException.
            {
                let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
                stack.push_int(1);
            }
            crate::bytecode::newarray(thread, frame, "[Ljava/lang/String;");
            let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
            let sarr = stack.pop_object();
            stack.push_object(sarr);
            stack.push_int(0);
            stack.push_object(dog);
            crate::bytecode::array_store(thread, stack, BasicType::Object);
            assert!(exception::occurred(thread));
            let ex = exception::clear(thread);
            assert_eq!(Object::class_of(ex).name(), "java/lang/ArrayStoreException");

            // Negative length raises NegativeArraySizeException.
            {
                let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
                stack.push_int(-3);
            }
            crate::bytecode::newarray(thread, frame, "[I");
            assert!(exception::occurred(thread));
            let ex = exception::clear(thread);
            assert_eq!(
                Object::class_of(ex).name(),
                "java/lang/NegativeArraySizeException"
            );

            Frame::pop(thread);
        });
    }

    #[test]
    fn string_constants_intern_once() {
        run_in_vm(test_config(), |_, thread| {
            let first = string_pool::constant(thread, 0);
            let second = string_pool::constant(thread, 0);
            assert!(first.is_not_null());
            assert!(first == second);
            assert_eq!(string_pool::java_string_to_rust(first), "hello");
            assert_eq!(
                string_pool::java_string_to_rust(string_pool::constant(thread, 1)),
                "world"
            );
        });
    }

    //*****************************************************************************************************
    // Monitors through the object layer
    //*****************************************************************************************************

    #[test]
    fn object_monitor_reentrance_wait_notify() {
        run_in_vm(test_config(), |vm, thread| {
            let frame = Frame::push_java(thread, None, 2, 0);
            let object_class = vm.as_ref().class_loader.object_class();
            let obj = classloader::alloc_instance(thread, object_class);
            frame.as_mut_ref().java_mut().operand_stack.push_object(obj);

            for _ in 0..3 {
                assert_eq!(monitor::monitor_enter(thread, obj), crate::thread::ThreadResult::Success);
            }
            let m = Object::monitor(obj);
            assert_eq!(monitor::hold_count(thread, m), 3);

            let notifier = spawn_java_thread(vm, move |t| {
                // Blocks until the waiter releases the monitor.
                assert_eq!(monitor::monitor_enter(t, obj), crate::thread::ThreadResult::Success);
                assert_eq!(monitor::monitor_notify(t, obj), crate::thread::ThreadResult::Success);
                assert_eq!(monitor::monitor_exit(t, obj), crate::thread::ThreadResult::Success);
            });

            let result = monitor::monitor_wait(thread, obj, 0, 0);
            assert_eq!(result, crate::thread::ThreadResult::Success);
            assert_eq!(monitor::hold_count(thread, m), 3);

            for _ in 0..3 {
                assert_eq!(monitor::monitor_exit(thread, obj), crate::thread::ThreadResult::Success);
            }
            notifier.join().unwrap();
            Frame::pop(thread);
        });
    }

    #[test]
    fn monitor_exit_without_ownership_is_illegal() {
        run_in_vm(test_config(), |vm, thread| {
            let frame = Frame::push_java(thread, None, 2, 0);
            let object_class = vm.as_ref().class_loader.object_class();
            let obj = classloader::alloc_instance(thread, object_class);
            frame.as_mut_ref().java_mut().operand_stack.push_object(obj);

            let stack = &mut frame.as_mut_ref().java_mut().operand_stack;
            stack.push_object(obj);
            crate::bytecode::monitorexit(thread, stack);
            assert!(exception::occurred(thread));
            let ex = exception::clear(thread);
            assert_eq!(
                Object::class_of(ex).name(),
                "java/lang/IllegalMonitorStateException"
            );
            Frame::pop(thread);
        });
    }

    //*****************************************************************************************************
    // JNI bridge
    //*****************************************************************************************************

    #[test]
    fn jni_field_access_and_strings() {
        run_default(|vm, thread| {
            // Work inside a native frame the way a real native method would.
            Frame::push_native(thread);
            let env = crate::native::env_of(thread);

            let system = classloader::get_class_by_name_init(thread, "java/lang/System");
            assert!(system.is_not_null());
            let cls_handle = crate::native::get_local_ref(thread, JClass::as_object(system));

            crate::native::enter_jni(thread);
            let out_field = crate::native::jni::get_static_field_id(
                env,
                cls_handle,
                "out",
                "Ljava/io/PrintStream;",
            );
            crate::native::exit_jni(thread);
            assert!(out_field.is_not_null());
            assert!(out_field.is_static);

            // String round trip through GetStringUTFChars.
            let s = string_pool::create_string(thread, "native bridge");
            let s_handle = crate::native::get_local_ref(thread, s);
            crate::native::enter_jni(thread);
            let mut is_copy = 0;
            let chars = crate::native::jni::get_string_utf_chars(env, s_handle, Some(&mut is_copy));
            let len = crate::native::jni::get_string_utf_length(env, s_handle);
            crate::native::exit_jni(thread);
            assert!(!chars.is_null());
            assert_eq!(is_copy, ::jni::sys::JNI_TRUE);
            assert_eq!(len, "native bridge".len() as i32);
            let copied = unsafe {
                std::ffi::CStr::from_ptr(chars as *const std::os::raw::c_char)
                    .to_string_lossy()
                    .to_string()
            };
            assert_eq!(copied, "native bridge");
            crate::native::jni::release_string_utf_chars(env, s_handle, chars);

            // Byte array region copy.
            let arr = crate::bytecode::array_new(thread, "[B", 4);
            for i in 0..4 {
                let slot: crate::object::prelude::Ptr<i8> = crate::object::prelude::Ptr::from_addr(
                    crate::object::JavaArray::element_at(arr, BasicType::Byte, i),
                );
                *slot.as_mut_ref() = (i as i8) + 1;
            }
            let arr_handle = crate::native::get_local_ref(thread, arr.cast());
            let mut buf = [0i8; 4];
            crate::native::enter_jni(thread);
            assert_eq!(crate::native::jni::get_array_length(env, arr_handle), 4);
            crate::native::jni::get_byte_array_region(env, arr_handle, 0, 4, &mut buf);
            crate::native::exit_jni(thread);
            assert_eq!(buf, [1, 2, 3, 4]);

            let _ = vm;
            Frame::pop(thread);
        });
    }

    #[test]
    fn local_ref_tables_grow_and_recycle() {
        run_default(|_, thread| {
            Frame::push_native(thread);
            let s = string_pool::create_string(thread, "handle");
            let mut handles = Vec::new();
            // Overflow the inline table so a chained table is allocated.
            for _ in 0..crate::native::INLINE_REF_CAPACITY + 8 {
                let h = crate::native::get_local_ref(thread, s);
                assert!(!h.is_null());
                handles.push(h);
            }
            for h in &handles {
                assert!(crate::native::dereference(thread, *h) == s);
            }
            // Deleted slots are reused.
            crate::native::delete_local_ref(thread, handles[0]);
            let reused = crate::native::get_local_ref(thread, s);
            assert!(!reused.is_null());
            Frame::pop(thread);
        });
    }

    //*****************************************************************************************************
    // End to end: the hello-world image
    //*****************************************************************************************************

    fn hello_main(thread: ThreadPtr) {
        let frame = Frame::push_java(thread, Some(&HELLO_METHODS[0]), 3, 1);
        crate::bytecode::prepare_arguments(frame, 1);
        crate::bytecode::label(frame, 0);
        crate::bytecode::getstatic_object(thread, frame, &rt::JAVA_LANG_SYSTEM, rt::SYSTEM_STATIC_OUT);
        if exception::occurred(thread) {
            Frame::pop(thread);
            return;
        }
        crate::bytecode::ldc_string(thread, frame, 0);
        if exception::occurred(thread) {
            Frame::pop(thread);
            return;
        }
        crate::bytecode::invoke_virtual(
            thread,
            frame,
            2,
            &rt::JAVA_IO_PRINT_STREAM,
            rt::PRINT_STREAM_VTABLE_PRINTLN,
        );
        if exception::occurred(thread) {
            Frame::pop(thread);
            return;
        }
        crate::bytecode::vreturn(thread, frame);
    }

    static HELLO_METHODS: [MethodInfo; 1] = [MethodInfo {
        access_flags: METHOD_ACC_PUBLIC | METHOD_ACC_STATIC,
        name: "main",
        descriptor: "([Ljava/lang/String;)V",
        code: Some(MethodRoutine::Void(hello_main)),
        native: None,
    }];

    static HELLO_MAIN: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "HelloMain",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &HELLO_METHODS,
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    fn boom_main(thread: ThreadPtr) {
        let frame = Frame::push_java(thread, Some(&BOOM_METHODS[0]), 2, 1);
        crate::bytecode::prepare_arguments(frame, 1);
        let ex = exception::new_throwable(thread, &rt::JAVA_LANG_RUNTIME_EXCEPTION, "boom");
        frame.as_mut_ref().java_mut().operand_stack.push_object(ex);
        crate::bytecode::athrow(thread, &mut frame.as_mut_ref().java_mut().operand_stack);
        // No handler covers the throw; the frame unwinds out.
        Frame::pop(thread);
    }

    static BOOM_METHODS: [MethodInfo; 1] = [MethodInfo {
        access_flags: METHOD_ACC_PUBLIC | METHOD_ACC_STATIC,
        name: "main",
        descriptor: "([Ljava/lang/String;)V",
        code: Some(MethodRoutine::Void(boom_main)),
        native: None,
    }];

    static BOOM_MAIN: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "BoomMain",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &BOOM_METHODS,
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: OBJ,
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    static E2E_REGISTRY: [ClassInfoRef; 2] = [&HELLO_MAIN, &BOOM_MAIN];

    #[test]
    fn run_main_hello_world_exits_zero() {
        let mut cfg = VMConfig::default();
        cfg.registry = &E2E_REGISTRY;
        cfg.string_constants = &["hello"];
        cfg.main_class = "HelloMain".to_string();
        run_in_vm(cfg, |vm, thread| {
            let code = vm.as_mut_ref().run_main(thread, &[]);
            assert_eq!(code, 0);
        });
    }

    #[test]
    fn run_main_uncaught_exception_exits_nonzero() {
        let mut cfg = VMConfig::default();
        cfg.registry = &E2E_REGISTRY;
        cfg.string_constants = &[];
        cfg.main_class = "BoomMain".to_string();
        run_in_vm(cfg, |vm, thread| {
            let code = vm.as_mut_ref().run_main(thread, &[]);
            assert_ne!(code, 0);
            assert!(!exception::occurred(thread));
        });
    }

    #[test]
    fn run_main_missing_class_reports_error() {
        let mut cfg = VMConfig::default();
        cfg.main_class = "NoSuchMain".to_string();
        run_in_vm(cfg, |vm, thread| {
            let code = vm.as_mut_ref().run_main(thread, &[]);
            assert_ne!(code, 0);
        });
    }
}
