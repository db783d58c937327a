use aotvm::vm::{VMConfig, VM};
use clap::Parser;

/// A hand-translated `Main` image, standing in for translator output the way
/// a generated module would: one ClassInfo literal, one function per method,
/// and the string constant table.
mod demo {
    use aotvm::bytecode;
    use aotvm::classloader;
    use aotvm::exception;
    use aotvm::metadata::*;
    use aotvm::rt;
    use aotvm::stack::Frame;
    use aotvm::thread::ThreadPtr;

    pub static STRING_CONSTANTS: [&str; 1] = ["hello"];

    // public static void main(String[] args) { System.out.println("hello"); }
    fn main_body(thread: ThreadPtr) {
        let frame = Frame::push_java(thread, Some(&MAIN_METHODS[0]), 3, 1);
        bytecode::prepare_arguments(frame, 1);

        bytecode::label(frame, 0);
        bytecode::line(frame, 3);
        bytecode::getstatic_object(thread, frame, &rt::JAVA_LANG_SYSTEM, rt::SYSTEM_STATIC_OUT);
        if exception::occurred(thread) {
            Frame::pop(thread);
            return;
        }
        bytecode::ldc_string(thread, frame, 0);
        if exception::occurred(thread) {
            Frame::pop(thread);
            return;
        }
        bytecode::invoke_virtual(
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
        bytecode::vreturn(thread, frame);
    }

    static MAIN_METHODS: [MethodInfo; 1] = [MethodInfo {
        access_flags: METHOD_ACC_PUBLIC | METHOD_ACC_STATIC,
        name: "main",
        descriptor: "([Ljava/lang/String;)V",
        code: Some(MethodRoutine::Void(main_body)),
        native: None,
    }];

    static MAIN_CLASS: ClassInfo = ClassInfo {
        access_flags: CLASS_ACC_PUBLIC,
        name: "Main",
        super_class: Some(&rt::JAVA_LANG_OBJECT),
        interfaces: &[],
        fields: &[],
        methods: &MAIN_METHODS,
        resolve: classloader::resolve_ordinary,
        class_size: classloader::BASE_CLASS_BLOCK_SIZE,
        instance_size: std::mem::size_of::<aotvm::object::ObjectHeader>(),
        static_fields: &[],
        instance_fields: &[],
        vtable: &[],
        itable: &[],
        clinit: None,
        finalizer: None,
        element: None,
    };

    pub static REGISTRY: [ClassInfoRef; 1] = [&MAIN_CLASS];
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// The main class
    #[arg(default_value = "Main")]
    main_class: String,

    /// Maximum heap size in megabytes
    #[arg(long, default_value_t = 512)]
    max_heap: usize,

    /// Arguments passed to the Java main method
    args: Vec<String>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let mut cfg = VMConfig::default();
    cfg.registry = &demo::REGISTRY;
    cfg.string_constants = &demo::STRING_CONSTANTS;
    cfg.main_class = cli.main_class;
    cfg.heap.max_heap = cli.max_heap * 1024 * 1024;
    let stack_size = cfg.stack_size;

    let vm = VM::new(cfg);
    let args = cli.args;

    let main_thread = std::thread::Builder::new()
        .stack_size(stack_size)
        .name("main".to_string())
        .spawn(move || {
            let thread = VM::attach_current_thread(vm);
            if let Err(err) = vm.as_mut_ref().init(thread) {
                eprintln!("aotvm: {:?}", err);
                return 1;
            }
            vm.as_mut_ref().run_main(thread, &args)
        })
        .expect("unable to start the main thread");

    let code = main_thread.join().unwrap_or(1);
    std::process::exit(code);
}
