//! Test harness: boot a VM on the built-in class images (plus per-test
//! translated classes) and run the body on an attached main thread.

use crate::memory::MB;
use crate::thread::ThreadPtr;
use crate::vm::{VMConfig, VMPtr, VM};

pub fn run_in_vm<F>(config: VMConfig, f: F)
where
    F: FnOnce(VMPtr, ThreadPtr) + Send + 'static,
{
    let vm = VM::new(config);
    let handle = std::thread::Builder::new()
        .name("test-main".to_string())
        .stack_size(4 * MB)
        .spawn(move || {
            let thread = VM::attach_current_thread(vm);
            vm.as_mut_ref().init(thread).expect("vm init failed");
            f(vm, thread);
            VM::detach_current_thread(vm, thread);
            vm.as_mut_ref().heap.shutdown_gc_thread();
        })
        .expect("unable to spawn test thread");
    handle.join().expect("test body panicked");
}

pub fn run_default<F>(f: F)
where
    F: FnOnce(VMPtr, ThreadPtr) + Send + 'static,
{
    run_in_vm(VMConfig::default(), f);
}

/// Attach an extra Java thread to a running test VM.
pub fn spawn_java_thread<F>(vm: VMPtr, f: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce(ThreadPtr) + Send + 'static,
{
    std::thread::Builder::new()
        .stack_size(4 * MB)
        .spawn(move || {
            let thread = VM::attach_current_thread(vm);
            f(thread);
            VM::detach_current_thread(vm, thread);
        })
        .expect("unable to spawn java thread")
}
