//! Thread contexts, the managed thread list, and the cooperative safepoint
//! protocol.
//!
//! A thread is "in the safe region" while it performs no GC-visible pointer
//! mutation and holds no raw pointers to movable objects. The region is
//! reentrant: a counter tracks nesting so a native call making another native
//! call does not leave early. The GC distinguishes `counter > 0` (markable)
//! from `counter == 0` with a stop request pending (the thread must block at
//! its next checkpoint).

use crate::memory::tlab::Tlab;
use crate::object::prelude::*;
use crate::os;
use crate::stack::FramePtr;
use crate::vm::VMPtr;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub type ThreadPtr = Ptr<VMThreadContext>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadResult {
    Success,
    Timeout,
    Error,
    Interrupt,
    LockNotOwned,
}

struct BlockState {
    interrupted: bool,
    /// Pending notifications, so an unpark issued before the waiter parks is
    /// not lost.
    permits: u32,
}

struct GcFlags {
    safe_count: u32,
    stop_requested: bool,
}

pub struct VMThreadContext {
    pub thread_id: JLong,
    pub vm: VMPtr,

    /// The java/lang/Thread object of this thread.
    pub current_thread: ObjectPtr,
    /// Pending exception, or null.
    pub exception: ObjectPtr,
    /// Class on whose behalf the next frame is pushed (invokestatic /
    /// clinit handshake).
    pub calling_class: JClassPtr,

    pub top_frame: FramePtr,
    pub tlab: Tlab,

    pub next: ThreadPtr,

    block: Mutex<BlockState>,
    block_cond: Condvar,
    gc: Mutex<GcFlags>,
    gc_cond: Condvar,
}

static NEXT_THREAD_ID: AtomicI64 = AtomicI64::new(1);

thread_local! {
    static VM_THREAD: Cell<usize> = Cell::new(0);
}

impl VMThreadContext {
    pub fn create(vm: VMPtr) -> ThreadPtr {
        let ctx = Box::new(VMThreadContext {
            thread_id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            vm,
            current_thread: ObjectPtr::null(),
            exception: ObjectPtr::null(),
            calling_class: JClassPtr::null(),
            top_frame: FramePtr::null(),
            tlab: Tlab::new(),
            next: ThreadPtr::null(),
            block: Mutex::new(BlockState {
                interrupted: false,
                permits: 0,
            }),
            block_cond: Condvar::new(),
            gc: Mutex::new(GcFlags {
                safe_count: 0,
                stop_requested: false,
            }),
            gc_cond: Condvar::new(),
        });
        return ThreadPtr::new(Box::into_raw(ctx));
    }

    pub fn destroy(ctx: ThreadPtr) {
        unsafe {
            let _ = Box::from_raw(ctx.as_mut_raw_ptr());
        }
    }

    pub fn vm(&self) -> VMPtr {
        self.vm
    }
}

/// Bind the context to the calling OS thread.
pub fn attach(ctx: ThreadPtr) {
    VM_THREAD.with(|t| t.set(ctx.as_usize()));
}

pub fn current() -> ThreadPtr {
    VM_THREAD.with(|t| ThreadPtr::from_usize(t.get()))
}

//*********************************************************************************************************
// Managed thread list
//*********************************************************************************************************

pub struct ThreadList {
    lock: SpinLock,
    head: ThreadPtr,
}

impl ThreadList {
    pub const fn new() -> ThreadList {
        ThreadList {
            lock: SpinLock::new(),
            head: ThreadPtr::null(),
        }
    }
}

pub fn managed_add(vm: VMPtr, ctx: ThreadPtr) {
    let list = &mut vm.as_mut_ref().threads;
    list.lock.enter(ctx);
    ctx.as_mut_ref().next = list.head;
    list.head = ctx;
    list.lock.exit();
}

pub fn managed_remove(vm: VMPtr, ctx: ThreadPtr) -> bool {
    let list = &mut vm.as_mut_ref().threads;
    list.lock.enter(ctx);
    let mut removed = false;
    if list.head == ctx {
        list.head = ctx.next;
        removed = true;
    } else {
        let mut cursor = list.head;
        while cursor.is_not_null() {
            if cursor.next == ctx {
                cursor.as_mut_ref().next = ctx.next;
                removed = true;
                break;
            }
            cursor = cursor.next;
        }
    }
    if removed {
        ctx.as_mut_ref().next = ThreadPtr::null();
    }
    list.lock.exit();
    return removed;
}

/// Walk the managed threads. Safe while the caller holds the list lock
/// (stop-the-world) or while the world is stopped; list mutation only
/// happens under the lock.
pub fn each_managed_thread<F: FnMut(ThreadPtr)>(vm: VMPtr, mut f: F) {
    let mut cursor = vm.as_ref().threads.head;
    while cursor.is_not_null() {
        f(cursor);
        cursor = cursor.next;
    }
}

//*********************************************************************************************************
// Safepoints
//*********************************************************************************************************

pub fn in_saferegion(t: ThreadPtr) -> bool {
    t.gc.lock().safe_count > 0
}

pub fn enter_saferegion(t: ThreadPtr) {
    let mut g = t.gc.lock();
    g.safe_count += 1;
    if g.stop_requested {
        // The GC may be waiting for this thread to become markable.
        t.gc_cond.notify_all();
    }
}

pub fn leave_saferegion(t: ThreadPtr) {
    let mut g = t.gc.lock();
    debug_assert!(g.safe_count > 0);
    g.safe_count -= 1;
    if g.safe_count == 0 {
        while g.stop_requested {
            t.gc_cond.wait(&mut g);
        }
    }
}

/// Pause here if a collection is pending. Blocks even inside the safe
/// region, unlike enter/leave. Returns true when the thread was stopped.
pub fn checkpoint(t: ThreadPtr) -> bool {
    let mut g = t.gc.lock();
    if !g.stop_requested {
        return false;
    }
    g.safe_count += 1;
    t.gc_cond.notify_all();
    while g.stop_requested {
        t.gc_cond.wait(&mut g);
    }
    g.safe_count -= 1;
    return true;
}

pub fn suspend_single(_gc: ThreadPtr, target: ThreadPtr) {
    let mut g = target.gc.lock();
    g.stop_requested = true;
}

pub fn wait_until_saferegion(_gc: ThreadPtr, target: ThreadPtr) {
    let mut g = target.gc.lock();
    while g.safe_count == 0 {
        target.gc_cond.wait(&mut g);
    }
}

pub fn resume_single(_gc: ThreadPtr, target: ThreadPtr) {
    let mut g = target.gc.lock();
    g.stop_requested = false;
    target.gc_cond.notify_all();
}

/// Ask every other managed thread to suspend. The list lock is held until
/// the world resumes.
pub fn stop_the_world(vm: VMPtr, gc: ThreadPtr) {
    vm.as_ref().threads.lock.enter(gc);
    each_managed_thread(vm, |t| {
        if t != gc {
            suspend_single(gc, t);
        }
    });
}

pub fn wait_until_world_stopped(vm: VMPtr, gc: ThreadPtr) {
    each_managed_thread(vm, |t| {
        if t != gc {
            wait_until_saferegion(gc, t);
        }
    });
}

pub fn resume_the_world(vm: VMPtr, gc: ThreadPtr) {
    each_managed_thread(vm, |t| {
        if t != gc {
            resume_single(gc, t);
        }
    });
    vm.as_ref().threads.lock.exit();
}

//*********************************************************************************************************
// Sleep and interrupt
//*********************************************************************************************************

pub fn sleep(t: ThreadPtr, millis: JLong, nanos: JInt) -> ThreadResult {
    if millis < 0 || !(0..1_000_000).contains(&nanos) {
        return ThreadResult::Error;
    }
    let timeout = Duration::from_millis(millis as u64) + Duration::from_nanos(nanos as u64);
    let deadline = Instant::now() + timeout;

    enter_saferegion(t);
    let mut b = t.block.lock();
    let mut interrupted = b.interrupted;
    while !interrupted {
        let result = t.block_cond.wait_until(&mut b, deadline);
        interrupted = b.interrupted;
        if result.timed_out() {
            break;
        }
    }
    b.interrupted = false;
    drop(b);
    leave_saferegion(t);

    return if interrupted {
        ThreadResult::Interrupt
    } else {
        ThreadResult::Success
    };
}

/// Set the target's interrupt flag and kick it out of any blocking wait.
pub fn interrupt(_t: ThreadPtr, target: ThreadPtr) {
    let mut b = target.block.lock();
    b.interrupted = true;
    target.block_cond.notify_all();
}

/// Clear and return the interrupt flag; used when a blocking wait returns.
pub fn take_interrupted(t: ThreadPtr) -> bool {
    let mut b = t.block.lock();
    let was = b.interrupted;
    b.interrupted = false;
    return was;
}

/// Block on the thread-private condition until notified, interrupted or
/// timed out. The monitor code parks waiters here. Returns true on timeout.
pub fn park(t: ThreadPtr, millis: JLong, nanos: JInt) -> bool {
    let deadline = if millis == 0 && nanos == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(millis as u64) + Duration::from_nanos(nanos as u64))
    };
    let mut b = t.block.lock();
    loop {
        if b.permits > 0 {
            b.permits -= 1;
            return false;
        }
        if b.interrupted {
            return false;
        }
        match deadline {
            Some(d) => {
                if t.block_cond.wait_until(&mut b, d).timed_out() {
                    return true;
                }
            }
            None => t.block_cond.wait(&mut b),
        }
    }
}

pub fn unpark(target: ThreadPtr) {
    let mut b = target.block.lock();
    b.permits += 1;
    target.block_cond.notify_all();
}

//*********************************************************************************************************
// Spin lock
//*********************************************************************************************************

const SPIN_LOCK_FREE: i32 = 0;
const SPIN_LOCK_HELD: i32 = 1;

/// Naive CAS spin lock. Non-reentrant. Contending threads spin inside the
/// safe region and yield to a pending collection at checkpoints.
pub struct SpinLock {
    state: AtomicI32,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            state: AtomicI32::new(SPIN_LOCK_FREE),
        }
    }

    pub fn try_enter(&self) -> bool {
        self.state
            .compare_exchange(SPIN_LOCK_FREE, SPIN_LOCK_HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != SPIN_LOCK_FREE
    }

    pub fn exit(&self) {
        self.state.store(SPIN_LOCK_FREE, Ordering::Release);
    }

    pub fn enter(&self, thread: ThreadPtr) {
        enter_saferegion(thread);
        loop {
            if self.try_enter() {
                break;
            }
            let mut retry_count: u32 = 0;
            while self.is_locked() {
                retry_count += 1;
                if retry_count & 7 != 0 {
                    let spin_count = 1024 * os::num_processors();
                    for _ in 0..spin_count {
                        if !self.is_locked() {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                } else if !checkpoint(thread) {
                    // Not blocked by GC; back off for a while.
                    let _ = sleep(thread, 5, 0);
                }
            }
        }
        leave_saferegion(thread);
    }

    /// Spin without entering the safe region. Only for paths that must not
    /// interact with the safepoint protocol.
    pub fn enter_unsafe(&self) {
        while !self.try_enter() {
            while self.is_locked() {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_lock_mutual_exclusion() {
        crate::os::init();
        let lock = SpinLock::new();
        assert!(lock.try_enter());
        assert!(!lock.try_enter());
        lock.exit();
        assert!(lock.try_enter());
        lock.exit();
    }

    #[test]
    fn sleep_completes_after_timeout() {
        crate::os::init();
        let t = VMThreadContext::create(VMPtr::null());
        let start = Instant::now();
        assert_eq!(sleep(t, 20, 0), ThreadResult::Success);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!in_saferegion(t));
        VMThreadContext::destroy(t);
    }

    #[test]
    fn interrupt_breaks_sleep() {
        crate::os::init();
        let t = VMThreadContext::create(VMPtr::null());
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupt(t, t);
        });
        assert_eq!(sleep(t, 10_000, 0), ThreadResult::Interrupt);
        // The interrupt flag is consumed by the wait that observed it.
        assert!(!take_interrupted(t));
        h.join().unwrap();
        VMThreadContext::destroy(t);
    }

    #[test]
    fn saferegion_counter_is_reentrant() {
        crate::os::init();
        let t = VMThreadContext::create(VMPtr::null());
        assert!(!in_saferegion(t));
        enter_saferegion(t);
        enter_saferegion(t);
        assert!(in_saferegion(t));
        leave_saferegion(t);
        assert!(in_saferegion(t));
        leave_saferegion(t);
        assert!(!in_saferegion(t));
        VMThreadContext::destroy(t);
    }

    #[test]
    fn checkpoint_blocks_only_when_requested() {
        crate::os::init();
        let t = VMThreadContext::create(VMPtr::null());
        assert!(!checkpoint(t));

        suspend_single(t, t);
        let h = std::thread::spawn(move || {
            // Release the stop request once the target has parked at the
            // checkpoint (or immediately after, either order resolves).
            std::thread::sleep(Duration::from_millis(20));
            resume_single(t, t);
        });
        assert!(checkpoint(t));
        h.join().unwrap();
        VMThreadContext::destroy(t);
    }
}
