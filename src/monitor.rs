//! Per-object recursive monitors with wait/notify.
//!
//! A monitor is created lazily on first use, under the object's class
//! monitor so two racing threads cannot both install one. Class blocks get
//! their monitor at class-creation time, which also breaks the recursion
//! for objects whose class word is still null during bootstrap.

use crate::object::prelude::*;
use crate::object::Object;
use crate::thread::{self, ThreadPtr, ThreadResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

pub type MonitorPtr = Ptr<Monitor>;

struct MonitorState {
    owner: JLong,
    count: u32,
    waiters: VecDeque<ThreadPtr>,
}

pub struct Monitor {
    state: Mutex<MonitorState>,
    cond: Condvar,
}

impl Monitor {
    fn new() -> Monitor {
        Monitor {
            state: Mutex::new(MonitorState {
                owner: 0,
                count: 0,
                waiters: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

/// A free-standing monitor, not tied to any object. The bootstrap loader
/// lock is one of these.
pub fn create_raw() -> MonitorPtr {
    MonitorPtr::new(Box::into_raw(Box::new(Monitor::new())))
}

/// Install a monitor on the object if it does not have one yet. Only safe
/// when racing installs are excluded by the caller (class creation).
pub fn monitor_create(obj: ObjectPtr) -> MonitorPtr {
    let existing = Object::monitor(obj);
    if existing.is_not_null() {
        return existing;
    }
    let m = create_raw();
    Object::set_monitor(obj, m);
    return m;
}

/// Find or install the object's monitor. `read` re-reads the object from a
/// GC-visible location (an operand-stack slot): taking the class monitor can
/// block at a safepoint, and the object may have moved by the time the
/// install happens. Class blocks never move.
fn ensure_monitor_with<R: Fn() -> ObjectPtr>(
    thread: ThreadPtr,
    read: R,
) -> Result<MonitorPtr, ThreadResult> {
    let obj = read();
    let m = Object::monitor(obj);
    if m.is_not_null() {
        return Ok(m);
    }

    let clazz = Object::class_of(obj);
    if clazz.is_null() {
        // Class blocks receive their monitor when the class is created.
        return Err(ThreadResult::Error);
    }
    let class_monitor = Object::monitor(JClass::as_object(clazz));
    debug_assert!(class_monitor.is_not_null());

    enter_monitor(thread, class_monitor);
    let obj = read();
    if Object::monitor(obj).is_null() {
        Object::set_monitor(obj, create_raw());
    }
    let m = Object::monitor(obj);
    exit_monitor(thread, class_monitor);
    return Ok(m);
}

//*********************************************************************************************************
// Raw-monitor operations
//*********************************************************************************************************

pub fn enter_monitor(thread: ThreadPtr, m: MonitorPtr) {
    let me = thread.thread_id;
    loop {
        // Contended entry parks inside the safe region so a stopped world
        // never waits on us.
        thread::enter_saferegion(thread);
        let mut s = m.state.lock();
        if s.owner == 0 || s.owner == me {
            s.owner = me;
            s.count += 1;
            drop(s);
            thread::leave_saferegion(thread);
            return;
        }
        m.cond.wait(&mut s);
        drop(s);
        thread::leave_saferegion(thread);
    }
}

pub fn exit_monitor(thread: ThreadPtr, m: MonitorPtr) -> ThreadResult {
    let me = thread.thread_id;
    let mut s = m.state.lock();
    if s.owner != me {
        return ThreadResult::LockNotOwned;
    }
    s.count -= 1;
    if s.count == 0 {
        s.owner = 0;
        m.cond.notify_one();
    }
    return ThreadResult::Success;
}

pub fn wait_monitor(thread: ThreadPtr, m: MonitorPtr, millis: JLong, nanos: JInt) -> ThreadResult {
    let me = thread.thread_id;
    let prev_count;
    {
        let mut s = m.state.lock();
        if s.owner != me {
            return ThreadResult::LockNotOwned;
        }
        s.waiters.push_back(thread);
        prev_count = s.count;
        s.count = 0;
        s.owner = 0;
        m.cond.notify_one();
    }

    // Park on the thread-private condition until notify/interrupt/timeout.
    thread::enter_saferegion(thread);
    let timed_out = thread::park(thread, millis, nanos);

    // Regain ownership, restoring the saved reentrance count.
    loop {
        let mut s = m.state.lock();
        if let Some(pos) = s.waiters.iter().position(|w| *w == thread) {
            s.waiters.remove(pos);
        }
        if s.owner == 0 {
            s.owner = me;
            s.count = prev_count;
            break;
        }
        m.cond.wait(&mut s);
    }
    thread::leave_saferegion(thread);

    if thread::take_interrupted(thread) {
        return ThreadResult::Interrupt;
    }
    return if timed_out {
        ThreadResult::Timeout
    } else {
        ThreadResult::Success
    };
}

fn notify_monitor(thread: ThreadPtr, m: MonitorPtr, all: bool) -> ThreadResult {
    let me = thread.thread_id;
    let mut s = m.state.lock();
    if s.owner != me {
        return ThreadResult::LockNotOwned;
    }
    while let Some(w) = s.waiters.pop_front() {
        thread::unpark(w);
        if !all {
            break;
        }
    }
    return ThreadResult::Success;
}

/// Reentrance count currently held by `thread`, 0 when not the owner.
pub fn hold_count(thread: ThreadPtr, m: MonitorPtr) -> u32 {
    let s = m.state.lock();
    if s.owner == thread.thread_id {
        s.count
    } else {
        0
    }
}

//*********************************************************************************************************
// Object-monitor operations
//*********************************************************************************************************

/// monitorenter with a re-readable receiver location; the intrinsic passes
/// its operand-stack slot so a collection during the install keeps things
/// consistent.
pub fn monitor_enter_with<R: Fn() -> ObjectPtr>(thread: ThreadPtr, read: R) -> ThreadResult {
    match ensure_monitor_with(thread, &read) {
        Ok(m) => {
            enter_monitor(thread, m);
            ThreadResult::Success
        }
        Err(e) => e,
    }
}

/// monitorenter for receivers at stable addresses (class blocks, rooted
/// objects with no safepoint in between).
pub fn monitor_enter(thread: ThreadPtr, obj: ObjectPtr) -> ThreadResult {
    monitor_enter_with(thread, || obj)
}

pub fn monitor_exit(thread: ThreadPtr, obj: ObjectPtr) -> ThreadResult {
    let m = Object::monitor(obj);
    if m.is_null() {
        return ThreadResult::LockNotOwned;
    }
    return exit_monitor(thread, m);
}

pub fn monitor_wait(thread: ThreadPtr, obj: ObjectPtr, millis: JLong, nanos: JInt) -> ThreadResult {
    let m = Object::monitor(obj);
    if m.is_null() {
        return ThreadResult::LockNotOwned;
    }
    return wait_monitor(thread, m, millis, nanos);
}

pub fn monitor_notify(thread: ThreadPtr, obj: ObjectPtr) -> ThreadResult {
    let m = Object::monitor(obj);
    if m.is_null() {
        return ThreadResult::LockNotOwned;
    }
    return notify_monitor(thread, m, false);
}

pub fn monitor_notify_all(thread: ThreadPtr, obj: ObjectPtr) -> ThreadResult {
    let m = Object::monitor(obj);
    if m.is_null() {
        return ThreadResult::LockNotOwned;
    }
    return notify_monitor(thread, m, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::VMThreadContext;
    use crate::vm::VMPtr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn reentrance_counts() {
        crate::os::init();
        let m = create_raw();
        let t = VMThreadContext::create(VMPtr::null());
        enter_monitor(t, m);
        enter_monitor(t, m);
        enter_monitor(t, m);
        assert_eq!(hold_count(t, m), 3);
        assert_eq!(exit_monitor(t, m), ThreadResult::Success);
        assert_eq!(hold_count(t, m), 2);
        assert_eq!(exit_monitor(t, m), ThreadResult::Success);
        assert_eq!(exit_monitor(t, m), ThreadResult::Success);
        assert_eq!(hold_count(t, m), 0);
        // Exiting an unowned monitor is reported, not fatal.
        assert_eq!(exit_monitor(t, m), ThreadResult::LockNotOwned);
        VMThreadContext::destroy(t);
    }

    #[test]
    fn wait_releases_and_restores_reentrance() {
        crate::os::init();
        let m = create_raw();
        let t1 = VMThreadContext::create(VMPtr::null());

        enter_monitor(t1, m);
        enter_monitor(t1, m);
        enter_monitor(t1, m);
        assert_eq!(hold_count(t1, m), 3);

        let woke = Arc::new(AtomicBool::new(false));
        let woke_clone = woke.clone();
        let helper = std::thread::spawn(move || {
            let t2 = VMThreadContext::create(VMPtr::null());
            // Blocks until the waiter releases ownership.
            enter_monitor(t2, m);
            assert_eq!(hold_count(t2, m), 1);
            assert_eq!(notify_monitor(t2, m, false), ThreadResult::Success);
            woke_clone.store(true, Ordering::SeqCst);
            assert_eq!(exit_monitor(t2, m), ThreadResult::Success);
            VMThreadContext::destroy(t2);
        });

        let result = wait_monitor(t1, m, 0, 0);
        assert_eq!(result, ThreadResult::Success);
        assert!(woke.load(Ordering::SeqCst));
        // The reentrance count is restored on wakeup.
        assert_eq!(hold_count(t1, m), 3);
        exit_monitor(t1, m);
        exit_monitor(t1, m);
        assert_eq!(exit_monitor(t1, m), ThreadResult::Success);

        helper.join().unwrap();
        VMThreadContext::destroy(t1);
    }

    #[test]
    fn wait_times_out() {
        crate::os::init();
        let m = create_raw();
        let t = VMThreadContext::create(VMPtr::null());
        enter_monitor(t, m);
        let result = wait_monitor(t, m, 20, 0);
        assert_eq!(result, ThreadResult::Timeout);
        assert_eq!(hold_count(t, m), 1);
        exit_monitor(t, m);
        VMThreadContext::destroy(t);
    }

    #[test]
    fn notify_wakes_one_notify_all_wakes_all() {
        crate::os::init();
        let m = create_raw();
        let owner = VMThreadContext::create(VMPtr::null());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let h = std::thread::spawn(move || {
                let t = VMThreadContext::create(VMPtr::null());
                enter_monitor(t, m);
                let r = wait_monitor(t, m, 2000, 0);
                exit_monitor(t, m);
                VMThreadContext::destroy(t);
                r
            });
            handles.push(h);
        }

        // Give the waiters time to park.
        std::thread::sleep(std::time::Duration::from_millis(100));

        enter_monitor(owner, m);
        assert_eq!(notify_monitor(owner, m, false), ThreadResult::Success);
        {
            let s = m.state.lock();
            assert_eq!(s.waiters.len(), 2);
        }
        assert_eq!(notify_monitor(owner, m, true), ThreadResult::Success);
        {
            let s = m.state.lock();
            assert!(s.waiters.is_empty());
        }
        exit_monitor(owner, m);

        for h in handles {
            assert_eq!(h.join().unwrap(), ThreadResult::Success);
        }
        VMThreadContext::destroy(owner);
    }

    #[test]
    fn interrupt_breaks_wait() {
        crate::os::init();
        let m = create_raw();
        let waiter = VMThreadContext::create(VMPtr::null());

        let h = std::thread::spawn(move || {
            // Interrupt after the waiter has parked.
            std::thread::sleep(std::time::Duration::from_millis(50));
            crate::thread::interrupt(waiter, waiter);
        });

        enter_monitor(waiter, m);
        let result = wait_monitor(waiter, m, 0, 0);
        assert_eq!(result, ThreadResult::Interrupt);
        exit_monitor(waiter, m);
        h.join().unwrap();
        VMThreadContext::destroy(waiter);
    }
}
