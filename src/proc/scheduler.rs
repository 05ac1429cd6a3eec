//! Per-CPU scheduler loop, sleep/wakeup, and `forkret` (spec.md §4.6,
//! §4.9).

use super::{
    cpu::Cpu,
    process::{Process, ProcessState, INITPROC, PROC},
};
use crate::{riscv, sync::spinlock::SpinlockGuard};
use core::{ffi::c_void, ptr::addr_of_mut};

/// Forever: for each slot in the table, acquire its lock, and if
/// runnable, mark it running and swtch into it.
///
/// `Cpu::current().context` is where every `sched()` in the system
/// swtches back to, so this never actually returns — when a process
/// swtches away, execution resumes right here, right after the swtch
/// call below.
pub unsafe fn scheduler() -> ! {
    let c = Cpu::current();

    loop {
        riscv::intr_on();

        for p in PROC.iter_mut() {
            p.lock.lock_raw();

            if p.state == ProcessState::Runnable {
                p.state = ProcessState::Running;
                c.proc = addr_of_mut!(*p);

                riscv::swtch(
                    addr_of_mut!(c.context),
                    addr_of_mut!(p.context),
                );

                c.proc = core::ptr::null_mut();
            }

            p.lock.unlock_raw();
        }
    }
}

/// Switch from the current process back into the scheduler. Must be
/// called with only `self.lock` held (via `lock_raw`), and with
/// `state` already updated away from `Running`.
///
/// `noff` must be exactly 1 (the lock just taken), since `intena` is
/// restored afterward as a property of this kernel thread rather than
/// this CPU — it would otherwise be clobbered by the lock nesting of
/// whichever thread runs next on this hart.
pub unsafe fn sched_raw() {
    let p = Process::current().expect("sched: no current process");
    let c = Cpu::current();

    if !p.lock.holding() {
        panic!("sched p.lock");
    } else if c.noff != 1 {
        panic!("sched locks");
    } else if p.state == ProcessState::Running {
        panic!("sched running");
    } else if riscv::intr_get() {
        panic!("sched interruptible");
    }

    let intena = c.intena;
    riscv::swtch(addr_of_mut!(p.context), addr_of_mut!(c.context));
    c.intena = intena;
}

/// Give up the CPU for one scheduling round.
pub unsafe fn yield_() {
    let p = Process::current().expect("yield: no current process");
    p.lock.lock_raw();
    p.state = ProcessState::Runnable;
    sched_raw();
    p.lock.unlock_raw();
}

/// First-ever entry point for a newly created process (`context.ra`
/// is pointed here by `Process::alloc`). Releases the lock that was
/// left held by the scheduler's swtch-in, runs one-time late
/// initialization on the very first call across the whole system,
/// then falls through to the user-trap-return path.
static FIRST: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(true);

pub unsafe extern "C" fn forkret() -> ! {
    let p = Process::current().expect("forkret: no current process");
    p.lock.unlock_raw();

    if FIRST.swap(false, core::sync::atomic::Ordering::SeqCst) {
        crate::fs::fsinit(crate::param::ROOTDEV as i32);
    }

    crate::trap::usertrapret();
}

/// Atomically release `lk` and block on `chan`, reacquiring `lk`
/// before returning. See spec.md §4.9: acquiring this process's own
/// lock before releasing `lk` is what prevents a `wakeup` racing in
/// between from being lost.
pub unsafe fn sleep<'l>(chan: *mut c_void, lk: SpinlockGuard<'l>) -> SpinlockGuard<'l> {
    let p = Process::current().expect("sleep: no current process");

    p.lock.lock_raw();
    let lock = lk.lock;
    drop(lk);

    p.chan = chan;
    p.state = ProcessState::Sleeping;

    sched_raw();

    p.chan = core::ptr::null_mut();
    p.lock.unlock_raw();

    lock.lock()
}

/// Wake every process sleeping on `chan`. Must be called without
/// holding any process's own lock.
pub unsafe fn wakeup(chan: *mut c_void) {
    let me = Process::current().map(|p| addr_of_mut!(*p));

    for p in PROC.iter_mut() {
        let p_ptr = addr_of_mut!(*p);
        if Some(p_ptr) == me {
            continue;
        }

        let guard = p.lock.lock();
        if p.state == ProcessState::Sleeping && p.chan == chan {
            p.state = ProcessState::Runnable;
        }
        drop(guard);
    }
}

/// The current hart's running process, or null.
pub unsafe fn myproc() -> *mut Process {
    match Process::current() {
        Some(p) => addr_of_mut!(*p),
        None => core::ptr::null_mut(),
    }
}

/// The current process's pid, used by `Sleeplock` to record a holder.
/// Returns 0 outside of a process context.
pub unsafe fn myproc_pid() -> i32 {
    match Process::current() {
        Some(p) => p.pid,
        None => 0,
    }
}

/// Kill the process with the given pid; returns true if found.
pub unsafe fn kill(pid: i32) -> bool {
    Process::kill(pid)
}

pub unsafe fn setkilled(p: *mut Process) {
    (*p).set_killed();
}

pub unsafe fn killed(p: *mut Process) -> bool {
    (*p).is_killed()
}

pub unsafe fn r#yield() {
    yield_()
}

/// Initial kick-off: install `initproc` and fall into the scheduler.
/// Called once at boot by `rust_main` after `userinit`.
pub unsafe fn run() -> ! {
    debug_assert!(!INITPROC.is_null());
    scheduler()
}
