//! Mutual exclusion with matched interrupt-disable nesting per CPU
//! (spec.md §4.1 — Spinlock & Interrupt Gate).

use crate::proc::cpu::{mycpu, Cpu};
use core::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr::null_mut,
    sync::atomic::{AtomicBool, Ordering},
};

#[repr(C)]
pub struct Spinlock {
    locked: AtomicBool,
    name: &'static str,
    /// The CPU holding this lock, or null if unheld.
    cpu: UnsafeCell<*mut Cpu>,
}
unsafe impl Sync for Spinlock {}

impl Spinlock {
    pub const fn new(name: &'static str) -> Spinlock {
        Spinlock {
            locked: AtomicBool::new(false),
            name,
            cpu: UnsafeCell::new(null_mut()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True iff this lock is held, and held by the current CPU.
    ///
    /// Interrupts must be disabled by the caller (otherwise the process
    /// could be rescheduled to a different hart between the load of
    /// `mycpu()` and the comparison).
    pub unsafe fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && *self.cpu.get() == mycpu()
    }

    /// Raw acquire with no RAII guard: spins until free, disabling
    /// interrupts first via `push_off`.
    ///
    /// This is the escape hatch named in the REDESIGN FLAGS for
    /// locks whose release crosses a `swtch()` boundary into a
    /// different stack — chiefly `Proc::lock`, which is acquired in
    /// `scheduler()` and released in `forkret`/`yield`/`sleep`/`exit`
    /// (or the reverse), never in the same stack frame that acquired
    /// it. Prefer `lock()` (the guarded form) everywhere else.
    pub unsafe fn lock_raw(&self) {
        super::spinlock::push_off();

        if self.holding() {
            panic!("acquire");
        }

        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        core::sync::atomic::fence(Ordering::SeqCst);
        *self.cpu.get() = mycpu();
    }

    /// Raw release matching `lock_raw`.
    pub unsafe fn unlock_raw(&self) {
        if !self.holding() {
            panic!("release");
        }

        *self.cpu.get() = null_mut();
        core::sync::atomic::fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);

        pop_off();
    }

    /// Acquire the lock, returning a guard that releases it (and pops
    /// the interrupt gate) on drop. Use for any lock whose critical
    /// section does not cross a context switch.
    pub fn lock(&self) -> SpinlockGuard<'_> {
        unsafe {
            self.lock_raw();
        }
        SpinlockGuard { lock: self }
    }
}

/// RAII guard returned by `Spinlock::lock`.
pub struct SpinlockGuard<'l> {
    pub(crate) lock: &'l Spinlock,
}
impl<'l> Drop for SpinlockGuard<'l> {
    fn drop(&mut self) {
        unsafe { self.lock.unlock_raw() }
    }
}
impl<'l> SpinlockGuard<'l> {
    /// Atomically release this lock and block on `chan` until some
    /// other CPU calls `wakeup(chan)`, then reacquire it.
    ///
    /// This is the `lk` parameter of spec.md's `sleep(chan, lk)`: the
    /// lock guarding the condition being waited on, which must be
    /// held going in and comes back held on return so the caller
    /// never misses a wakeup between checking the condition and
    /// falling asleep.
    pub fn sleep(self, chan: *mut c_void) -> SpinlockGuard<'l> {
        unsafe { crate::proc::scheduler::sleep(chan, self) }
    }
}

/// `push_off`/`pop_off` are like `intr_off`/`intr_on` except matched:
/// it takes two `pop_off`s to undo two `push_off`s. If interrupts are
/// initially off, `push_off` followed by `pop_off` leaves them off.
pub unsafe fn push_off() {
    let old = crate::riscv::intr_get();
    let cpu = mycpu();

    crate::riscv::intr_off();
    if (*cpu).noff == 0 {
        (*cpu).intena = old;
    }
    (*cpu).noff += 1;
}

pub unsafe fn pop_off() {
    let cpu = mycpu();

    if crate::riscv::intr_get() {
        panic!("pop_off - interruptible");
    }
    if (*cpu).noff < 1 {
        panic!("pop_off");
    }

    (*cpu).noff -= 1;

    if (*cpu).noff == 0 && (*cpu).intena {
        crate::riscv::intr_on();
    }
}
