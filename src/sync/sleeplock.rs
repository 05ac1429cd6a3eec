//! Long-held locks that block via sleep/wakeup instead of spinning
//! (spec.md §4.10).

use super::spinlock::Spinlock;
use crate::proc::scheduler::{myproc_pid, wakeup};
use core::{
    cell::UnsafeCell,
    ptr::addr_of,
    sync::atomic::{AtomicBool, Ordering},
};

pub struct Sleeplock {
    locked: AtomicBool,
    /// Spins briefly while contending for `locked`/`pid`; never held
    /// across the process's own sleep.
    backing: Spinlock,
    name: &'static str,
    pid: UnsafeCell<i32>,
}
unsafe impl Sync for Sleeplock {}

impl Sleeplock {
    pub const fn new(name: &'static str) -> Sleeplock {
        Sleeplock {
            locked: AtomicBool::new(false),
            backing: Spinlock::new("sleeplock"),
            name,
            pid: UnsafeCell::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spins on the backing spinlock, then sleeps on the lock's own
    /// address while another holder is present.
    pub unsafe fn lock_unguarded(&self) {
        let mut guard = self.backing.lock();
        while self.locked.load(Ordering::Relaxed) {
            guard = guard.sleep(addr_of!(*self).cast_mut().cast());
        }
        self.locked.store(true, Ordering::Release);
        *self.pid.get() = myproc_pid();
    }

    pub fn lock(&self) -> SleeplockGuard<'_> {
        unsafe {
            self.lock_unguarded();
        }
        SleeplockGuard { lock: self }
    }

    pub unsafe fn unlock(&self) {
        let _guard = self.backing.lock();
        self.locked.store(false, Ordering::Release);
        *self.pid.get() = 0;
        wakeup(addr_of!(*self).cast_mut().cast());
    }

    /// True iff this CPU's current process holds the lock.
    pub unsafe fn holding(&self) -> bool {
        let _guard = self.backing.lock();
        self.locked.load(Ordering::Relaxed) && *self.pid.get() == myproc_pid()
    }
}

pub struct SleeplockGuard<'l> {
    lock: &'l Sleeplock,
}
impl<'l> Drop for SleeplockGuard<'l> {
    fn drop(&mut self) {
        unsafe { self.lock.unlock() }
    }
}
