//! Per-hardware-thread (hart) state.

use super::{context::Context, process::Process};
use crate::{param::NCPU, riscv};
use core::ptr::{addr_of_mut, null_mut};

/// One entry per hart. Indexed by `cpuid()`.
#[no_mangle]
pub static mut cpus: [Cpu; NCPU] = [Cpu::new(); NCPU];

/// Per-CPU state.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Cpu {
    /// The process running on this cpu, or null if none.
    pub proc: *mut Process,
    /// `swtch()` switches here to enter the scheduler loop.
    pub context: Context,
    /// Depth of `push_off()` nesting.
    pub noff: i32,
    /// Were interrupts enabled before the outermost `push_off()`?
    pub intena: bool,
}
impl Cpu {
    pub const fn new() -> Cpu {
        Cpu {
            proc: null_mut(),
            context: Context::new(),
            noff: 0,
            intena: false,
        }
    }
}
impl Default for Cpu {
    fn default() -> Self {
        Cpu::new()
    }
}
impl Cpu {
    /// This hart's `Cpu` record. Disables interrupts for the duration
    /// of the lookup to avoid a race against being moved to another
    /// hart, the way `Spinlock::lock_raw`'s `push_off` does.
    pub fn current() -> &'static mut Cpu {
        unsafe {
            crate::sync::spinlock::push_off();
            let c = &mut *mycpu();
            crate::sync::spinlock::pop_off();
            c
        }
    }
}

/// Which hart is this? Must be called with interrupts disabled, to
/// prevent a race with the process being moved to a different CPU.
#[inline(always)]
pub unsafe fn cpuid() -> usize {
    riscv::r_tp() as usize
}

/// Return this CPU's `Cpu` record. Interrupts must be disabled.
#[no_mangle]
pub unsafe extern "C" fn mycpu() -> *mut Cpu {
    let id = cpuid();
    addr_of_mut!(cpus[id])
}
