//! Trap dispatch: the safe-Rust side of trampoline.S (spec.md §8 —
//! external collaborator, kept thin). Decides what kind of trap fired
//! and routes it to the scheduler, the syscall dispatcher, or the
//! device interrupt handlers.

use crate::console::println;
use crate::mem::vm::uvm_handle_page_fault;
use crate::proc::cpu::cpuid;
use crate::proc::process::Process;
use crate::proc::scheduler::{r#yield, wakeup};
use crate::riscv::plic::{plic_claim, plic_complete};
use crate::riscv::{
    asm::*,
    memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ},
    make_satp, PGSIZE, SSTATUS_SPIE, SSTATUS_SPP,
};
use crate::sync::spinlock::Spinlock;
use core::ptr::addr_of;

extern "C" {
    pub fn kernelvec();
    pub static mut trampoline: [u8; 0];
    pub static mut uservec: [u8; 0];
    pub static mut userret: [u8; 0];
    fn virtio_disk_intr();
}

/// Guards `CLOCK_TICKS_VALUE`; also doubles as the wait channel that
/// `sys_sleep` blocks on and `clockintr`'s `wakeup` targets.
pub static CLOCK_TICKS_LOCK: Spinlock = Spinlock::new("ticks");
static mut CLOCK_TICKS_VALUE: u64 = 0;

/// Address identifying the tick counter as a sleep/wakeup channel.
pub fn clock_chan() -> *mut core::ffi::c_void {
    addr_of!(CLOCK_TICKS_LOCK).cast_mut().cast()
}

/// Number of timer interrupts since boot. Racy without the lock held,
/// same as the counter it mirrors.
pub unsafe fn clock_ticks() -> u64 {
    CLOCK_TICKS_VALUE
}

/// Set up to take exceptions and traps while in the kernel.
pub unsafe fn trapinithart() {
    w_stvec(kernelvec as usize as u64);
}

pub unsafe fn clockintr() {
    let _guard = CLOCK_TICKS_LOCK.lock();
    CLOCK_TICKS_VALUE += 1;
    wakeup(clock_chan());
}

/// Check whether this is a device interrupt and handle it.
///
/// Returns 2 if timer interrupt, 1 if other device, 0 if not recognized.
pub unsafe fn devintr() -> i32 {
    let scause = r_scause();

    if (scause & 0x8000000000000000 != 0) && (scause & 0xff) == 9 {
        let irq = plic_claim();

        if irq == UART0_IRQ {
            crate::console::uart::UART0.interrupt();
        } else if irq == VIRTIO0_IRQ {
            virtio_disk_intr();
        } else if irq > 0 {
            println!("unexpected interrupt irq={}", irq);
        }

        if irq > 0 {
            plic_complete(irq);
        }

        1
    } else if scause == 0x8000000000000001 {
        if cpuid() == 0 {
            clockintr();
        }
        w_sip(r_sip() & !2);
        2
    } else {
        0
    }
}

/// Return to user space: the Rust half of `usertrapret`/`userret`.
#[no_mangle]
pub unsafe extern "C" fn usertrapret() {
    let proc = Process::current().expect("usertrapret: no current process");

    intr_off();

    let trampoline_uservec =
        TRAMPOLINE + (addr_of!(uservec) as u64) - (addr_of!(trampoline) as u64);
    w_stvec(trampoline_uservec);

    (*proc.trapframe).kernel_satp = r_satp();
    (*proc.trapframe).kernel_sp = proc.kernel_stack + PGSIZE;
    (*proc.trapframe).kernel_trap = usertrap as usize as u64;
    (*proc.trapframe).kernel_hartid = r_tp();

    let mut x = r_sstatus();
    x &= !SSTATUS_SPP;
    x |= SSTATUS_SPIE;
    w_sstatus(x);

    w_sepc((*proc.trapframe).epc);

    let satp = make_satp(proc.pagetable);

    let trampoline_userret =
        (TRAMPOLINE + (addr_of!(userret) as u64) - (addr_of!(trampoline) as u64)) as usize;
    let trampoline_userret: fn(u64) =
        core::mem::transmute::<usize, fn(u64)>(trampoline_userret);
    trampoline_userret(satp)
}

/// Interrupts and exceptions from kernel code land here via
/// `kernelvec`, on whatever the current kernel stack is.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = r_sstatus();
    let scause = r_scause();

    if sstatus & SSTATUS_SPP == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    let which_dev = devintr();
    if which_dev == 0 {
        println!("scause {}\nsepc={} stval={}", scause, r_sepc(), r_stval());
        panic!("kerneltrap");
    } else if which_dev == 2 {
        if let Some(p) = Process::current() {
            if p.state == crate::proc::process::ProcessState::Running {
                r#yield();
            }
        }
    }

    w_sepc(sepc);
    w_sstatus(sstatus);
}

/// Handle an interrupt, exception, or system call from userspace.
/// Reached from trampoline.S's `uservec`.
#[no_mangle]
pub unsafe extern "C" fn usertrap() {
    if r_sstatus() & SSTATUS_SPP != 0 {
        panic!("usertrap: not from user mode");
    }

    w_stvec(kernelvec as usize as u64);

    let proc = Process::current().expect("usertrap: no current process");
    (*proc.trapframe).epc = r_sepc();

    if r_scause() == 8 {
        if proc.is_killed() {
            proc.exit(-1);
        }

        (*proc.trapframe).epc += 4;
        intr_on();

        crate::syscall::syscall();
    } else {
        let which_dev = devintr();
        if which_dev == 0 {
            let fault_va = r_stval();
            if uvm_handle_page_fault(proc.pagetable, fault_va).is_err() {
                println!(
                    "usertrap(): unexpected scause {} pid={}\n\tsepc={} stval={}",
                    r_scause(),
                    proc.pid,
                    r_sepc(),
                    r_stval()
                );
                proc.set_killed();
            }
        }

        if proc.is_killed() {
            proc.exit(-1);
        }

        if which_dev == 2 {
            r#yield();
        }
    }

    usertrapret();
}
