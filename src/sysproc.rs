//! Process-management syscall bodies (spec.md §4.6–§4.9): fork, exit,
//! wait, kill, getpid, sbrk, sleep, uptime.

use crate::mem::vm;
use crate::proc::process::Process;
use crate::proc::scheduler::{kill, myproc};
use crate::syscall::{argaddr, argint};
use crate::trap::{clock_chan, clock_ticks, CLOCK_TICKS_LOCK};

pub unsafe fn sys_fork() -> u64 {
    match Process::fork() {
        Ok(pid) => pid as u64,
        Err(_) => (-1i64) as u64,
    }
}

pub unsafe fn sys_exit() -> u64 {
    let mut n = 0i32;
    argint(0, &mut n);
    Process::current().expect("sys_exit: no current process").exit(n)
}

pub unsafe fn sys_wait() -> u64 {
    let mut addr = 0u64;
    argaddr(0, &mut addr);
    let p = Process::current().expect("sys_wait: no current process");
    match p.wait_for_child(addr) {
        Ok(pid) => pid as u64,
        Err(_) => (-1i64) as u64,
    }
}

pub unsafe fn sys_getpid() -> u64 {
    (*myproc()).pid as u64
}

/// Grow or shrink the calling process's address space by `n` bytes
/// (negative to shrink); returns the previous size, or -1 on failure.
pub unsafe fn sys_sbrk() -> u64 {
    let mut n = 0i32;
    argint(0, &mut n);

    let p = Process::current().expect("sys_sbrk: no current process");
    let old_size = p.memory_allocated;

    let result = if n >= 0 {
        vm::uvmalloc(p.pagetable, old_size, old_size + n as u64, crate::riscv::PTE_W)
            .map(|new_size| {
                p.memory_allocated = new_size;
            })
    } else {
        let new_size = old_size.saturating_sub((-n) as u64);
        p.memory_allocated = vm::uvmdealloc(p.pagetable, old_size, new_size);
        Ok(())
    };

    match result {
        Ok(()) => old_size,
        Err(_) => (-1i64) as u64,
    }
}

pub unsafe fn sys_sleep() -> u64 {
    let mut n = 0i32;
    argint(0, &mut n);

    let mut guard = CLOCK_TICKS_LOCK.lock();
    let target = clock_ticks() + n as u64;
    while clock_ticks() < target {
        if Process::current().map(|p| p.is_killed()).unwrap_or(false) {
            return (-1i64) as u64;
        }
        guard = guard.sleep(clock_chan());
    }
    0
}

pub unsafe fn sys_kill() -> u64 {
    let mut pid = 0i32;
    argint(0, &mut pid);
    kill(pid) as u64
}

/// How many clock-tick interrupts have fired since boot.
pub unsafe fn sys_uptime() -> u64 {
    clock_ticks()
}
