//! The process table (spec.md §3, §4.6) and the lifecycle operations
//! that mutate it: allocation, `fork`, `exit`, `wait`, `kill`.

use super::{context::Context, cpu::Cpu, scheduler::wakeup, trapframe::Trapframe};
use crate::{
    fs::file::{fileclose, filedup, File},
    fs::inode::{iput, Inode},
    mem::{frame, vm},
    param::{NOFILE, NPROC},
    riscv::{Pagetable, PGSIZE, PTE_W},
    sync::spinlock::Spinlock,
};
use core::{
    ffi::c_void,
    ptr::{addr_of, addr_of_mut, null_mut},
    sync::atomic::{AtomicI32, Ordering},
};

pub static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Helps ensure that wakeups of `wait()`ing parents are not lost, and
/// obeys the memory model when touching `Process::parent`. Acquired
/// before any individual process's `lock`, never after (spec.md §4.9
/// lock ordering).
pub static WAIT_LOCK: Spinlock = Spinlock::new("wait_lock");

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProcessState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessError {
    MaxProcesses,
    Allocation,
    NoChildren,
    Killed,
    PageError,
}

/// Per-process state. Each process owns its own `lock`; there is no
/// table-wide lock, so the table is scanned lock-free and decisions
/// about a given slot are made under that slot's own lock.
#[repr(C)]
pub struct Process {
    pub lock: Spinlock,

    // Guarded by `lock`.
    pub state: ProcessState,
    /// Non-null while sleeping: the wait channel this process is
    /// blocked on, an opaque address used only for identity.
    pub chan: *mut c_void,
    pub killed: bool,
    /// Exit status, readable by the parent's `wait` once `Zombie`.
    pub exit_status: i32,
    pub pid: i32,

    // Guarded by `WAIT_LOCK`.
    pub parent: *mut Process,

    // Private to the process; no lock needed.
    pub kernel_stack: u64,
    pub memory_allocated: u64,
    pub pagetable: Pagetable,
    pub trapframe: *mut Trapframe,
    pub context: Context,
    pub open_files: [*mut File; NOFILE],
    pub current_dir: *mut Inode,
    pub name: [u8; 16],
}

/// One-time setup of the process table: gives every slot the fixed
/// kernel-stack virtual address `vm::proc_mapstacks` mapped for it in
/// the kernel page table (spec.md §3: "kstack ... fixed at init").
/// Must run after `vm::kvminit` and before the first `Process::alloc`.
pub unsafe fn procinit() {
    for (i, p) in PROC.iter_mut().enumerate() {
        p.kernel_stack = crate::riscv::memlayout::kstack(i as u64);
    }
}

impl Process {
    pub const fn new() -> Process {
        Process {
            lock: Spinlock::new("proc"),
            state: ProcessState::Unused,
            chan: null_mut(),
            killed: false,
            exit_status: 0,
            pid: 0,
            parent: null_mut(),
            kernel_stack: 0,
            memory_allocated: 0,
            pagetable: null_mut(),
            trapframe: null_mut(),
            context: Context::new(),
            open_files: [null_mut(); NOFILE],
            current_dir: null_mut(),
            name: [0; 16],
        }
    }

    /// The current hart's running process, or `None` outside of one.
    pub fn current() -> Option<&'static mut Process> {
        let p = Cpu::current().proc;
        if p.is_null() {
            None
        } else {
            unsafe { Some(&mut *p) }
        }
    }

    pub fn is_current(&self) -> bool {
        addr_of!(*self).cast_mut() == Cpu::current().proc
    }

    fn alloc_pid() -> i32 {
        NEXT_PID.fetch_add(1, Ordering::Relaxed)
    }

    /// Scan the table for an `Unused` slot. On success, initializes
    /// the kernel-only state (pid, trapframe, empty page table, saved
    /// context pointed at `forkret`) and returns it with `lock` held
    /// via the raw escape hatch — the caller owns the matching
    /// `unlock_raw`.
    pub unsafe fn alloc() -> Result<&'static mut Process, ProcessError> {
        let mut found: Option<usize> = None;
        for (i, p) in PROC.iter_mut().enumerate() {
            p.lock.lock_raw();
            if p.state == ProcessState::Unused {
                found = Some(i);
                break;
            }
            p.lock.unlock_raw();
        }
        let Some(index) = found else {
            return Err(ProcessError::MaxProcesses);
        };

        let p: &mut Process = &mut PROC[index];
        p.pid = Process::alloc_pid();
        p.state = ProcessState::Used;

        p.trapframe = frame::alloc_zeroed().cast();
        if p.trapframe.is_null() {
            p.free();
            p.lock.unlock_raw();
            return Err(ProcessError::Allocation);
        }

        p.pagetable = match p.alloc_pagetable() {
            Ok(pt) => pt,
            Err(e) => {
                p.free();
                p.lock.unlock_raw();
                return Err(e);
            }
        };

        p.context = Context::new();
        p.context.ra = super::scheduler::forkret as usize as u64;
        p.context.sp = p.kernel_stack + PGSIZE;

        Ok(p)
    }

    /// Free a proc structure and the data hanging from it, including
    /// its user pages. `self.lock` must be held.
    pub unsafe fn free(&mut self) {
        if !self.trapframe.is_null() {
            frame::free(self.trapframe.cast());
        }
        self.trapframe = null_mut();
        if !self.pagetable.is_null() {
            Process::free_pagetable(self.pagetable, self.memory_allocated);
        }
        self.pagetable = null_mut();
        self.memory_allocated = 0;
        self.pid = 0;
        self.parent = null_mut();
        self.name[0] = 0;
        self.chan = null_mut();
        self.killed = false;
        self.exit_status = 0;
        self.state = ProcessState::Unused;
    }

    /// Grow or shrink user memory by `num_bytes`.
    pub unsafe fn grow_memory(&mut self, num_bytes: i64) -> Result<(), ProcessError> {
        let mut size = self.memory_allocated;

        if num_bytes > 0 {
            size = vm::uvmalloc(self.pagetable, size, size + num_bytes as u64, PTE_W)
                .map_err(|_| ProcessError::Allocation)?;
        } else if num_bytes < 0 {
            size = vm::uvmdealloc(self.pagetable, size, (size as i64 + num_bytes) as u64);
        }

        self.memory_allocated = size;
        Ok(())
    }

    /// Create a user page table with no user memory, but with the
    /// trampoline and trapframe pages mapped.
    pub unsafe fn alloc_pagetable(&mut self) -> Result<Pagetable, ProcessError> {
        vm::proc_pagetable(self.trapframe).ok_or(ProcessError::Allocation)
    }

    /// Free a process's page table and the physical memory it maps.
    pub unsafe fn free_pagetable(pagetable: Pagetable, size: u64) {
        vm::proc_freepagetable(pagetable, size)
    }

    /// Create a new process, copying the parent's memory (copy-on-write)
    /// and open files. Sets up the child so its `fork` syscall returns 0.
    pub unsafe fn fork() -> Result<i32, ProcessError> {
        let parent = Process::current().expect("fork: no current process");
        let child = Process::alloc()?;

        if vm::uvmcopy(parent.pagetable, child.pagetable, parent.memory_allocated).is_err() {
            child.free();
            child.lock.unlock_raw();
            return Err(ProcessError::Allocation);
        }
        child.memory_allocated = parent.memory_allocated;

        *child.trapframe = (*parent.trapframe).clone();
        (*child.trapframe).a0 = 0;

        for (slot, file) in child.open_files.iter_mut().zip(parent.open_files.iter()) {
            if !file.is_null() {
                *slot = filedup(*file);
            }
        }
        child.current_dir = if parent.current_dir.is_null() {
            null_mut()
        } else {
            iput_dup(parent.current_dir)
        };
        child.name = parent.name;

        let pid = child.pid;
        child.lock.unlock_raw();

        {
            let _guard = WAIT_LOCK.lock();
            child.parent = addr_of!(*parent).cast_mut();
        }

        child.lock.lock_raw();
        child.state = ProcessState::Runnable;
        child.lock.unlock_raw();

        Ok(pid)
    }

    /// Hand p's children to init. Caller must hold `WAIT_LOCK`.
    pub unsafe fn reparent(&self) {
        for p in PROC.iter_mut() {
            if p.parent == addr_of!(*self).cast_mut() {
                p.parent = INITPROC;
                wakeup(INITPROC.cast());
            }
        }
    }

    /// Exit the current process. Never returns. An exited process
    /// remains a `Zombie` until its parent calls `wait`.
    pub unsafe fn exit(&mut self, status: i32) -> ! {
        if addr_of_mut!(*self) == INITPROC {
            panic!("init exiting");
        }

        for file in self.open_files.iter_mut() {
            if !file.is_null() {
                fileclose(*file);
                *file = null_mut();
            }
        }

        if !self.current_dir.is_null() {
            crate::fs::log::begin_op();
            iput(self.current_dir);
            crate::fs::log::end_op();
        }
        self.current_dir = null_mut();

        let wlock = WAIT_LOCK.lock();

        self.reparent();
        wakeup(self.parent.cast());

        self.lock.lock_raw();
        self.exit_status = status;
        self.state = ProcessState::Zombie;

        drop(wlock);

        super::scheduler::sched_raw();
        unreachable!("a zombie process resumed");
    }

    /// Wait for a child to exit, writing its exit status to `addr` in
    /// this process's user memory (if non-zero), and return its pid.
    pub unsafe fn wait_for_child(&mut self, addr: u64) -> Result<i32, ProcessError> {
        let mut guard = WAIT_LOCK.lock();

        loop {
            let mut has_children = false;

            for p in PROC.iter_mut() {
                if p.parent != addr_of_mut!(*self) {
                    continue;
                }
                has_children = true;

                p.lock.lock_raw();

                if p.state == ProcessState::Zombie {
                    let pid = p.pid;

                    if addr != 0
                        && vm::copyout(
                            self.pagetable,
                            addr,
                            addr_of_mut!(p.exit_status).cast(),
                            core::mem::size_of::<i32>() as u64,
                        )
                        .is_err()
                    {
                        p.lock.unlock_raw();
                        return Err(ProcessError::PageError);
                    }

                    p.free();
                    p.lock.unlock_raw();
                    return Ok(pid);
                }

                p.lock.unlock_raw();
            }

            if !has_children || self.is_killed() {
                return Err(if has_children {
                    ProcessError::Killed
                } else {
                    ProcessError::NoChildren
                });
            }

            guard = guard.sleep(addr_of_mut!(*self).cast());
        }
    }

    /// Kill the process with the given pid. Returns true if found.
    /// The victim does not actually exit until it next tries to
    /// return to user space.
    pub unsafe fn kill(pid: i32) -> bool {
        for p in PROC.iter_mut() {
            let guard = p.lock.lock();

            if p.pid == pid {
                p.killed = true;
                if p.state == ProcessState::Sleeping {
                    p.state = ProcessState::Runnable;
                }
                return true;
            }

            drop(guard);
        }
        false
    }

    pub fn is_killed(&self) -> bool {
        let _guard = self.lock.lock();
        self.killed
    }

    pub fn set_killed(&mut self) {
        let _guard = self.lock.lock();
        self.killed = true;
    }
}
impl Default for Process {
    fn default() -> Self {
        Process::new()
    }
}

unsafe fn iput_dup(ip: *mut Inode) -> *mut Inode {
    (*ip).references += 1;
    ip
}

#[no_mangle]
pub static mut PROC: [Process; NPROC] = [const { Process::new() }; NPROC];

/// pid 1, the ancestor of every process, spawned once by `userinit`.
pub static mut INITPROC: *mut Process = null_mut();

/// The hard-coded first user program (spec.md §6): loads its own
/// argument list and calls `exec("/init")`. Assembled from the
/// original xv6 `initcode.S`, this is an opaque byte blob to the
/// kernel, copied verbatim into the new process's address space.
#[rustfmt::skip]
static INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00,
    0x93, 0x85, 0x35, 0x02, 0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00,
    0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00, 0xef, 0xf0, 0x9f, 0xff,
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Set up the very first user process: a single page mapped with
/// `INITCODE` at VA 0, ready to run `exec("/init")`.
pub unsafe fn userinit() {
    let p = Process::alloc().expect("userinit: out of process slots");
    INITPROC = addr_of_mut!(*p);

    vm::uvmfirst(p.pagetable, &INITCODE);
    p.memory_allocated = PGSIZE;

    let tf = &mut *p.trapframe;
    tf.epc = 0;
    tf.sp = PGSIZE;

    p.name[..9].copy_from_slice(b"initcode\0");
    p.current_dir = null_mut();

    p.state = ProcessState::Runnable;
    p.lock.unlock_raw();
}

/// Print a process listing to console for debugging. No lock, so as
/// not to wedge an already-stuck machine further.
pub unsafe fn procdump() {
    crate::uprintln!("\nprocdump:");
    for p in PROC.iter() {
        if p.state != ProcessState::Unused {
            crate::uprintln!("    {}: {:?}", p.pid, p.state);
        }
    }
}
