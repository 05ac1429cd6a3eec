//! Open file descriptor table and the device-switch table.
//!
//! The file system proper (inodes, the on-disk log, directories) is
//! out of scope here; this module keeps just enough of the teacher's
//! `struct file`/`devsw` shape to give `Proc::ofile` and `io::pipe`
//! something concrete to point at.

use super::inode::Inode;
use crate::{
    io::pipe::{piperead, pipewrite, Pipe},
    param::{NDEV, NFILE},
    sync::spinlock::Spinlock,
};
use core::ptr::{addr_of_mut, null_mut};

#[repr(C)]
pub struct Devsw {
    pub read: *const i32,
    pub write: *const i32,
}

extern "C" {
    pub static mut devsw: [Devsw; NDEV];
}

pub const CONSOLE: usize = 1;

#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    None,
    Pipe,
    Inode,
    Device,
}

/// An open file descriptor, shared by every process that inherited or
/// `dup`'d it. `references` is the only mutable field touched outside
/// a lock that isn't itself one of `pipe`/`ip`'s own locks.
#[repr(C)]
pub struct File {
    pub kind: FileKind,
    pub references: i32,
    pub readable: bool,
    pub writable: bool,
    pub pipe: *mut Pipe,
    pub ip: *mut Inode,
    pub off: u32,
    pub major: i16,
}

impl File {
    pub const fn empty() -> File {
        File {
            kind: FileKind::None,
            references: 0,
            readable: false,
            writable: false,
            pipe: null_mut(),
            ip: null_mut(),
            off: 0,
            major: 0,
        }
    }
}

static FTABLE_LOCK: Spinlock = Spinlock::new("ftable");
static mut FTABLE: [File; NFILE] = [const { File::empty() }; NFILE];

/// Claim an unused slot in the system-wide open file table, with
/// `references` already set to 1. Returns null if the table is full.
pub unsafe fn filealloc() -> *mut File {
    let _guard = FTABLE_LOCK.lock();
    for f in FTABLE.iter_mut() {
        if f.references == 0 {
            f.references = 1;
            return addr_of_mut!(*f);
        }
    }
    null_mut()
}

/// Increment `f`'s reference count, returning it unchanged.
pub unsafe fn filedup(f: *mut File) -> *mut File {
    if f.is_null() {
        return f;
    }
    (*f).references += 1;
    f
}

/// Drop a reference to `f`. Once the count reaches zero, tears down
/// whichever backing object the descriptor pointed at and clears the
/// slot.
pub unsafe fn fileclose(f: *mut File) {
    if f.is_null() {
        return;
    }

    let guard = FTABLE_LOCK.lock();
    (*f).references -= 1;
    if (*f).references > 0 {
        return;
    }
    let (kind, pipe, ip, writable) = ((*f).kind, (*f).pipe, (*f).ip, (*f).writable);
    *f = File::empty();
    drop(guard);

    match kind {
        FileKind::Pipe => crate::io::pipe::pipeclose(pipe, writable),
        FileKind::Inode | FileKind::Device => super::inode::iput(ip),
        FileKind::None => {}
    }
}

/// Read up to `n` bytes from `f` into the calling process's address
/// space at `addr`, dispatching on the descriptor's underlying kind.
/// Returns the number of bytes read, or -1 on error.
pub unsafe fn fileread(f: *mut File, addr: u64, n: i32) -> i32 {
    if !(*f).readable {
        return -1;
    }

    match (*f).kind {
        FileKind::Pipe => piperead((*f).pipe, addr, n, true),
        FileKind::Device => {
            if (*f).major as usize == CONSOLE {
                crate::console::consoleread(true, addr, n)
            } else {
                -1
            }
        }
        FileKind::Inode => {
            let ip = (*f).ip;
            let mut guard = (*ip).lock();
            let r = super::inode::readi(guard.inode, 1, addr, (*f).off, n as u32);
            if r > 0 {
                (*f).off += r as u32;
            }
            drop(guard);
            r
        }
        FileKind::None => -1,
    }
}

/// Write up to `n` bytes from `addr` in the calling process's address
/// space to `f`, dispatching on the descriptor's underlying kind.
/// Returns the number of bytes written, or -1 on error.
pub unsafe fn filewrite(f: *mut File, addr: u64, n: i32) -> i32 {
    if !(*f).writable {
        return -1;
    }

    match (*f).kind {
        FileKind::Pipe => pipewrite((*f).pipe, addr, n, true),
        FileKind::Device => {
            if (*f).major as usize == CONSOLE {
                crate::console::consolewrite(true, addr, n)
            } else {
                -1
            }
        }
        FileKind::Inode => {
            // Write a few blocks at a time to keep any single log
            // transaction within MAXOPBLOCKS.
            let max = ((crate::param::MAXOPBLOCKS - 1 - 1 - 2) / 2 * crate::fs::BSIZE as usize) as i32;
            let mut written = 0;
            while written < n {
                let chunk = core::cmp::min(n - written, max);
                crate::fs::log::begin_op();
                let ip = (*f).ip;
                let mut guard = (*ip).lock();
                let r = super::inode::writei(
                    guard.inode,
                    1,
                    addr + written as u64,
                    (*f).off,
                    chunk as u32,
                );
                if r > 0 {
                    (*f).off += r as u32;
                }
                drop(guard);
                crate::fs::log::end_op();

                if r != chunk {
                    break;
                }
                written += r;
            }
            if written == n {
                n
            } else {
                -1
            }
        }
        FileKind::None => -1,
    }
}

/// Populate `*st` (a user-space `struct stat` pointer) from `f`'s
/// underlying inode. Only `Inode`/`Device` descriptors have one.
pub unsafe fn filestat(f: *mut File, addr: u64) -> i32 {
    let p = crate::proc::scheduler::myproc();
    match (*f).kind {
        FileKind::Inode | FileKind::Device => {
            let ip = (*f).ip;
            let mut guard = (*ip).lock();
            let mut st = super::stat::Stat::default();
            super::inode::stati(guard.inode, addr_of_mut!(st));
            drop(guard);
            if crate::mem::vm::copyout(
                (*p).pagetable,
                addr,
                addr_of_mut!(st).cast(),
                core::mem::size_of::<super::stat::Stat>() as u64,
            )
            .is_ok()
            {
                0
            } else {
                -1
            }
        }
        _ => -1,
    }
}
