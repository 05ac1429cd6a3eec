//! Bounded byte-stream between processes, built on a spinlock plus
//! sleep/wakeup (spec.md §4.11). Grounded in the original `pipe.c`'s
//! cursor/open-flag bookkeeping: `nread`/`nwrite` only ever grow, and
//! the buffer index is their value modulo `PIPESIZE`.

use crate::{
    fs::file::{filealloc, fileclose, File, FileKind},
    mem::{frame, vm},
    proc::scheduler::{myproc, wakeup},
    sync::spinlock::Spinlock,
};
use core::ptr::{addr_of_mut, null_mut};

pub const PIPESIZE: usize = 512;

#[repr(C)]
pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    /// Total bytes read so far.
    nread: u32,
    /// Total bytes written so far.
    nwrite: u32,
    /// Read end is still open.
    readopen: bool,
    /// Write end is still open.
    writeopen: bool,
}

/// Allocate a pipe page and wire up a read/write pair of `File`
/// descriptors pointing at it. On any failure, nothing is left
/// allocated.
pub unsafe fn pipealloc(f0: *mut *mut File, f1: *mut *mut File) -> Result<(), ()> {
    *f0 = null_mut();
    *f1 = null_mut();

    let pipe: *mut Pipe = frame::alloc_zeroed().cast();
    if pipe.is_null() {
        return Err(());
    }
    addr_of_mut!((*pipe).lock).write(Spinlock::new("pipe"));
    (*pipe).readopen = true;
    (*pipe).writeopen = true;
    (*pipe).nwrite = 0;
    (*pipe).nread = 0;

    *f0 = alloc_pipe_end(pipe, true, false);
    *f1 = alloc_pipe_end(pipe, false, true);

    if (*f0).is_null() || (*f1).is_null() {
        if !(*f0).is_null() {
            fileclose(*f0);
        }
        if !(*f1).is_null() {
            fileclose(*f1);
        }
        frame::free(pipe.cast());
        return Err(());
    }

    Ok(())
}

unsafe fn alloc_pipe_end(pipe: *mut Pipe, readable: bool, writable: bool) -> *mut File {
    let f = filealloc();
    if f.is_null() {
        return null_mut();
    }
    (*f).kind = FileKind::Pipe;
    (*f).readable = readable;
    (*f).writable = writable;
    (*f).pipe = pipe;
    f
}

/// Close one end of the pipe. Once both ends are closed, the pipe
/// page itself is freed.
pub unsafe fn pipeclose(pipe: *mut Pipe, writable: bool) {
    let guard = (*pipe).lock.lock();

    if writable {
        (*pipe).writeopen = false;
        wakeup(addr_of_mut!((*pipe).nread).cast());
    } else {
        (*pipe).readopen = false;
        wakeup(addr_of_mut!((*pipe).nwrite).cast());
    }

    let both_closed = !(*pipe).readopen && !(*pipe).writeopen;
    drop(guard);

    if both_closed {
        frame::free(pipe.cast());
    }
}

/// Write `n` bytes from `addr` (user or kernel space, per `user_src`)
/// into the pipe, blocking while the buffer is full. Returns the
/// number of bytes written, or -1 if the read end closed or this
/// process was killed partway through.
pub unsafe fn pipewrite(pipe: *mut Pipe, addr: u64, n: i32, user_src: bool) -> i32 {
    let mut guard = (*pipe).lock.lock();
    let p = myproc();
    let mut written = 0;

    while written < n {
        if !(*pipe).readopen || (*p).killed {
            return -1;
        }

        if (*pipe).nwrite - (*pipe).nread == PIPESIZE as u32 {
            wakeup(addr_of_mut!((*pipe).nread).cast());
            guard = guard.sleep(addr_of_mut!((*pipe).nwrite).cast());
            continue;
        }

        let mut byte = 0u8;
        if vm::either_copyin(addr_of_mut!(byte).cast(), user_src, addr + written as u64, 1).is_err() {
            break;
        }

        let idx = (*pipe).nwrite as usize % PIPESIZE;
        (*pipe).data[idx] = byte;
        (*pipe).nwrite += 1;
        written += 1;
    }

    wakeup(addr_of_mut!((*pipe).nread).cast());
    drop(guard);
    written
}

/// Read up to `n` bytes into `addr`, blocking while the pipe is empty
/// and a writer remains. Returns the number of bytes actually read
/// (which may be less than `n`), or -1 if killed.
pub unsafe fn piperead(pipe: *mut Pipe, addr: u64, n: i32, user_dst: bool) -> i32 {
    let mut guard = (*pipe).lock.lock();
    let p = myproc();

    while (*pipe).nread == (*pipe).nwrite && (*pipe).writeopen {
        if (*p).killed {
            return -1;
        }
        guard = guard.sleep(addr_of_mut!((*pipe).nread).cast());
    }

    let mut read = 0;
    while read < n && (*pipe).nread < (*pipe).nwrite {
        let idx = (*pipe).nread as usize % PIPESIZE;
        let mut byte = (*pipe).data[idx];
        (*pipe).nread += 1;

        if vm::either_copyout(user_dst, addr + read as u64, addr_of_mut!(byte).cast(), 1).is_err() {
            break;
        }
        read += 1;
    }

    wakeup(addr_of_mut!((*pipe).nwrite).cast());
    drop(guard);
    read
}
