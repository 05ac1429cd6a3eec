//! System call argument fetching and dispatch (spec.md §6, §8). The
//! process-management calls (`fork`/`exit`/`wait`/`kill`/`getpid`/
//! `sbrk`/`sleep`/`uptime`) live in `sysproc`; everything that touches
//! the file system or a file descriptor is dispatched from here.

use crate::{
    console::println,
    fs::{
        file::{self, File},
        inode,
        log as fslog,
        stat::StatType,
    },
    mem::vm::{copyin, copyinstr},
    param::{MAXPATH, NOFILE},
    proc::{process::Process, scheduler::myproc},
    riscv::memlayout::QEMU_POWER,
    string::strlen,
    sysproc,
};
use core::{
    mem::size_of,
    ptr::{addr_of_mut, null_mut},
};

extern "C" {
    fn sys_pipe() -> u64;
    fn sys_exec() -> u64;
    fn sys_open() -> u64;
    fn sys_mknod() -> u64;
    fn sys_unlink() -> u64;
    fn sys_link() -> u64;
    fn sys_mkdir() -> u64;
}

pub enum Syscall {
    Fork,
    Exit,
    Wait,
    Pipe,
    Read,
    Kill,
    Exec,
    Fstat,
    Chdir,
    Dup,
    Getpid,
    Sbrk,
    Sleep,
    Uptime,
    Open,
    Write,
    Mknod,
    Unlink,
    Link,
    Mkdir,
    Close,
    Shutdown,
}

impl Syscall {
    pub unsafe fn call(&self) -> u64 {
        match self {
            Syscall::Fork => sysproc::sys_fork(),
            Syscall::Exit => sysproc::sys_exit(),
            Syscall::Wait => sysproc::sys_wait(),
            Syscall::Pipe => sys_pipe(),
            Syscall::Read => {
                let mut f: *mut File = null_mut();
                let mut addr: u64 = 0;
                let mut n: i32 = 0;

                if argfd(0, null_mut(), addr_of_mut!(f)) >= 0 {
                    argaddr(1, addr_of_mut!(addr));
                    argint(2, addr_of_mut!(n));
                    file::fileread(f, addr, n) as i64 as u64
                } else {
                    (-1i64) as u64
                }
            }
            Syscall::Kill => sysproc::sys_kill(),
            Syscall::Exec => sys_exec(),
            Syscall::Fstat => {
                let mut f: *mut File = null_mut();
                // User pointer to struct stat.
                let mut addr: u64 = 0;

                if argfd(0, null_mut(), addr_of_mut!(f)) >= 0 {
                    argaddr(1, addr_of_mut!(addr));
                    file::filestat(f, addr) as i64 as u64
                } else {
                    (-1i64) as u64
                }
            }
            Syscall::Chdir => sys_chdir(),
            Syscall::Dup => {
                let mut f: *mut File = null_mut();

                if argfd(0, null_mut(), addr_of_mut!(f)) < 0 {
                    return (-1i64) as u64;
                }

                let Ok(fd) = fdalloc(f) else {
                    return (-1i64) as u64;
                };

                file::filedup(f);
                fd as u64
            }
            Syscall::Getpid => sysproc::sys_getpid(),
            Syscall::Sbrk => sysproc::sys_sbrk(),
            Syscall::Sleep => sysproc::sys_sleep(),
            Syscall::Uptime => sysproc::sys_uptime(),
            Syscall::Open => sys_open(),
            Syscall::Write => {
                let mut f: *mut File = null_mut();
                let mut addr: u64 = 0;
                let mut n: i32 = 0;

                if argfd(0, null_mut(), addr_of_mut!(f)) >= 0 {
                    argaddr(1, addr_of_mut!(addr));
                    argint(2, addr_of_mut!(n));
                    file::filewrite(f, addr, n) as i64 as u64
                } else {
                    (-1i64) as u64
                }
            }
            Syscall::Mknod => sys_mknod(),
            Syscall::Unlink => sys_unlink(),
            Syscall::Link => sys_link(),
            Syscall::Mkdir => sys_mkdir(),
            Syscall::Close => {
                let mut fd: i32 = 0;
                let mut f: *mut File = null_mut();

                if argfd(0, addr_of_mut!(fd), addr_of_mut!(f)) >= 0 {
                    let p = Process::current().expect("close: no current process");
                    p.open_files[fd as usize] = null_mut();
                    file::fileclose(f);
                    0
                } else {
                    (-1i64) as u64
                }
            }
            Syscall::Shutdown => {
                let reg = QEMU_POWER as *mut u32;
                reg.write_volatile(0x5555);
                panic!("shutdown");
            }
        }
    }
}

/// `chdir(path)`: swap the calling process's current directory for
/// the inode named by `path`, inside its own log transaction since it
/// touches `iput` on the old directory.
unsafe fn sys_chdir() -> u64 {
    let mut path = [0u8; MAXPATH];
    let p = Process::current().expect("chdir: no current process");

    fslog::begin_op();

    if argstr(0, addr_of_mut!(path).cast(), path.len() as i32) < 0 {
        fslog::end_op();
        return (-1i64) as u64;
    }

    let ip = inode::namei(addr_of_mut!(path).cast());
    if ip.is_null() {
        fslog::end_op();
        return (-1i64) as u64;
    }

    inode::ilock(ip);
    if (*ip).kind != StatType::Directory as i16 {
        inode::iunlock(ip);
        inode::iput(ip);
        fslog::end_op();
        return (-1i64) as u64;
    }
    inode::iunlock(ip);
    inode::iput(p.current_dir);
    p.current_dir = ip;
    fslog::end_op();
    0
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> core::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            4 => Ok(Syscall::Pipe),
            5 => Ok(Syscall::Read),
            6 => Ok(Syscall::Kill),
            7 => Ok(Syscall::Exec),
            8 => Ok(Syscall::Fstat),
            9 => Ok(Syscall::Chdir),
            10 => Ok(Syscall::Dup),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            15 => Ok(Syscall::Open),
            16 => Ok(Syscall::Write),
            17 => Ok(Syscall::Mknod),
            18 => Ok(Syscall::Unlink),
            19 => Ok(Syscall::Link),
            20 => Ok(Syscall::Mkdir),
            21 => Ok(Syscall::Close),
            22 => Ok(Syscall::Shutdown),
            _ => Err(()),
        }
    }
}

impl From<Syscall> for usize {
    fn from(syscall: Syscall) -> usize {
        match syscall {
            Syscall::Fork => 1,
            Syscall::Exit => 2,
            Syscall::Wait => 3,
            Syscall::Pipe => 4,
            Syscall::Read => 5,
            Syscall::Kill => 6,
            Syscall::Exec => 7,
            Syscall::Fstat => 8,
            Syscall::Chdir => 9,
            Syscall::Dup => 10,
            Syscall::Getpid => 11,
            Syscall::Sbrk => 12,
            Syscall::Sleep => 13,
            Syscall::Uptime => 14,
            Syscall::Open => 15,
            Syscall::Write => 16,
            Syscall::Mknod => 17,
            Syscall::Unlink => 18,
            Syscall::Link => 19,
            Syscall::Mkdir => 20,
            Syscall::Close => 21,
            Syscall::Shutdown => 22,
        }
    }
}

/// Fetch the u64 at `addr` from the current process's address space.
#[no_mangle]
pub unsafe extern "C" fn fetchaddr(addr: u64, ip: *mut u64) -> i32 {
    let p = Process::current().expect("fetchaddr: no current process");

    // Both tests needed, in case of overflow.
    if addr >= p.memory_allocated
        || addr + size_of::<u64>() as u64 > p.memory_allocated
        || copyin(p.pagetable, ip.cast(), addr, size_of::<u64>() as u64).is_err()
    {
        -1
    } else {
        0
    }
}

/// Fetch the null-terminated string at `addr` from the current
/// process's address space.
///
/// Returns the length of the string, not including the null, or -1
/// on error.
#[no_mangle]
pub unsafe extern "C" fn fetchstr(addr: u64, buf: *mut u8, max: i32) -> i32 {
    let p = Process::current().expect("fetchstr: no current process");
    if copyinstr(p.pagetable, buf, addr, max as u64).is_err() {
        -1
    } else {
        strlen(buf.cast())
    }
}

/// Allocate a file descriptor for `f` in the calling process's table.
/// Takes over the caller's reference to `f` on success.
unsafe fn fdalloc(f: *mut File) -> Result<usize, ()> {
    let p = Process::current().expect("fdalloc: no current process");
    for fd in 0..NOFILE {
        if p.open_files[fd].is_null() {
            p.open_files[fd] = f;
            return Ok(fd);
        }
    }
    Err(())
}

unsafe fn argraw(n: usize) -> u64 {
    let p = &*(myproc());
    match n {
        0 => (*p.trapframe).a0,
        1 => (*p.trapframe).a1,
        2 => (*p.trapframe).a2,
        3 => (*p.trapframe).a3,
        4 => (*p.trapframe).a4,
        5 => (*p.trapframe).a5,
        _ => panic!("argraw"),
    }
}

/// Fetch the n-th 32-bit syscall argument.
#[no_mangle]
pub unsafe extern "C" fn argint(n: i32, ip: *mut i32) {
    *ip = argraw(n as usize) as i32;
}

/// Retrieve the n-th syscall argument as a raw pointer.
///
/// Doesn't check for legality, since `copyin`/`copyout` will do that.
#[no_mangle]
pub unsafe extern "C" fn argaddr(n: i32, ip: *mut u64) {
    *ip = argraw(n as usize);
}

/// Fetch the n-th word-sized syscall argument as a file descriptor,
/// returning both the descriptor and the `File` it names.
#[no_mangle]
pub unsafe extern "C" fn argfd(n: i32, fd_out: *mut i32, file_out: *mut *mut File) -> i32 {
    let fd = argraw(n as usize) as usize;
    if fd >= NOFILE {
        return -1;
    }

    let p = &*(myproc());
    let f = p.open_files[fd];
    if f.is_null() {
        return -1;
    }

    if !fd_out.is_null() {
        *fd_out = fd as i32;
    }
    if !file_out.is_null() {
        *file_out = f;
    }
    0
}

/// Fetch the n-th word-sized syscall argument as a null-terminated
/// string, copying at most `max` bytes into `buf`.
///
/// Returns the string's length (including the null) if ok, -1 on
/// error.
#[no_mangle]
pub unsafe extern "C" fn argstr(n: i32, buf: *mut u8, max: i32) -> i32 {
    let mut addr = 0u64;
    argaddr(n, addr_of_mut!(addr));
    fetchstr(addr, buf, max)
}

/// Dispatch the calling process's pending syscall, reading its number
/// from `a7` and writing the return value into `a0`.
pub unsafe fn syscall() {
    let p = &mut *(myproc());
    let num = (*p.trapframe).a7;

    (*p.trapframe).a0 = match TryInto::<Syscall>::try_into(num as usize) {
        Ok(call) => call.call(),
        Err(_) => {
            println!("{} unknown syscall {}", p.pid, num);
            (-1i64) as u64
        }
    };
}
