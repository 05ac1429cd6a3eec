//! Console input and output, line-buffered, sitting above the UART
//! (spec.md §8 — external collaborator, kept thin).
//!
//! Reads are a line at a time. Handles a few editing keys: newline,
//! ctrl-h (backspace), ctrl-u (kill line), ctrl-d (EOF), ctrl-p (print
//! process list).

pub mod printf;
pub mod uart;

pub(crate) use printf::{print, println, uprint, uprintln};

use crate::mem::vm::{either_copyin, either_copyout};
use crate::proc::{process::Process, scheduler::wakeup};
use crate::sync::spinlock::Spinlock;
use core::ptr::addr_of_mut;
use uart::UART0;

pub const BACKSPACE: u8 = 0x00;
pub const INPUT_BUF_SIZE: usize = 128;

pub struct Console {
    pub buffer: [u8; INPUT_BUF_SIZE],
    pub read_index: usize,
    pub write_index: usize,
    pub edit_index: usize,
}
impl Console {
    const fn new() -> Console {
        Console {
            buffer: [0u8; INPUT_BUF_SIZE],
            read_index: 0,
            write_index: 0,
            edit_index: 0,
        }
    }
    fn read_byte(&self) -> u8 {
        self.buffer[self.read_index % self.buffer.len()]
    }
    fn edit_byte(&mut self) -> &mut u8 {
        let i = self.edit_index % self.buffer.len();
        &mut self.buffer[i]
    }
}
impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        UART0.write_slice_buffered(s.as_bytes());
        Ok(())
    }
}

/// Simple `core::fmt::Write` sink used by `uprint!`/`uprintln!`: goes
/// straight to the UART with no lock and no buffering, for panic
/// messages and `procdump`.
pub struct UartWriter;
impl core::fmt::Write for UartWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        UART0.write_slice(s.as_bytes());
        Ok(())
    }
}

struct ConsoleLock {
    lock: Spinlock,
    console: core::cell::UnsafeCell<Console>,
}
unsafe impl Sync for ConsoleLock {}
impl ConsoleLock {
    fn lock(&self) -> ConsoleGuard<'_> {
        let guard = self.lock.lock();
        ConsoleGuard { guard, console: &self.console }
    }
}

struct ConsoleGuard<'l> {
    guard: crate::sync::spinlock::SpinlockGuard<'l>,
    console: &'l core::cell::UnsafeCell<Console>,
}
impl<'l> ConsoleGuard<'l> {
    /// Atomically release the console lock and block on `chan` until
    /// woken, then reacquire it.
    fn sleep(self, chan: *mut core::ffi::c_void) -> ConsoleGuard<'l> {
        let console = self.console;
        let guard = self.guard.sleep(chan);
        ConsoleGuard { guard, console }
    }
}
impl<'l> core::ops::Deref for ConsoleGuard<'l> {
    type Target = Console;
    fn deref(&self) -> &Console {
        unsafe { &*self.console.get() }
    }
}
impl<'l> core::ops::DerefMut for ConsoleGuard<'l> {
    fn deref_mut(&mut self) -> &mut Console {
        unsafe { &mut *self.console.get() }
    }
}

pub static CONS: ConsoleLock = ConsoleLock {
    lock: Spinlock::new("cons"),
    console: core::cell::UnsafeCell::new(Console::new()),
};

/// ctrl-x
const fn ctrl_x(x: u8) -> u8 {
    x - b'@'
}

/// Send one character to the UART. Called by printf() and to echo
/// input characters, never from `consolewrite`.
pub fn consputc(c: u8) {
    if c == BACKSPACE {
        UART0.write_byte(0x08);
        UART0.write_byte(b' ');
        UART0.write_byte(0x08);
    } else {
        UART0.write_byte(c);
    }
}

/// `write()` to the console device goes here.
pub fn consolewrite(user_src: bool, src: u64, n: i32) -> i32 {
    for i in 0..n {
        let mut c = 0u8;
        let ok = unsafe { either_copyin(addr_of_mut!(c), user_src, src + i as u64, 1) }.is_ok();
        if !ok {
            return i;
        }
        UART0.write_byte_buffered(c);
    }
    n
}

/// `read()` from the console device goes here: copies up to a whole
/// input line into `dst`, which may be a user or kernel address.
pub fn consoleread(user_dst: bool, mut dst: u64, mut n: i32) -> i32 {
    let target = n;
    let mut console = CONS.lock();

    while n > 0 {
        while console.read_index == console.write_index {
            if Process::current().map(|p| p.is_killed()).unwrap_or(false) {
                return -1;
            }
            let channel = addr_of_mut!(console.read_index).cast();
            console = console.sleep(channel);
        }

        let c = console.read_byte();
        console.read_index += 1;

        if c == ctrl_x(b'D') {
            if n < target {
                console.read_index -= 1;
            }
            break;
        }

        let mut cbuf = c;
        if unsafe { either_copyout(user_dst, dst, addr_of_mut!(cbuf), 1) }.is_err() {
            break;
        }

        dst += 1;
        n -= 1;

        if c == b'\n' {
            break;
        }
    }

    target - n
}

pub unsafe fn consoleinit() {
    UART0.initialize();
}

/// Called by `uart::Uart::interrupt` for every received byte: do
/// erase/kill processing, then append to the line buffer, waking
/// `consoleread` once a whole line (or EOF) has arrived.
pub fn consoleintr(mut c: u8) {
    let mut console = CONS.lock();

    if c == ctrl_x(b'P') {
        unsafe { crate::proc::process::procdump() };
    } else if c == ctrl_x(b'U') {
        while console.edit_index != console.write_index
            && console.buffer[(console.edit_index - 1) % INPUT_BUF_SIZE] != b'\n'
        {
            console.edit_index -= 1;
            consputc(BACKSPACE);
        }
    } else if c == ctrl_x(b'H') || c == 0x7f {
        if console.edit_index != console.write_index {
            console.edit_index -= 1;
            consputc(BACKSPACE);
        }
    } else if c != 0 && console.edit_index - console.read_index < INPUT_BUF_SIZE {
        c = if c == b'\r' { b'\n' } else { c };
        consputc(c);
        *console.edit_byte() = c;
        console.edit_index += 1;

        if c == b'\n'
            || c == ctrl_x(b'D')
            || console.edit_index - console.read_index == INPUT_BUF_SIZE
        {
            console.write_index = console.edit_index;
            let channel = addr_of_mut!(console.read_index).cast();
            drop(console);
            unsafe { wakeup(channel) };
        }
    }
}
