//! Formatted output macros. `print!`/`println!` go through the line
//! discipline in `console::mod` (buffered, lockable); `uprint!`/
//! `uprintln!` write straight to the UART with no locking, for use
//! from panic and `procdump`, which may run with other state wedged.

use crate::sync::spinlock::Spinlock;
use core::ffi::{c_char, CStr};

pub static PRINT_LOCK: Spinlock = Spinlock::new("pr");

macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _guard = $crate::console::printf::PRINT_LOCK.lock();
        let mut cons = $crate::console::CONS.lock();
        let _ = core::write!(&mut *cons, $($arg)*);
    }};
}
pub(crate) use print;

macro_rules! println {
    ($($arg:tt)*) => {{
        use $crate::console::printf::print;
        print!($($arg)*);
        print!("\n");
    }};
}
pub(crate) use println;

macro_rules! uprint {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = core::write!($crate::console::UartWriter, $($arg)*);
    }};
}
pub(crate) use uprint;

macro_rules! uprintln {
    ($($arg:tt)*) => {{
        use $crate::console::printf::uprint;
        uprint!($($arg)*);
        uprint!("\n");
    }};
}
pub(crate) use uprintln;

#[no_mangle]
pub extern "C" fn printint(n: i32) {
    print!("{}", n);
}

#[no_mangle]
pub unsafe extern "C" fn printstr(s: *const c_char) {
    let s = CStr::from_ptr(s).to_str().unwrap_or_default();
    print!("{}", s);
}
