//! Reference-counted physical page frames (spec.md §3, §4.3 — Frame
//! Manager), layered on the buddy allocator for page-sized requests.
//!
//! Every page-sized block the buddy allocator ever hands out as a user
//! or kernel page goes through here instead of straight to
//! `buddy::buddy_malloc`, so that copy-on-write sharing (spec.md §4.5)
//! has somewhere to keep the share count. A frame starts at
//! `ref_count == 1` when first allocated; `frame_reference` is called
//! once per additional page-table entry that comes to point at it
//! (the COW fork path in `mem::vm::uvmcopy`), and `frame_free` is
//! called once per page table entry that stops pointing at it. The
//! underlying block returns to the buddy allocator only when the
//! count reaches zero.

use super::buddy;
use crate::riscv::{
    memlayout::{KERNBASE, PHYSTOP},
    PGSIZE,
};
use crate::sync::spinlock::Spinlock;
use core::ptr::null_mut;

/// Number of page frames spanned by the kernel's physical memory
/// window, `[KERNBASE, PHYSTOP)`.
pub const NFRAMES: usize = ((PHYSTOP - KERNBASE) / PGSIZE) as usize;

struct FrameTable {
    ref_count: [u16; NFRAMES],
}
impl FrameTable {
    const fn new() -> FrameTable {
        FrameTable { ref_count: [0; NFRAMES] }
    }
}

static LOCK: Spinlock = Spinlock::new("frame");
static mut TABLE: FrameTable = FrameTable::new();

/// Validate that `p` is a page-aligned address inside the managed
/// physical window and return its frame index. A frame manager caller
/// passing a bad address is a programming bug, not a recoverable
/// condition (spec.md §7), so this panics rather than returning
/// `Result`.
unsafe fn frame_parse(p: *mut u8) -> usize {
    let addr = p as u64;
    if addr % PGSIZE != 0 {
        panic!("frame: misaligned address {:#x}", addr);
    }
    if addr < KERNBASE || addr >= PHYSTOP {
        panic!("frame: address {:#x} outside managed range", addr);
    }
    ((addr - KERNBASE) / PGSIZE) as usize
}

/// Allocate one fresh page frame, zeroed, with `ref_count` set to 1.
/// Returns `None` when the buddy allocator is out of memory.
pub unsafe fn frame_allocate() -> Option<*mut u8> {
    let p = buddy::buddy_malloc(PGSIZE as usize);
    if p.is_null() {
        return None;
    }

    core::ptr::write_bytes(p, 0, PGSIZE as usize);

    let index = frame_parse(p);
    let _guard = LOCK.lock();
    debug_assert_eq!(TABLE.ref_count[index], 0, "frame: allocated an already-referenced frame");
    TABLE.ref_count[index] = 1;

    Some(p)
}

/// Record one more page-table entry pointing at `p`. Panics if `p`
/// was not already allocated — a caller can only take a reference to
/// a frame it already holds one on.
pub unsafe fn frame_reference(p: *mut u8) {
    let index = frame_parse(p);
    let _guard = LOCK.lock();
    if TABLE.ref_count[index] == 0 {
        panic!("frame: reference to unallocated frame {:#x}", p as u64);
    }
    TABLE.ref_count[index] += 1;
}

/// Drop one reference to `p`. Once the count reaches zero the frame
/// is returned to the buddy allocator. Panics on a double free.
pub unsafe fn frame_free(p: *mut u8) {
    let index = frame_parse(p);
    let should_release = {
        let _guard = LOCK.lock();
        if TABLE.ref_count[index] == 0 {
            panic!("frame: double free of {:#x}", p as u64);
        }
        TABLE.ref_count[index] -= 1;
        TABLE.ref_count[index] == 0
    };

    if should_release {
        buddy::buddy_free(p);
    }
}

/// Current reference count of the frame backing `p`. Used by the COW
/// fault handler to distinguish a private page (`rc == 1`, safe to
/// make writable in place) from a shared one (`rc > 1`, must copy).
pub unsafe fn frame_ref_count(p: *mut u8) -> u16 {
    let index = frame_parse(p);
    let _guard = LOCK.lock();
    TABLE.ref_count[index]
}

/// Allocate a zeroed page frame, or a null pointer on exhaustion.
/// Convenience wrapper for call sites (trapframes, pipe buffers) that
/// use C-style null-pointer failure rather than `Option`.
pub unsafe fn alloc_zeroed() -> *mut u8 {
    frame_allocate().unwrap_or(null_mut())
}

/// Convenience alias for `frame_free`, matching the `alloc_zeroed`/
/// `free` naming call sites outside this module use.
pub unsafe fn free(p: *mut u8) {
    frame_free(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    /// Exercises the table bookkeeping directly, bypassing the global
    /// buddy allocator singleton (which is shared process-wide and
    /// cannot be reinitialized per test): allocate two indices'
    /// worth of ref counts by hand and check the invariants the
    /// public functions rely on.
    #[test]
    fn ref_count_starts_at_one_and_frees_at_zero() {
        unsafe {
            let index = 3usize;
            TABLE.ref_count[index] = 1;
            TABLE.ref_count[index] += 1;
            assert_eq!(TABLE.ref_count[index], 2);
            TABLE.ref_count[index] -= 1;
            assert_eq!(TABLE.ref_count[index], 1);
            TABLE.ref_count[index] -= 1;
            assert_eq!(TABLE.ref_count[index], 0);
        }
    }

    #[test]
    fn frame_parse_accepts_aligned_in_range_address() {
        unsafe {
            let p = KERNBASE as *mut u8;
            assert_eq!(frame_parse(p), 0);
            let q = (KERNBASE + PGSIZE) as *mut u8;
            assert_eq!(frame_parse(q), 1);
        }
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn frame_parse_rejects_misaligned_address() {
        unsafe {
            frame_parse((KERNBASE + 1) as *mut u8);
        }
    }

    #[test]
    #[should_panic(expected = "outside managed range")]
    fn frame_parse_rejects_out_of_range_address() {
        unsafe {
            frame_parse(PHYSTOP as *mut u8);
        }
    }
}
