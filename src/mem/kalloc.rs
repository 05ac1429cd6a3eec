//! Kernel-wide `GlobalAlloc`, backed by the buddy allocator (spec.md
//! §4.2). Unlike the original page-only allocator this replaces, the
//! buddy allocator serves byte-granular requests of any size, so
//! `alloc`/`dealloc` forward directly to it instead of being limited
//! to whole 4096-byte pages.

use super::buddy;
use crate::riscv::memlayout::PHYSTOP;
use core::alloc::{GlobalAlloc, Layout};

extern "C" {
    /// First address after kernel code/data/bss. Defined by kernel.ld.
    pub static mut end: [u8; 0];
}

/// Hand the buddy allocator everything from the end of the kernel
/// image to the top of physical RAM.
pub unsafe fn kinit() {
    let base = core::ptr::addr_of_mut!(end).cast::<u8>();
    buddy::buddy_init(base, PHYSTOP as *mut u8);
}

struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // The buddy allocator only ever hands out LEAF_SIZE-aligned
        // blocks in power-of-two sizes, which satisfies any alignment
        // up to LEAF_SIZE without extra bookkeeping; anything coarser
        // than that is not a request this kernel makes.
        debug_assert!(layout.align() <= buddy::LEAF_SIZE);
        buddy::buddy_malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        buddy::buddy_free(ptr);
    }
}

#[global_allocator]
static GLOBAL: KernelAllocator = KernelAllocator;
