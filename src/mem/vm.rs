//! Sv39 page-table manager with copy-on-write user address spaces
//! (spec.md §3, §4.4–§4.5 — Page Table Manager).
//!
//! Grounded in the teacher's `mem::virtual_memory` (`walk`, `mappages`,
//! `kvmmake`), generalized two ways: every fallible operation returns
//! `Result<_, KernelError>` instead of a C-style sentinel, and
//! `uvmcopy`/the page-fault path share frames through `mem::frame`'s
//! ref counts rather than performing a full physical copy at fork
//! time (spec.md §4.5's COW fork path).

use super::frame;
use crate::proc::trapframe::Trapframe;
use crate::riscv::{
    self,
    memlayout::{KERNBASE, PHYSTOP, TRAMPOLINE},
    pa2pte, pg_round_down, pg_round_up, pte2pa, px, Pagetable, Pte, MAXVA, PGSIZE, PTE_COW,
    PTE_R, PTE_U, PTE_V, PTE_W, PTE_X,
};
use core::ptr::null_mut;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelError {
    BadAlloc,
    NotFound,
    PermissionDenied,
    Unknown,
}
pub type Result<T> = core::result::Result<T, KernelError>;

extern "C" {
    /// kernel.ld: end of kernel code.
    static etext: [u8; 0];
    /// trampoline.S
    static trampoline: [u8; 0];
}

/// The kernel's own page table, installed on every hart.
static mut KERNEL_PAGETABLE: Pagetable = null_mut();

unsafe fn alloc_page_zeroed() -> Result<*mut u8> {
    frame::frame_allocate().ok_or(KernelError::BadAlloc)
}

/// Build the kernel's direct-map page table: identity maps over
/// MMIO and RAM, plus the single shared trampoline page.
unsafe fn kvmmake() -> Result<Pagetable> {
    let pagetable = alloc_page_zeroed()?.cast::<[Pte; 512]>();

    kvmmap(
        pagetable,
        riscv::memlayout::UART0,
        riscv::memlayout::UART0,
        PGSIZE,
        PTE_R | PTE_W,
    )?;
    kvmmap(
        pagetable,
        riscv::memlayout::VIRTIO0,
        riscv::memlayout::VIRTIO0,
        PGSIZE,
        PTE_R | PTE_W,
    )?;
    kvmmap(
        pagetable,
        riscv::memlayout::PLIC,
        riscv::memlayout::PLIC,
        0x400000,
        PTE_R | PTE_W,
    )?;
    kvmmap(
        pagetable,
        riscv::memlayout::QEMU_POWER,
        riscv::memlayout::QEMU_POWER,
        PGSIZE,
        PTE_R | PTE_W,
    )?;

    let etext_addr = core::ptr::addr_of!(etext) as u64;
    kvmmap(pagetable, KERNBASE, KERNBASE, etext_addr - KERNBASE, PTE_R | PTE_X)?;
    kvmmap(pagetable, etext_addr, etext_addr, PHYSTOP - etext_addr, PTE_R | PTE_W)?;

    let trampoline_pa = core::ptr::addr_of!(trampoline) as u64;
    kvmmap(pagetable, TRAMPOLINE, trampoline_pa, PGSIZE, PTE_R | PTE_X)?;

    proc_mapstacks(pagetable)?;

    Ok(pagetable)
}

/// Allocate and map one kernel stack page per process-table slot at
/// `memlayout::kstack(i)`, each separated from its neighbors by an
/// unmapped guard page (spec.md §4.5's kernel VM bootstrap). Done
/// once, in the kernel page table, before any process is ever
/// scheduled — a process's `kernel_stack` field is fixed at this
/// virtual address for its slot's whole lifetime, through however
/// many processes cycle through that slot.
unsafe fn proc_mapstacks(kpagetable: Pagetable) -> Result<()> {
    for i in 0..crate::param::NPROC {
        let stack = alloc_page_zeroed()?;
        let va = riscv::memlayout::kstack(i as u64);
        kvmmap(kpagetable, va, stack as u64, PGSIZE, PTE_R | PTE_W)?;
    }
    Ok(())
}

/// One-time setup of the global kernel page table. Panics on failure:
/// there is no fallback path for a kernel that cannot map itself.
pub unsafe fn kvminit() {
    KERNEL_PAGETABLE = kvmmake().expect("kvminit: out of memory mapping the kernel");
}

/// Install the kernel page table on this hart and enable paging.
pub unsafe fn kvminithart() {
    riscv::sfence_vma();
    riscv::w_satp(riscv::make_satp(KERNEL_PAGETABLE));
    riscv::sfence_vma();
}

/// Walk `pagetable` to the leaf PTE for `va`, allocating intermediate
/// page-table pages along the way if `alloc`.
pub unsafe fn walk(mut pagetable: Pagetable, va: u64, alloc: bool) -> Result<*mut Pte> {
    if va >= MAXVA {
        panic!("walk: address out of range");
    }

    let mut level = 2u64;
    loop {
        let pte: *mut Pte = core::ptr::addr_of_mut!((*pagetable)[px(level, va)]);

        if level == 0 {
            return Ok(pte);
        }

        if *pte & PTE_V != 0 {
            pagetable = pte2pa(*pte) as Pagetable;
        } else {
            if !alloc {
                return Err(KernelError::NotFound);
            }
            let next = alloc_page_zeroed()?;
            *pte = pa2pte(next as u64) | PTE_V;
            pagetable = next.cast();
        }

        level -= 1;
    }
}

/// Look up a user virtual address; 0 if unmapped or not user-accessible.
pub unsafe fn walkaddr(pagetable: Pagetable, va: u64) -> u64 {
    if va >= MAXVA {
        return 0;
    }
    match walk(pagetable, va, false) {
        Ok(pte) if *pte & PTE_V != 0 && *pte & PTE_U != 0 => pte2pa(*pte),
        _ => 0,
    }
}

/// Map `[va, va+size)` to `[pa, pa+size)`. `va` and `size` need not be
/// page-aligned. Panics on an attempt to remap an already-valid PTE —
/// that is a caller bug, not a recoverable condition.
pub unsafe fn mappages(pagetable: Pagetable, va: u64, size: u64, mut pa: u64, perm: u64) -> Result<()> {
    assert!(size > 0, "mappages: size = 0");

    let mut a = pg_round_down(va);
    let last = pg_round_down(va + size - 1);

    loop {
        let pte = walk(pagetable, a, true)?;
        if *pte & PTE_V != 0 {
            panic!("mappages: remap");
        }
        *pte = pa2pte(pa) | perm | PTE_V;

        if a == last {
            return Ok(());
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
}

/// Install a kernel-only mapping at boot time, before paging is live.
pub unsafe fn kvmmap(pagetable: Pagetable, va: u64, pa: u64, size: u64, perm: u64) -> Result<()> {
    mappages(pagetable, va, size, pa, perm)
}

/// Remove `npages` mappings starting at `va` (page-aligned). Each
/// mapping must exist and be a leaf. If `do_free`, drop a reference
/// to the frame each PTE points at (this is what lets COW siblings
/// share without a double free: each mapping holds one reference).
pub unsafe fn uvmunmap(pagetable: Pagetable, va: u64, npages: u64, do_free: bool) {
    assert_eq!(va % PGSIZE, 0, "uvmunmap: not aligned");

    let mut a = va;
    while a < va + npages * PGSIZE {
        let pte = walk(pagetable, a, false).expect("uvmunmap: walk");
        if *pte & PTE_V == 0 {
            panic!("uvmunmap: not mapped");
        }
        if *pte & (PTE_R | PTE_W | PTE_X) == 0 {
            panic!("uvmunmap: not a leaf");
        }
        if do_free {
            frame::frame_free(pte2pa(*pte) as *mut u8);
        }
        *pte = 0;
        a += PGSIZE;
    }
}

/// A fresh, empty user page table (no mappings at all yet).
pub unsafe fn uvmcreate() -> Result<Pagetable> {
    Ok(alloc_page_zeroed()?.cast())
}

/// Map the trampoline and trapframe pages into a brand-new user
/// pagetable. Every process needs these regardless of what user
/// program it runs.
pub unsafe fn proc_pagetable(trapframe: *mut Trapframe) -> Option<Pagetable> {
    let pagetable = uvmcreate().ok()?;

    let trampoline_pa = core::ptr::addr_of!(trampoline) as u64;
    if mappages(pagetable, TRAMPOLINE, PGSIZE, trampoline_pa, PTE_R | PTE_X).is_err() {
        uvmfree(pagetable, 0);
        return None;
    }

    if mappages(
        pagetable,
        riscv::memlayout::TRAPFRAME,
        PGSIZE,
        trapframe as u64,
        PTE_R | PTE_W,
    )
    .is_err()
    {
        uvmunmap(pagetable, TRAMPOLINE, 1, false);
        uvmfree(pagetable, 0);
        return None;
    }

    Some(pagetable)
}

/// Unmap the trampoline/trapframe, free the rest of a process's user
/// memory, then free the pagetable pages themselves.
pub unsafe fn proc_freepagetable(pagetable: Pagetable, size: u64) {
    uvmunmap(pagetable, TRAMPOLINE, 1, false);
    uvmunmap(pagetable, riscv::memlayout::TRAPFRAME, 1, false);
    uvmfree(pagetable, size);
}

/// Map the hard-coded `initcode` program at user VA 0 for the very
/// first process. `size` must be less than one page.
pub unsafe fn uvmfirst(pagetable: Pagetable, src: &[u8]) {
    assert!(src.len() < PGSIZE as usize, "uvmfirst: more than a page");

    let mem = alloc_page_zeroed().expect("uvmfirst: out of memory");
    core::ptr::copy_nonoverlapping(src.as_ptr(), mem, src.len());
    mappages(pagetable, 0, PGSIZE, mem as u64, PTE_W | PTE_R | PTE_X | PTE_U)
        .expect("uvmfirst: mappages");
}

/// Grow a process from `old_size` to `new_size` bytes, allocating and
/// mapping fresh frames. Returns the new size. On partial failure,
/// everything allocated so far is unwound.
pub unsafe fn uvmalloc(pagetable: Pagetable, old_size: u64, new_size: u64, xperm: u64) -> Result<u64> {
    if new_size < old_size {
        return Ok(old_size);
    }

    let old_aligned = pg_round_up(old_size);
    let mut a = old_aligned;

    while a < new_size {
        let mem = match alloc_page_zeroed() {
            Ok(m) => m,
            Err(e) => {
                uvmdealloc(pagetable, a, old_aligned);
                return Err(e);
            }
        };

        if mappages(pagetable, a, PGSIZE, mem as u64, PTE_R | PTE_U | xperm).is_err() {
            frame::frame_free(mem);
            uvmdealloc(pagetable, a, old_aligned);
            return Err(KernelError::BadAlloc);
        }

        a += PGSIZE;
    }

    Ok(new_size)
}

/// Shrink a process from `old_size` to `new_size` bytes. `new_size`
/// need not be smaller; a no-op is a valid call.
pub unsafe fn uvmdealloc(pagetable: Pagetable, old_size: u64, new_size: u64) -> u64 {
    if new_size >= old_size {
        return old_size;
    }

    if pg_round_up(new_size) < pg_round_up(old_size) {
        let npages = (pg_round_up(old_size) - pg_round_up(new_size)) / PGSIZE;
        uvmunmap(pagetable, pg_round_up(new_size), npages, true);
    }

    new_size
}

/// Recursively free the page-table pages themselves. Every leaf
/// mapping must already be gone.
unsafe fn freewalk(pagetable: Pagetable) {
    for i in 0..512 {
        let pte = (*pagetable)[i];
        if pte & PTE_V != 0 && pte & (PTE_R | PTE_W | PTE_X) == 0 {
            freewalk(pte2pa(pte) as Pagetable);
            (*pagetable)[i] = 0;
        } else if pte & PTE_V != 0 {
            panic!("freewalk: leaf left behind");
        }
    }
    frame::frame_free(pagetable.cast());
}

/// Unmap and free all of a process's user memory, then the page
/// table itself.
pub unsafe fn uvmfree(pagetable: Pagetable, size: u64) {
    if size > 0 {
        uvmunmap(pagetable, 0, pg_round_up(size) / PGSIZE, true);
    }
    freewalk(pagetable);
}

/// Copy-on-write fork: share every user frame between `old` and `new`
/// rather than duplicating memory. Each shared leaf gets its `W` bit
/// cleared and `COW` set on *both* pagetables (spec.md §4.5) and the
/// frame's ref count is bumped once per new mapping. On failure,
/// everything installed into `new` so far is torn down (which drops
/// the ref counts it picked up) and the error is returned; `old`'s
/// PTEs that were already flipped to COW are left that way — a
/// subsequent write still materializes correctly either way.
pub unsafe fn uvmcopy(old: Pagetable, new: Pagetable, size: u64) -> Result<()> {
    let mut i = 0u64;

    while i < size {
        let pte = walk(old, i, false)?;
        if *pte & PTE_V == 0 {
            panic!("uvmcopy: page not present");
        }

        if *pte & PTE_W != 0 {
            *pte &= !PTE_W;
            *pte |= PTE_COW;
        }

        let pa = pte2pa(*pte);
        let flags = *pte & 0x3ff;

        if mappages(new, i, PGSIZE, pa, flags).is_err() {
            uvmunmap(new, 0, i / PGSIZE, true);
            return Err(KernelError::BadAlloc);
        }
        frame::frame_reference(pa as *mut u8);

        i += PGSIZE;
    }

    Ok(())
}

/// Materialize a copy-on-write page. `rc == 1` means this process is
/// the last holder: flip `W` back on in place, no copy needed.
/// `rc > 1` means the frame is still shared: allocate a private copy,
/// retarget the PTE at it with the original flags plus `W` and minus
/// `COW`, and drop the shared frame's reference (spec.md §4.5).
unsafe fn materialize_on_write(pte: *mut Pte) -> Result<()> {
    if *pte & PTE_COW == 0 {
        panic!("materialize_on_write: pte is not COW");
    }

    let old_pa = pte2pa(*pte) as *mut u8;
    let rc = frame::frame_ref_count(old_pa);

    if rc == 1 {
        *pte |= PTE_W;
        *pte &= !PTE_COW;
        return Ok(());
    }

    let new_pa = frame::frame_allocate().ok_or(KernelError::BadAlloc)?;
    core::ptr::copy_nonoverlapping(old_pa, new_pa, PGSIZE as usize);

    let flags = (*pte & 0x3ff) | PTE_W;
    let flags = flags & !PTE_COW;
    *pte = pa2pte(new_pa as u64) | flags;

    frame::frame_free(old_pa);
    Ok(())
}

/// COW page-fault entry point: `pt`'s leaf for `va` must have `COW`
/// set. Dispatches to `materialize_on_write`. Any other fault shape is
/// reported as `NOT_FOUND` (no mapping at all) or `Unknown` (mapped
/// but not a COW fault — a kernel bug, or a genuinely unhandled fault
/// kind this kernel does not support, e.g. demand paging).
pub unsafe fn uvm_handle_page_fault(pagetable: Pagetable, va: u64) -> Result<()> {
    if va >= MAXVA {
        return Err(KernelError::NotFound);
    }
    let pte = walk(pagetable, pg_round_down(va), false)?;
    if *pte & PTE_V == 0 {
        return Err(KernelError::NotFound);
    }
    if *pte & PTE_COW != 0 {
        return uvm_copy_on_write(pte);
    }
    Err(KernelError::Unknown)
}

/// Alias kept for the exact name spec.md §4.5 uses for the fault
/// handler's dispatch target.
pub unsafe fn uvm_copy_on_write(pte: *mut Pte) -> Result<()> {
    materialize_on_write(pte)
}

/// Mark a PTE invalid for user access (used for the guard page below
/// a user stack).
pub unsafe fn uvmclear(pagetable: Pagetable, va: u64) {
    let pte = walk(pagetable, va, false).expect("uvmclear");
    *pte &= !PTE_U;
}

/// Copy `len` bytes from `src` (kernel memory) to user virtual address
/// `dst_va` in `pagetable`. Triggers COW materialization on a write
/// into a COW page, since this is a write on the destination's behalf.
pub unsafe fn copyout(pagetable: Pagetable, mut dst_va: u64, mut src: *const u8, mut len: u64) -> Result<()> {
    while len > 0 {
        let va0 = pg_round_down(dst_va);
        if va0 >= MAXVA {
            return Err(KernelError::NotFound);
        }

        let pte = walk(pagetable, va0, false)?;
        if *pte & PTE_V == 0 {
            return Err(KernelError::NotFound);
        }
        if *pte & PTE_U == 0 {
            return Err(KernelError::PermissionDenied);
        }
        if *pte & PTE_COW != 0 {
            uvm_copy_on_write(pte)?;
        }

        let pa0 = pte2pa(*pte);
        let mut n = PGSIZE - (dst_va - va0);
        if n > len {
            n = len;
        }

        core::ptr::copy_nonoverlapping(src, (pa0 + (dst_va - va0)) as *mut u8, n as usize);

        len -= n;
        src = src.add(n as usize);
        dst_va = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy `len` bytes to `dst` (kernel memory) from user virtual address
/// `src_va`. Read-only: no COW materialization needed.
pub unsafe fn copyin(pagetable: Pagetable, mut dst: *mut u8, mut src_va: u64, mut len: u64) -> Result<()> {
    while len > 0 {
        let va0 = pg_round_down(src_va);
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return Err(KernelError::NotFound);
        }

        let mut n = PGSIZE - (src_va - va0);
        if n > len {
            n = len;
        }

        core::ptr::copy_nonoverlapping((pa0 + (src_va - va0)) as *const u8, dst, n as usize);

        len -= n;
        dst = dst.add(n as usize);
        src_va = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user memory at `src_va` to `dst`,
/// stopping at the first NUL or after `max` bytes. Fails if no NUL is
/// found before memory runs out or `max` is exhausted.
pub unsafe fn copyinstr(pagetable: Pagetable, mut dst: *mut u8, mut src_va: u64, mut max: u64) -> Result<()> {
    let mut got_null = false;

    while !got_null && max > 0 {
        let va0 = pg_round_down(src_va);
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return Err(KernelError::NotFound);
        }

        let mut n = PGSIZE - (src_va - va0);
        if n > max {
            n = max;
        }

        let mut p = (pa0 + (src_va - va0)) as *const u8;
        while n > 0 {
            if *p == 0 {
                *dst = 0;
                got_null = true;
                break;
            }
            *dst = *p;
            n -= 1;
            max -= 1;
            p = p.add(1);
            dst = dst.add(1);
        }

        src_va = va0 + PGSIZE;
    }

    if got_null {
        Ok(())
    } else {
        Err(KernelError::NotFound)
    }
}

/// `copyin`/`copyout` variants used by call sites (pipes, `read`/
/// `write` on the console) that may be serving either a user-space
/// address (through the current process's pagetable) or an address
/// already in kernel memory, selected by `user`.
pub unsafe fn either_copyin(dst: *mut u8, user_src: bool, src: u64, len: u64) -> Result<()> {
    if user_src {
        let p = crate::proc::process::Process::current().ok_or(KernelError::Unknown)?;
        copyin(p.pagetable, dst, src, len)
    } else {
        core::ptr::copy_nonoverlapping(src as *const u8, dst, len as usize);
        Ok(())
    }
}

pub unsafe fn either_copyout(user_dst: bool, dst: u64, src: *mut u8, len: u64) -> Result<()> {
    if user_dst {
        let p = crate::proc::process::Process::current().ok_or(KernelError::Unknown)?;
        copyout(p.pagetable, dst, src, len)
    } else {
        core::ptr::copy_nonoverlapping(src, dst as *mut u8, len as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    /// A single page-table-page-sized arena, enough to exercise
    /// `walk`/`mappages` against a `Box`-backed "frame" without the
    /// global frame manager.
    #[test]
    fn px_indices_span_full_pagetable() {
        for level in 0..3u64 {
            for i in 0..512usize {
                let va = (i as u64) << (12 + level * 9);
                if va < MAXVA {
                    assert_eq!(px(level, va), i);
                }
            }
        }
    }

    #[test]
    fn pa2pte_pte2pa_roundtrip() {
        let pa = 0x8012_3000u64;
        assert_eq!(pte2pa(pa2pte(pa) | PTE_V | PTE_R), pa);
    }
}
