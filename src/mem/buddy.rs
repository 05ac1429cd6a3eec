//! Power-of-two physical-memory allocator serving the kernel heap
//! (spec.md §3, §4.2 — Buddy Allocator).
//!
//! Grounded in `examples/original_source/kernel/buddy.c`'s `bd_init`/
//! `bd_malloc`/`bd_free`, but following spec.md §9's REDESIGN FLAGS
//! rather than the original where they diverge:
//!
//! - a *pair-xor* bit per buddy pair instead of one alloc bit per
//!   block (half the metadata; a single flip captures both sides of a
//!   buddy relation), and
//! - free-list nodes are block indices threaded through an in-place
//!   `next` index written into the free block's own bytes, not a
//!   pointer cast — the arena owns the region, callers only ever see
//!   the address handed back by `malloc`.
//!
//! The allocator manages one contiguous, power-of-two-sized region of
//! bytes. Its own bookkeeping (the size-class table plus the
//! pair-xor/split bit vectors) lives at the front of that same region,
//! marked permanently allocated, the way `bd_mark_data_structures`
//! does in the original; any trailing slack to the next power of two
//! is marked allocated too (`bd_mark_unavailable`).

use crate::sync::spinlock::Spinlock;

/// Smallest block the allocator will ever hand out.
pub const LEAF_SIZE: usize = 16;

/// A free-list link index. `NIL` marks the end of a list.
const NIL: u32 = u32::MAX;

/// One bit per item, packed 8-to-a-byte, over a region the allocator
/// itself owns (no separate allocation — these point into the
/// allocator's own metadata prefix).
struct BitSet {
    data: *mut u8,
    len: usize,
}
impl BitSet {
    const fn bytes_for(len: usize) -> usize {
        (len + 7) / 8
    }

    unsafe fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let byte = *self.data.add(index / 8);
        (byte & (1 << (index % 8))) != 0
    }

    unsafe fn set(&self, index: usize) {
        debug_assert!(index < self.len);
        let cell = self.data.add(index / 8);
        *cell |= 1 << (index % 8);
    }

    unsafe fn clear(&self, index: usize) {
        debug_assert!(index < self.len);
        let cell = self.data.add(index / 8);
        *cell &= !(1 << (index % 8));
    }

    /// Flip the bit and return its new value.
    unsafe fn flip(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let cell = self.data.add(index / 8);
        *cell ^= 1 << (index % 8);
        self.get(index)
    }

    unsafe fn zero(&self) {
        for i in 0..Self::bytes_for(self.len) {
            *self.data.add(i) = 0;
        }
    }
}

/// Header for one size class `k`.
struct SizeClass {
    free_head: u32,
    /// Pair-xor bits, length `NBLK(k).div_ceil(2)`. Bit `i` is set iff
    /// exactly one of pair `i`'s two buddies is allocated.
    pair_alloc_xor: BitSet,
    /// Split bits, length `NBLK(k)`. Unused (zero-length) for `k == 0`.
    split: BitSet,
}

/// In-place free-list node, written at the front of a free block's
/// own bytes (REDESIGN FLAGS: arena+index, never an untyped pointer
/// cast held by the caller).
#[repr(C)]
struct Run {
    next: u32,
}

pub struct BuddyAllocator {
    lock: Spinlock,
    /// Base of the whole managed region (metadata + usable bytes).
    base: *mut u8,
    /// Largest size-class index; `blk_size(max_k)` is the size the
    /// region was rounded up to.
    max_k: usize,
    classes: *mut SizeClass,
    /// `[meta_start, meta_end)`: the allocator's own bookkeeping,
    /// permanently allocated.
    meta_start: usize,
    meta_end: usize,
    /// `[slack_start, slack_end)`: trailing bytes beyond the
    /// caller's requested `end` needed to round up to a power of two,
    /// permanently allocated. Empty (`slack_start == slack_end`) when
    /// the requested region was already a power of two.
    slack_start: usize,
    slack_end: usize,
}
unsafe impl Sync for BuddyAllocator {}

/// Smallest `k` with `blk_size(k) >= max(n, LEAF_SIZE)`.
fn size_class_for(n: usize) -> usize {
    let n = n.max(1).max(LEAF_SIZE);
    let mut k = 0;
    let mut size = LEAF_SIZE;
    while size < n {
        k += 1;
        size *= 2;
    }
    k
}

const fn blk_size(k: usize) -> usize {
    LEAF_SIZE << k
}

/// Number of size-`k` blocks in a region of `2^max_k` leaves.
const fn nblk(max_k: usize, k: usize) -> usize {
    1usize << (max_k - k)
}

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

impl BuddyAllocator {
    pub const fn uninit() -> BuddyAllocator {
        BuddyAllocator {
            lock: Spinlock::new("buddy"),
            base: core::ptr::null_mut(),
            max_k: 0,
            classes: core::ptr::null_mut(),
            meta_start: 0,
            meta_end: 0,
            slack_start: 0,
            slack_end: 0,
        }
    }

    fn class(&self, k: usize) -> &SizeClass {
        unsafe { &*self.classes.add(k) }
    }

    unsafe fn block_index(&self, k: usize, addr: *mut u8) -> usize {
        (addr.offset_from(self.base) as usize) / blk_size(k)
    }

    unsafe fn block_addr(&self, k: usize, index: usize) -> *mut u8 {
        self.base.add(index * blk_size(k))
    }

    unsafe fn list_push(&self, k: usize, block: *mut u8) {
        let class_ptr = self.classes.add(k);
        let run = block as *mut Run;
        (*run).next = (*class_ptr).free_head;
        (*class_ptr).free_head = self.block_index(k, block) as u32;
    }

    unsafe fn list_pop(&self, k: usize) -> Option<*mut u8> {
        let class_ptr = self.classes.add(k);
        let head = (*class_ptr).free_head;
        if head == NIL {
            return None;
        }
        let addr = self.block_addr(k, head as usize);
        let run = addr as *mut Run;
        (*class_ptr).free_head = (*run).next;
        Some(addr)
    }

    /// Remove a specific block from `freelist[k]`, known to be on it.
    unsafe fn list_remove(&self, k: usize, block: *mut u8) {
        let target = self.block_index(k, block) as u32;
        let class_ptr = self.classes.add(k);
        if (*class_ptr).free_head == target {
            let run = block as *mut Run;
            (*class_ptr).free_head = (*run).next;
            return;
        }
        let mut cur = (*class_ptr).free_head;
        while cur != NIL {
            let cur_run = self.block_addr(k, cur as usize) as *mut Run;
            if (*cur_run).next == target {
                let target_run = block as *mut Run;
                (*cur_run).next = (*target_run).next;
                return;
            }
            cur = (*cur_run).next;
        }
        panic!("buddy: list_remove: block not on free list");
    }

    /// One-time setup over `[base, end)`.
    pub unsafe fn init(&mut self, base: *mut u8, end: *mut u8) {
        let base = base as usize;
        let end = end as usize;
        let start = round_up(base, LEAF_SIZE);
        let region_bytes = end - start;

        let max_k = size_class_for(region_bytes).max(1);
        self.base = start as *mut u8;
        self.max_k = max_k;

        // Lay out `classes[0..=max_k]` and each class's bit vectors
        // contiguously right after `start`.
        let classes = start as *mut SizeClass;
        let mut cursor = start + core::mem::size_of::<SizeClass>() * (max_k + 1);
        for k in 0..=max_k {
            let len = nblk(max_k, k);
            let pair_len = len.div_ceil(2).max(1);
            let pair_bytes = BitSet::bytes_for(pair_len);
            let pair_ptr = cursor as *mut u8;
            cursor += pair_bytes;

            let (split_ptr, split_len) = if k > 0 {
                let split_bytes = BitSet::bytes_for(len);
                let p = cursor as *mut u8;
                cursor += split_bytes;
                (p, len)
            } else {
                (core::ptr::null_mut(), 0)
            };

            classes.add(k).write(SizeClass {
                free_head: NIL,
                pair_alloc_xor: BitSet { data: pair_ptr, len: pair_len },
                split: BitSet { data: split_ptr, len: split_len },
            });
            (*classes.add(k)).pair_alloc_xor.zero();
            if k > 0 {
                (*classes.add(k)).split.zero();
            }
        }
        self.classes = classes;

        self.meta_start = start;
        self.meta_end = round_up(cursor, LEAF_SIZE);

        let heap_end = start + blk_size(max_k);
        if heap_end > end {
            self.slack_start = end;
            self.slack_end = heap_end;
        } else {
            self.slack_start = heap_end;
            self.slack_end = heap_end; // empty range
        }

        self.mark_reserved_ranges();
        self.init_free_lists();
    }

    /// Set the pair-xor and split bits for every level so that the
    /// metadata and slack ranges read as permanently allocated,
    /// exactly as `bd_mark` does in the original (a block at level
    /// `k` is marked iff its byte range overlaps either range; any
    /// block fully covering descendants that are allocated is also
    /// `split`).
    unsafe fn mark_reserved_ranges(&self) {
        for k in 0..=self.max_k {
            let (meta_first, meta_last) = self.overlap_indices(k, self.meta_start, self.meta_end);
            let (slack_first, slack_last) =
                self.overlap_indices(k, self.slack_start, self.slack_end);
            for i in meta_first..meta_last {
                self.class(k).pair_alloc_xor.flip(i / 2);
                if k > 0 {
                    self.class(k).split.set(i);
                }
            }
            for i in slack_first..slack_last {
                self.class(k).pair_alloc_xor.flip(i / 2);
                if k > 0 {
                    self.class(k).split.set(i);
                }
            }
        }
    }

    /// `[first, last)`: the half-open index range at level `k` whose
    /// blocks overlap byte range `[lo, hi)`. Empty if `hi <= lo`.
    unsafe fn overlap_indices(&self, k: usize, lo: usize, hi: usize) -> (usize, usize) {
        if hi <= lo {
            return (0, 0);
        }
        let size = blk_size(k);
        let base = self.base as usize;
        let first = (lo - base) / size;
        let mut last = (hi - base) / size;
        if (hi - base) % size != 0 {
            last += 1;
        }
        (first, last)
    }

    /// True iff block `i` at level `k` overlaps the metadata or slack
    /// ranges (used only at init, to classify the two boundary
    /// blocks `bd_initfree` inspects per level).
    unsafe fn overlaps_reserved(&self, k: usize, i: usize) -> bool {
        let (mf, ml) = self.overlap_indices(k, self.meta_start, self.meta_end);
        if i >= mf && i < ml {
            return true;
        }
        let (sf, sl) = self.overlap_indices(k, self.slack_start, self.slack_end);
        i >= sf && i < sl
    }

    /// Populate free lists for everything not covered by the
    /// metadata/slack ranges. For each level below the top, only the
    /// two blocks immediately adjacent to each reserved range can be
    /// half-free/half-allocated (`bd_initfree`); genuinely interior
    /// free blocks are represented at a coarser level instead.
    unsafe fn init_free_lists(&self) {
        for k in 0..self.max_k {
            let (_, meta_last) = self.overlap_indices(k, self.meta_start, self.meta_end);
            let (slack_first, _) = self.overlap_indices(k, self.slack_start, self.slack_end);

            self.initfree_pair(k, meta_last);
            if self.slack_end > self.slack_start && slack_first > meta_last {
                self.initfree_pair(k, slack_first);
            }
        }
    }

    /// If exactly one of block `i`'s pair is reserved, push the free
    /// one onto `freelist[k]`.
    unsafe fn initfree_pair(&self, k: usize, i: usize) {
        let pair = i / 2;
        if !self.class(k).pair_alloc_xor.get(pair) {
            return;
        }
        let buddy = i ^ 1;
        let free_index = if self.overlaps_reserved(k, i) { buddy } else { i };
        self.list_push(k, self.block_addr(k, free_index));
    }

    /// `blk_size(k)` where `k` is the size class `p` was originally
    /// allocated at: the smallest `k` whose parent at `k+1` is split
    /// at `p`'s index.
    unsafe fn size_of_ptr(&self, p: *mut u8) -> usize {
        for k in 0..self.max_k {
            if self.class(k + 1).split.get(self.block_index(k + 1, p)) {
                return k;
            }
        }
        self.max_k
    }

    pub unsafe fn malloc(&self, n: usize) -> *mut u8 {
        let _guard = self.lock.lock();
        let min_k = size_class_for(n);

        let mut found = None;
        for k in min_k..=self.max_k {
            if self.class(k).free_head != NIL {
                found = Some(k);
                break;
            }
        }
        let Some(mut k) = found else {
            return core::ptr::null_mut();
        };

        let block = self.list_pop(k).expect("buddy: free list head lied");
        self.class(k).pair_alloc_xor.flip(self.block_index(k, block) / 2);

        while k > min_k {
            self.class(k).split.set(self.block_index(k, block));

            let lower_index = self.block_index(k - 1, block);
            self.class(k - 1).pair_alloc_xor.flip(lower_index / 2);

            let buddy = block.add(blk_size(k - 1));
            self.list_push(k - 1, buddy);

            k -= 1;
        }

        block
    }

    pub unsafe fn free(&self, p: *mut u8) {
        let _guard = self.lock.lock();
        let mut k = self.size_of_ptr(p);
        let mut addr = p;

        while k < self.max_k {
            let index = self.block_index(k, addr);
            let pair_now_half_allocated = self.class(k).pair_alloc_xor.flip(index / 2);

            if pair_now_half_allocated {
                // The buddy is still allocated. Stop merging.
                break;
            }

            let buddy_index = index ^ 1;
            let buddy_addr = self.block_addr(k, buddy_index);
            self.list_remove(k, buddy_addr);

            if buddy_index % 2 == 0 {
                addr = buddy_addr;
            }
            self.class(k + 1).split.clear(self.block_index(k + 1, addr));

            k += 1;
        }

        self.list_push(k, addr);
    }
}

static BUDDY_INIT_GUARD: Spinlock = Spinlock::new("buddy-init-guard");
static mut ALLOCATOR: BuddyAllocator = BuddyAllocator::uninit();

/// Initialize the global buddy allocator over `[base, end)`. Must be
/// called exactly once, before any `buddy_malloc`/`buddy_free`.
pub unsafe fn buddy_init(base: *mut u8, end: *mut u8) {
    let _guard = BUDDY_INIT_GUARD.lock();
    ALLOCATOR.init(base, end);
}

pub unsafe fn buddy_malloc(n: usize) -> *mut u8 {
    ALLOCATOR.malloc(n)
}

pub unsafe fn buddy_free(p: *mut u8) {
    ALLOCATOR.free(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;

    /// A boxed byte arena standing in for physical memory, per
    /// SPEC_FULL.md's test-tooling section.
    struct Arena {
        _backing: std::boxed::Box<[u8]>,
        allocator: BuddyAllocator,
    }
    impl Arena {
        unsafe fn new(size: usize) -> Arena {
            let mut backing = std::vec![0u8; size].into_boxed_slice();
            let base = backing.as_mut_ptr();
            let end = base.add(size);
            let mut allocator = BuddyAllocator::uninit();
            allocator.init(base, end);
            Arena { _backing: backing, allocator }
        }
    }

    #[test]
    fn alloc_returns_leaf_aligned_pointer() {
        unsafe {
            let arena = Arena::new(4096);
            let p = arena.allocator.malloc(1);
            assert!(!p.is_null());
            assert_eq!((p as usize) % LEAF_SIZE, 0);
            arena.allocator.free(p);
        }
    }

    #[test]
    fn zero_byte_request_rounds_up_to_leaf() {
        unsafe {
            let arena = Arena::new(4096);
            let p = arena.allocator.malloc(0);
            assert!(!p.is_null());
            arena.allocator.free(p);
        }
    }

    #[test]
    fn allocations_never_overlap() {
        unsafe {
            let arena = Arena::new(4096);
            let mut ptrs = std::vec::Vec::new();
            loop {
                let p = arena.allocator.malloc(LEAF_SIZE);
                if p.is_null() {
                    break;
                }
                ptrs.push(p as usize);
            }
            ptrs.sort_unstable();
            for w in ptrs.windows(2) {
                assert!(w[1] - w[0] >= LEAF_SIZE);
            }
            for p in ptrs {
                arena.allocator.free(p as *mut u8);
            }
        }
    }

    #[test]
    fn coalesce_scenario_from_spec() {
        // spec.md §8 Scenario 1: two leaf allocations from the same
        // parent block merge back into one once both are freed.
        unsafe {
            let arena = Arena::new(256);
            let a = arena.allocator.malloc(16);
            let b = arena.allocator.malloc(16);
            assert!(!a.is_null() && !b.is_null());
            assert_ne!(a, b);

            arena.allocator.free(a);
            // b is still allocated, so a's slot should be immediately
            // reusable without carving a new leaf out of a bigger block.
            let c = arena.allocator.malloc(16);
            assert_eq!(c as usize, a as usize);

            arena.allocator.free(c);
            arena.allocator.free(b);

            // Fully coalesced: the whole usable region should once
            // again be obtainable as allocations matching the
            // post-init capacity.
            let mut reacquired = std::vec::Vec::new();
            loop {
                let p = arena.allocator.malloc(16);
                if p.is_null() {
                    break;
                }
                reacquired.push(p);
            }
            assert_eq!(reacquired.len(), 2);
            for p in reacquired {
                arena.allocator.free(p);
            }
        }
    }

    #[test]
    fn round_trip_restores_capacity() {
        unsafe {
            let arena = Arena::new(1024);
            let mut total = 0usize;
            loop {
                let p = arena.allocator.malloc(16);
                if p.is_null() {
                    break;
                }
                total += 1;
                arena.allocator.free(p);
                break; // single round trip is enough to prove no leak
            }
            assert_eq!(total, 1);

            let mut ptrs = std::vec::Vec::new();
            loop {
                let p = arena.allocator.malloc(64);
                if p.is_null() {
                    break;
                }
                ptrs.push(p);
            }
            let first_pass_count = ptrs.len();
            for p in ptrs {
                arena.allocator.free(p);
            }

            let mut ptrs2 = std::vec::Vec::new();
            loop {
                let p = arena.allocator.malloc(64);
                if p.is_null() {
                    break;
                }
                ptrs2.push(p);
            }
            assert_eq!(ptrs2.len(), first_pass_count);
            for p in ptrs2 {
                arena.allocator.free(p);
            }
        }
    }

    #[test]
    fn out_of_memory_returns_null() {
        unsafe {
            let arena = Arena::new(256);
            let mut ptrs = std::vec::Vec::new();
            loop {
                let p = arena.allocator.malloc(LEAF_SIZE);
                if p.is_null() {
                    break;
                }
                ptrs.push(p);
            }
            assert!(!ptrs.is_empty());
            assert!(arena.allocator.malloc(LEAF_SIZE).is_null());
            for p in ptrs {
                arena.allocator.free(p);
            }
        }
    }

    #[test]
    fn non_power_of_two_region_marks_slack_unavailable() {
        unsafe {
            // 4096 + 100 is not a power-of-two multiple of LEAF_SIZE;
            // the allocator must still initialize and never hand out
            // memory past the requested end.
            let arena = Arena::new(4196);
            let mut ptrs = std::vec::Vec::new();
            loop {
                let p = arena.allocator.malloc(LEAF_SIZE);
                if p.is_null() {
                    break;
                }
                let addr = p as usize;
                let region_end = arena._backing.as_ptr() as usize + 4196;
                assert!(addr + LEAF_SIZE <= region_end);
                ptrs.push(p);
            }
            for p in ptrs {
                arena.allocator.free(p);
            }
        }
    }
}
