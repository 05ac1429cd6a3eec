//! Physical memory management (spec.md §3–§4.5, L1–L3): the buddy
//! allocator, the reference-counted frame manager built on it, the
//! kernel's own `GlobalAlloc`, and the Sv39 page-table manager.

pub mod buddy;
pub mod frame;
pub mod kalloc;
pub mod vm;
