//! Kernel-side I/O abstractions that sit above the frame manager:
//! pipes (spec.md §4.11) and the disk block-cache buffer header.

pub mod buf;
pub mod pipe;
