//! Memory constants shared by the allocator and the table builders.

pub use vtprobe_abi::{PAGE_SHIFT, PAGE_SIZE};

pub const PAGE_SIZE_4KB: u64 = PAGE_SIZE;
pub const PAGE_SIZE_4KB_USIZE: usize = PAGE_SIZE as usize;

/// 512-way radix: a 4 KiB table of 8-byte entries.
pub const ENTRIES_PER_PAGE_TABLE: usize = 512;
