#![no_std]

pub mod addr;

pub use addr::{PhysAddr, VirtAddr};

/// Size of the smallest hardware page. Every table this workspace hands to
/// hardware is exactly one of these.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;
