//! Higher Half Direct Map (HHDM) translation.
//!
//! Single source of truth for the HHDM offset. Everything that turns a
//! physical address into a dereferenceable pointer (or back) goes through
//! this module.
//!
//! # Usage
//!
//! ```ignore
//! use vtprobe_abi::PhysAddr;
//! use vtprobe_mm::hhdm::{self, PhysAddrHhdm};
//!
//! // The boot environment initialises the offset once:
//! hhdm::init(direct_map_offset);
//!
//! let phys = PhysAddr::new(0x1000);
//! let virt = phys.to_virt(); // panics if HHDM is not initialised
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

use vtprobe_abi::{PhysAddr, VirtAddr};
use vtprobe_lib::InitFlag;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static HHDM_INIT: InitFlag = InitFlag::new();

pub fn init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);

    if !HHDM_INIT.init_once() {
        panic!("HHDM already initialized - init() called twice!");
    }
}

#[inline]
pub fn is_available() -> bool {
    HHDM_INIT.is_set()
}

/// Get the raw HHDM offset value.
///
/// # Panics
///
/// Debug-panics if HHDM has not been initialized. In release builds,
/// returns 0 (which will cause incorrect translations).
#[inline]
pub fn offset() -> u64 {
    debug_assert!(
        is_available(),
        "HHDM not initialized - call hhdm::init() first"
    );
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Get the HHDM offset, returning None if not initialized.
#[inline]
pub fn try_offset() -> Option<u64> {
    if is_available() {
        Some(HHDM_OFFSET.load(Ordering::Acquire))
    } else {
        None
    }
}

// =============================================================================
// Extension traits
// =============================================================================

/// HHDM translation methods on [`PhysAddr`].
pub trait PhysAddrHhdm {
    /// Convert physical address to virtual address via the HHDM.
    ///
    /// Returns `VirtAddr::NULL` for a null physical address.
    ///
    /// # Panics
    ///
    /// Panics if HHDM has not been initialized.
    fn to_virt(self) -> VirtAddr;

    /// Try to convert physical to virtual. Returns `None` if the physical
    /// address is null or HHDM is not available.
    fn try_to_virt(self) -> Option<VirtAddr>;
}

impl PhysAddrHhdm for PhysAddr {
    #[inline]
    fn to_virt(self) -> VirtAddr {
        if self.is_null() {
            return VirtAddr::NULL;
        }
        assert!(is_available(), "HHDM not initialized");
        VirtAddr::new(self.as_u64() + HHDM_OFFSET.load(Ordering::Acquire))
    }

    #[inline]
    fn try_to_virt(self) -> Option<VirtAddr> {
        if self.is_null() || !is_available() {
            return None;
        }
        Some(VirtAddr::new(
            self.as_u64() + HHDM_OFFSET.load(Ordering::Acquire),
        ))
    }
}

/// Reverse HHDM translation on [`VirtAddr`].
///
/// Only valid for addresses that came out of the direct map in the first
/// place.
pub trait VirtAddrHhdm {
    /// Convert a direct-map virtual address back to its physical address.
    ///
    /// # Panics
    ///
    /// Panics if HHDM has not been initialized or the address lies below
    /// the direct-map base.
    fn to_phys(self) -> PhysAddr;

    /// Try to convert virtual to physical.
    fn try_to_phys(self) -> Option<PhysAddr>;
}

impl VirtAddrHhdm for VirtAddr {
    #[inline]
    fn to_phys(self) -> PhysAddr {
        assert!(is_available(), "HHDM not initialized");
        let offset = HHDM_OFFSET.load(Ordering::Acquire);
        assert!(
            self.as_u64() >= offset,
            "virtual address 0x{:x} is not inside the direct map",
            self.as_u64()
        );
        PhysAddr::new(self.as_u64() - offset)
    }

    #[inline]
    fn try_to_phys(self) -> Option<PhysAddr> {
        let offset = try_offset()?;
        if self.as_u64() < offset {
            return None;
        }
        PhysAddr::try_new(self.as_u64() - offset)
    }
}
