//! One-shot initialization latch.
//!
//! Subsystems that must run their bring-up exactly once guard it with an
//! [`InitFlag`]:
//!
//! ```ignore
//! static PCI_INIT: InitFlag = InitFlag::new();
//!
//! pub fn pci_init() {
//!     if !PCI_INIT.init_once() {
//!         return; // somebody else already did (or is doing) the work
//!     }
//!     // ... one-time bring-up ...
//! }
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

/// Atomic one-shot latch for init-once subsystems.
pub struct InitFlag {
    set: AtomicBool,
}

impl InitFlag {
    #[inline]
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    /// Claim the initialization. Returns `true` for exactly one caller;
    /// every later (or concurrent) caller gets `false`.
    #[inline]
    pub fn init_once(&self) -> bool {
        self.set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the flag set unconditionally.
    #[inline]
    pub fn mark_set(&self) {
        self.set.store(true, Ordering::Release);
    }

    /// Whether initialization has happened (or been claimed).
    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Clear the flag. Only sensible for subsystems that support teardown.
    #[inline]
    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}
