//! Physical page-frame allocator.
//!
//! A bitmap allocator over one contiguous region of physical memory that
//! the boot environment hands to [`init_page_allocator`]. Every consumer in
//! this tree wants the same thing from it: zeroed, page-aligned, physically
//! addressable 4 KiB frames: remapping tables, interrupt-remap tables and
//! DMA buffers alike.
//!
//! Allocation state lives behind an [`IrqMutex`]; the zero-fill path goes
//! through the HHDM, so the HHDM must be initialised before the first
//! `ALLOC_FLAG_ZERO` allocation.

use vtprobe_abi::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr};
use vtprobe_lib::{InitFlag, IrqMutex, klog_info};

use crate::hhdm::PhysAddrHhdm;

/// Zero the frame before returning it.
pub const ALLOC_FLAG_ZERO: u32 = 0x01;

/// Upper bound on managed frames (128 MiB); the bitmap is sized for this.
pub const PAGE_ALLOCATOR_MAX_FRAMES: u32 = 32768;

const BITMAP_WORDS: usize = (PAGE_ALLOCATOR_MAX_FRAMES as usize) / 64;

struct PageAllocState {
    base: PhysAddr,
    frame_count: u32,
    free_count: u32,
    /// One bit per frame; set means allocated.
    bitmap: [u64; BITMAP_WORDS],
    /// Search start hint, advanced on allocation.
    next_hint: u32,
}

impl PageAllocState {
    const fn new() -> Self {
        Self {
            base: PhysAddr::NULL,
            frame_count: 0,
            free_count: 0,
            bitmap: [0; BITMAP_WORDS],
            next_hint: 0,
        }
    }

    fn frame_is_allocated(&self, frame: u32) -> bool {
        self.bitmap[frame as usize / 64] & (1 << (frame % 64)) != 0
    }

    fn mark_allocated(&mut self, frame: u32) {
        self.bitmap[frame as usize / 64] |= 1 << (frame % 64);
    }

    fn mark_free(&mut self, frame: u32) {
        self.bitmap[frame as usize / 64] &= !(1 << (frame % 64));
    }

    fn find_free_frame(&self) -> Option<u32> {
        let count = self.frame_count;
        for probe in 0..count {
            let frame = (self.next_hint + probe) % count;
            if !self.frame_is_allocated(frame) {
                return Some(frame);
            }
        }
        None
    }
}

static PAGE_ALLOCATOR: IrqMutex<PageAllocState> = IrqMutex::new(PageAllocState::new());
static PAGE_ALLOC_INIT: InitFlag = InitFlag::new();

/// Hand a contiguous physical region to the allocator.
///
/// `base` must be page aligned; `frame_count` is clamped to
/// [`PAGE_ALLOCATOR_MAX_FRAMES`]. Called once by the boot environment.
pub fn init_page_allocator(base: PhysAddr, frame_count: u32) {
    assert!(
        base.is_aligned(PAGE_SIZE),
        "page allocator base must be page aligned"
    );
    assert!(frame_count > 0, "page allocator needs at least one frame");

    if !PAGE_ALLOC_INIT.init_once() {
        return;
    }

    let capped = frame_count.min(PAGE_ALLOCATOR_MAX_FRAMES);
    let mut state = PAGE_ALLOCATOR.lock();
    state.base = base;
    state.frame_count = capped;
    state.free_count = capped;

    klog_info!(
        "MM: page allocator managing {} frames at 0x{:x} ({} KiB)",
        capped,
        base.as_u64(),
        capped as u64 * PAGE_SIZE / 1024
    );
}

#[inline]
pub fn page_allocator_is_initialized() -> bool {
    PAGE_ALLOC_INIT.is_set()
}

/// Allocate one 4 KiB frame. Returns `PhysAddr::NULL` when the region is
/// exhausted.
pub fn alloc_page_frame(flags: u32) -> PhysAddr {
    let phys = {
        let mut state = PAGE_ALLOCATOR.lock();
        let Some(frame) = state.find_free_frame() else {
            return PhysAddr::NULL;
        };
        state.mark_allocated(frame);
        state.free_count -= 1;
        state.next_hint = (frame + 1) % state.frame_count;
        PhysAddr::new(state.base.as_u64() + ((frame as u64) << PAGE_SHIFT))
    };

    if flags & ALLOC_FLAG_ZERO != 0 {
        let virt = phys.to_virt();
        // SAFETY: the frame was just taken out of the allocator's region,
        // is page aligned, and nobody else holds it.
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) };
    }

    phys
}

/// Return a frame to the allocator.
///
/// # Panics
///
/// Panics on a frame outside the managed region or one that is not
/// currently allocated (double free).
pub fn free_page_frame(phys: PhysAddr) {
    assert!(phys.is_aligned(PAGE_SIZE), "freeing an unaligned address");

    let mut state = PAGE_ALLOCATOR.lock();
    let offset = phys
        .as_u64()
        .checked_sub(state.base.as_u64())
        .expect("freeing a frame below the managed region");
    let frame = (offset >> PAGE_SHIFT) as u32;
    assert!(
        frame < state.frame_count,
        "freeing a frame outside the managed region"
    );
    assert!(state.frame_is_allocated(frame), "double free of page frame");
    state.mark_free(frame);
    state.free_count += 1;
}

/// Allocator occupancy counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageAllocStats {
    pub total: u32,
    pub free: u32,
    pub allocated: u32,
}

pub fn get_page_allocator_stats() -> PageAllocStats {
    let state = PAGE_ALLOCATOR.lock();
    PageAllocStats {
        total: state.frame_count,
        free: state.free_count,
        allocated: state.frame_count - state.free_count,
    }
}

// =============================================================================
// OwnedPageFrame - RAII wrapper for automatic page deallocation
// =============================================================================

/// An owned page frame that returns its physical memory to the allocator
/// when dropped.
///
/// Tables handed to hardware use [`OwnedPageFrame::into_phys`] to leak the
/// frame on purpose: from that point the hardware-visible table owns it and
/// it is never freed.
pub struct OwnedPageFrame {
    phys: PhysAddr,
}

impl OwnedPageFrame {
    /// Allocate a frame with the given flags. `None` when out of memory.
    #[inline]
    pub fn alloc(flags: u32) -> Option<Self> {
        let phys = alloc_page_frame(flags);
        if phys.is_null() { None } else { Some(Self { phys }) }
    }

    /// Allocate a zeroed frame, the common pattern for DMA buffers and
    /// hardware-visible tables, which must start in a known state.
    #[inline]
    pub fn alloc_zeroed() -> Option<Self> {
        Self::alloc(ALLOC_FLAG_ZERO)
    }

    /// The physical address of this frame.
    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    /// The physical address as a raw u64, for hardware registers.
    #[inline]
    pub fn phys_u64(&self) -> u64 {
        self.phys.as_u64()
    }

    /// The virtual address of this frame via HHDM translation.
    #[inline]
    pub fn virt_addr(&self) -> VirtAddr {
        self.phys.to_virt()
    }

    /// The frame as a typed mutable pointer.
    ///
    /// The pointer must not outlive this `OwnedPageFrame`.
    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.virt_addr().as_mut_ptr()
    }

    /// The frame as a typed const pointer.
    #[inline]
    pub fn as_ptr<T>(&self) -> *const T {
        self.virt_addr().as_ptr()
    }

    /// Consume the wrapper and return the physical address without freeing.
    ///
    /// Ownership transfers to the caller, typically to a hardware-visible
    /// table that will reference the frame for the rest of the run.
    #[inline]
    pub fn into_phys(self) -> PhysAddr {
        let phys = self.phys;
        core::mem::forget(self);
        phys
    }
}

impl Drop for OwnedPageFrame {
    fn drop(&mut self) {
        free_page_frame(self.phys);
    }
}
