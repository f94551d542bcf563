//! Page allocator and HHDM diagnostics.
//!
//! These run after the boot environment has called `hhdm::init` and
//! `init_page_allocator`; they exercise the collaborator contracts the
//! remapping engine depends on (zeroed page-aligned frames, bidirectional
//! phys⇄virt translation, ownership transfer).

use vtprobe_abi::{PAGE_SIZE, PhysAddr};
use vtprobe_lib::testing::TestResult;
use vtprobe_lib::{assert_test, fail, pass};

use crate::hhdm::{self, PhysAddrHhdm, VirtAddrHhdm};
use crate::page_alloc::{
    ALLOC_FLAG_ZERO, OwnedPageFrame, alloc_page_frame, free_page_frame,
    get_page_allocator_stats, page_allocator_is_initialized,
};

pub fn test_allocator_initialized() -> TestResult {
    assert_test!(
        page_allocator_is_initialized(),
        "page allocator was never initialized by the environment"
    );
    assert_test!(hhdm::is_available(), "HHDM offset was never initialized");
    pass!()
}

pub fn test_page_alloc_single() -> TestResult {
    let phys = alloc_page_frame(0);
    if phys.is_null() {
        return fail!("single page allocation failed");
    }
    assert_test!(
        phys.is_aligned(PAGE_SIZE),
        "allocated frame 0x{:x} is not page aligned",
        phys.as_u64()
    );
    free_page_frame(phys);
    pass!()
}

pub fn test_page_alloc_zeroed() -> TestResult {
    let phys = alloc_page_frame(ALLOC_FLAG_ZERO);
    if phys.is_null() {
        return fail!("zeroed page allocation failed");
    }

    let words = phys.to_virt().as_ptr::<u64>();
    for i in 0..(PAGE_SIZE as usize / 8) {
        let word = unsafe { core::ptr::read(words.add(i)) };
        if word != 0 {
            free_page_frame(phys);
            return fail!("frame not zeroed at word {} (0x{:x})", i, word);
        }
    }

    free_page_frame(phys);
    pass!()
}

pub fn test_page_alloc_distinct() -> TestResult {
    let a = alloc_page_frame(0);
    let b = alloc_page_frame(0);
    if a.is_null() || b.is_null() {
        if !a.is_null() {
            free_page_frame(a);
        }
        if !b.is_null() {
            free_page_frame(b);
        }
        return fail!("allocating two frames failed");
    }
    let distinct = a != b;
    free_page_frame(a);
    free_page_frame(b);
    assert_test!(distinct, "two live allocations returned the same frame");
    pass!()
}

pub fn test_page_alloc_free_reuse() -> TestResult {
    let stats_before = get_page_allocator_stats();

    let phys = alloc_page_frame(0);
    if phys.is_null() {
        return fail!("first allocation failed");
    }
    free_page_frame(phys);

    let again = alloc_page_frame(0);
    if again.is_null() {
        return fail!("allocation after free failed");
    }
    free_page_frame(again);

    let stats_after = get_page_allocator_stats();
    assert_test!(
        stats_before.free == stats_after.free,
        "free count drifted across an alloc/free cycle: {} -> {}",
        stats_before.free,
        stats_after.free
    );
    pass!()
}

pub fn test_owned_page_frame_drop_frees() -> TestResult {
    let stats_before = get_page_allocator_stats();
    {
        let page = match OwnedPageFrame::alloc_zeroed() {
            Some(p) => p,
            None => return fail!("OwnedPageFrame allocation failed"),
        };
        unsafe { page.as_mut_ptr::<u32>().write(0xA5A5_5A5A) };
    }
    let stats_after = get_page_allocator_stats();
    assert_test!(
        stats_before.free == stats_after.free,
        "dropping an OwnedPageFrame did not return the frame"
    );
    pass!()
}

pub fn test_hhdm_round_trip() -> TestResult {
    let page = match OwnedPageFrame::alloc_zeroed() {
        Some(p) => p,
        None => return fail!("allocation failed"),
    };

    let phys = page.phys_addr();
    let virt = phys.to_virt();
    let back = virt.to_phys();
    assert_test!(
        back == phys,
        "phys->virt->phys round trip changed the address: 0x{:x} -> 0x{:x}",
        phys.as_u64(),
        back.as_u64()
    );

    // The translated pointer must reach the same memory the allocator
    // handed out: write through it and read it back.
    unsafe {
        virt.as_mut_ptr::<u64>().write_volatile(0xDEAD_BEEF_CAFE_F00D);
        let read = virt.as_ptr::<u64>().read_volatile();
        assert_test!(read == 0xDEAD_BEEF_CAFE_F00D, "direct-map write not visible");
    }
    pass!()
}

pub fn test_null_phys_translates_to_null() -> TestResult {
    assert_test!(
        PhysAddr::NULL.to_virt().is_null(),
        "null physical address must translate to the null virtual address"
    );
    pass!()
}

vtprobe_lib::define_test_suite!(
    mm,
    [
        test_allocator_initialized,
        test_page_alloc_single,
        test_page_alloc_zeroed,
        test_page_alloc_distinct,
        test_page_alloc_free_reuse,
        test_owned_page_frame_drop_frees,
        test_hhdm_round_trip,
        test_null_phys_translates_to_null,
    ]
);
