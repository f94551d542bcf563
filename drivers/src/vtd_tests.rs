//! VT-d engine diagnostics: descriptor encodings, the bring-up status
//! protocol, the mapping builder's table structure and the interrupt-remap
//! index allocator.
//!
//! The hardware-facing tests call `vtd_init` themselves (it is idempotent)
//! and assume the environment brought up the HHDM and the page allocator
//! first. Table-structure checks walk the hierarchy in software through
//! the same phys->virt translation the builder uses.

use core::mem::size_of;
use core::ptr::read_volatile;

use vtprobe_abi::{PAGE_SIZE, PhysAddr};
use vtprobe_lib::testing::TestResult;
use vtprobe_lib::{assert_test, fail, pass};
use vtprobe_mm::hhdm::PhysAddrHhdm;

use crate::vtd::{
    IrteIndexAllocator, second_level_index, vtd_init, vtd_map_range, vtd_readl, vtd_readq,
    vtd_root_table,
};
use crate::vtd_defs::*;

// =============================================================================
// Descriptor layouts
// =============================================================================

/// The hardware walks 16-byte root/context/IRTE descriptors and 8-byte
/// PTEs; the Rust types must be exactly that.
pub fn test_descriptor_sizes() -> TestResult {
    assert_test!(size_of::<RootEntry>() == 16, "root entry is not 16 bytes");
    assert_test!(
        size_of::<ContextEntry>() == 16,
        "context entry is not 16 bytes"
    );
    assert_test!(size_of::<IrtEntry>() == 16, "IRTE is not 16 bytes");
    pass!()
}

pub fn test_root_entry_encoding() -> TestResult {
    let mut re = RootEntry::zeroed();
    re.set_context_table_addr(0x1234_5000);
    re.set_present();

    let (lo, hi) = re.raw();
    assert_test!(lo == 0x1234_5001, "root entry low quad: 0x{:x}", lo);
    assert_test!(hi == 0, "root entry high quad must stay reserved-zero");
    assert_test!(re.present() && re.context_table_addr() == 0x1234_5000);
    pass!()
}

pub fn test_context_entry_encoding() -> TestResult {
    let mut ce = ContextEntry::zeroed();
    ce.set_domain_id(0xBEEF);
    ce.set_address_width(VTD_CE_AW_39BIT);
    ce.set_second_level_table_addr(0xA_BCDE_0000);
    ce.set_translation_type(VTD_CE_TT_MULTI_LEVEL);
    ce.set_fault_report_disable();
    ce.set_present();

    let (lo, hi) = ce.raw();
    // present | fault-report-disable | tt=0 | slpt pointer
    assert_test!(lo == 0xA_BCDE_0003, "context entry low quad: 0x{:x}", lo);
    // aw=1 | domain in bits 23:8
    assert_test!(hi == 0x00BE_EF01, "context entry high quad: 0x{:x}", hi);
    assert_test!(ce.domain_id() == 0xBEEF && ce.address_width() == VTD_CE_AW_39BIT);
    pass!()
}

pub fn test_irte_encoding() -> TestResult {
    let mut irte = IrtEntry::zeroed();
    irte.set_fault_processing_disable();
    irte.set_dest_mode(0);
    irte.set_trigger_mode(0);
    irte.set_delivery_mode(0);
    irte.set_irte_mode(0);
    irte.set_vector(0x55);
    irte.set_dest_id(0x9);
    irte.set_source_id(0x00A8);
    irte.set_sid_qualifier(0);
    irte.set_sid_validation_type(IRTE_SVT_FULL_SID);
    irte.set_present();

    let (lo, hi) = irte.raw();
    let expect_lo = 1 | (1 << 1) | (0x55u64 << 16) | (0x9u64 << 32);
    let expect_hi = 0xA8u64 | (IRTE_SVT_FULL_SID << 18);
    assert_test!(lo == expect_lo, "IRTE low quad: 0x{:x} != 0x{:x}", lo, expect_lo);
    assert_test!(hi == expect_hi, "IRTE high quad: 0x{:x} != 0x{:x}", hi, expect_hi);
    assert_test!(irte.vector() == 0x55 && irte.dest_id() == 0x9 && irte.source_id() == 0xA8);
    pass!()
}

// =============================================================================
// Remappable MSI encoding
// =============================================================================

/// Handle -> address encoding must be a bijection over the full 16-bit
/// space: bit 15 lands in address bit 2, bits 14:0 in bits 19:5.
pub fn test_msi_handle_encoding_bijection() -> TestResult {
    for handle in [0u16, 1, 32767, 32768, 65535] {
        let addr = remappable_msi_addr(handle);

        assert_test!(
            (addr >> 20) & 0xFFF == 0xFEE,
            "handle {}: interrupt head missing (addr 0x{:x})",
            handle,
            addr
        );
        assert_test!(
            addr & MSI_ADDR_REMAP_FORMAT as u64 != 0,
            "handle {}: remap-format flag clear",
            handle
        );
        assert_test!(
            addr & MSI_ADDR_SHV as u64 == 0,
            "handle {}: sub-handle-valid must stay clear",
            handle
        );
        assert_test!(
            (addr >> 2) & 1 == (handle >> 15) as u64,
            "handle {}: bit 15 misplaced",
            handle
        );
        assert_test!(
            (addr >> 5) & 0x7FFF == (handle & 0x7FFF) as u64,
            "handle {}: low 15 bits misplaced",
            handle
        );
        assert_test!(
            addr >> 32 == 0,
            "handle {}: high dword must be zero without x2apic",
            handle
        );
        assert_test!(
            remappable_msi_handle(addr) == handle,
            "handle {} does not round-trip",
            handle
        );
    }
    pass!()
}

pub fn test_msi_data_zero_subhandle() -> TestResult {
    assert_test!(remappable_msi_data(0) == 0, "zero sub-handle must encode to 0");
    assert_test!(
        remappable_msi_data(0x1234) == 0x1234_0000,
        "sub-handle belongs in the upper half of the data word"
    );
    pass!()
}

// =============================================================================
// IRTE index allocator (isolated instance)
// =============================================================================

pub fn test_irte_allocator_monotonic() -> TestResult {
    let mut alloc = IrteIndexAllocator::new();
    for expected in 0..1024u16 {
        let index = alloc.alloc();
        assert_test!(
            index == expected,
            "allocation {} returned {}",
            expected,
            index
        );
    }
    assert_test!(alloc.allocated() == 1024);
    pass!()
}

/// Drive a local allocator through its whole index space: 65535 calls
/// succeed with strictly increasing values, after which the space is
/// spent (one more call would be fatal).
pub fn test_irte_allocator_ceiling() -> TestResult {
    let mut alloc = IrteIndexAllocator::new();
    let mut last = alloc.alloc();
    for _ in 1..IrteIndexAllocator::MAX_INDEXES {
        let index = alloc.alloc();
        assert_test!(index > last, "indexes must be strictly increasing");
        last = index;
    }
    assert_test!(last == 65534, "last allocatable index is {}", last);
    assert_test!(alloc.remaining() == 0, "space must be exhausted");
    pass!()
}

// =============================================================================
// Bring-up status
// =============================================================================

pub fn test_bringup_status_bits() -> TestResult {
    vtd_init();

    assert_test!(vtd_readl(DMAR_FSTS_REG) == 0, "fault status not clean");

    let status = vtd_readl(DMAR_GSTS_REG);
    for (bit, what) in [
        (GlobalCommand::QUEUED_INVALIDATION, "queued invalidation"),
        (GlobalCommand::ROOT_TABLE, "root table"),
        (GlobalCommand::IR_TABLE, "interrupt-remap table"),
        (GlobalCommand::TRANSLATION, "translation"),
        (GlobalCommand::INTERRUPT_REMAP, "interrupt remapping"),
    ] {
        assert_test!(
            status & bit.bits() != 0,
            "{} not reflected in the status register",
            what
        );
    }
    pass!()
}

pub fn test_cap_39bit_address_width() -> TestResult {
    vtd_init();
    assert_test!(
        vtd_readq(DMAR_CAP_REG) & VTD_CAP_SAGAW_39BIT != 0,
        "39-bit address width not supported"
    );
    pass!()
}

pub fn test_cap_large_page_support() -> TestResult {
    vtd_init();
    assert_test!(
        vtd_readq(DMAR_CAP_REG) & VTD_CAP_SLLPS != 0,
        "second-level large pages not supported"
    );
    pass!()
}

// =============================================================================
// Mapping builder structure
// =============================================================================

fn read_root_entry(bus: usize) -> RootEntry {
    let table = vtd_root_table();
    unsafe { read_volatile(table.to_virt().as_ptr::<RootEntry>().add(bus)) }
}

fn read_context_entry(source_id: u16) -> Option<ContextEntry> {
    let bus = (source_id >> 8) as usize;
    let devfn = (source_id & 0xFF) as usize;
    let re = read_root_entry(bus);
    if !re.present() {
        return None;
    }
    let table = PhysAddr::new(re.context_table_addr());
    Some(unsafe { read_volatile(table.to_virt().as_ptr::<ContextEntry>().add(devfn)) })
}

/// Software walk from the context entry down to the leaf PTE for `iova`.
fn read_leaf_pte(source_id: u16, iova: u64) -> Option<u64> {
    let ce = read_context_entry(source_id)?;
    if !ce.present() {
        return None;
    }

    let mut table = PhysAddr::new(ce.second_level_table_addr());
    let mut level = VTD_PAGE_LEVEL;
    while level > 1 {
        let index = second_level_index(iova, level);
        let pte = unsafe { read_volatile(table.to_virt().as_ptr::<u64>().add(index)) };
        if pte & VTD_PTE_RW == 0 {
            return None;
        }
        table = PhysAddr::new(pte & VTD_PTE_ADDR_MASK);
        level -= 1;
    }

    let index = second_level_index(iova, 1);
    let leaf = unsafe { read_volatile(table.to_virt().as_ptr::<u64>().add(index)) };
    if leaf & VTD_PTE_RW == 0 { None } else { Some(leaf) }
}

/// A single-page mapping creates exactly one leaf with read/write set and
/// a context entry carrying the fixed domain/width convention.
pub fn test_map_range_single_page() -> TestResult {
    vtd_init();

    let sid: u16 = 0x0028;
    let phys = 0x0123_4000u64;
    vtd_map_range(sid, 0, PhysAddr::new(phys), PAGE_SIZE);

    let ce = match read_context_entry(sid) {
        Some(ce) => ce,
        None => return fail!("no context entry was created"),
    };
    assert_test!(ce.present(), "context entry not present");
    assert_test!(ce.domain_id() == sid, "domain id must equal the source id");
    assert_test!(
        ce.address_width() == VTD_CE_AW_39BIT,
        "context entry not set up for a 3-level walk"
    );

    let leaf = match read_leaf_pte(sid, 0) {
        Some(pte) => pte,
        None => return fail!("no leaf entry was created"),
    };
    assert_test!(
        leaf == phys | VTD_PTE_RW,
        "leaf entry 0x{:x} != 0x{:x}",
        leaf,
        phys | VTD_PTE_RW
    );
    assert_test!(
        leaf & PteFlags::HUGE.bits() == 0,
        "a 4 KiB leaf must not carry the huge-page flag"
    );

    // Neighbouring slots stay empty.
    assert_test!(
        read_leaf_pte(sid, PAGE_SIZE).is_none(),
        "mapping spilled into the next iova slot"
    );
    pass!()
}

/// An N-page mapping creates N contiguous leaves.
pub fn test_map_range_multi_page() -> TestResult {
    vtd_init();

    let sid: u16 = 0x0030;
    let iova = 0x40_0000u64;
    let phys = 0x0222_0000u64;
    let pages = 4u64;
    vtd_map_range(sid, iova, PhysAddr::new(phys), pages * PAGE_SIZE);

    for page in 0..pages {
        let leaf = match read_leaf_pte(sid, iova + page * PAGE_SIZE) {
            Some(pte) => pte,
            None => return fail!("page {} has no leaf entry", page),
        };
        let expect = (phys + page * PAGE_SIZE) | VTD_PTE_RW;
        assert_test!(
            leaf == expect,
            "page {}: leaf 0x{:x} != 0x{:x}",
            page,
            leaf,
            expect
        );
    }
    pass!()
}

/// A second mapping for the same source id must reuse the root and
/// context entries instead of reallocating them.
pub fn test_map_range_reuses_tables() -> TestResult {
    vtd_init();

    let sid: u16 = 0x0030;
    // First mapping creates the entries; snapshot them.
    vtd_map_range(sid, 0x40_0000, PhysAddr::new(0x0222_0000), PAGE_SIZE);
    let before_root = read_root_entry((sid >> 8) as usize);
    let before_ce = match read_context_entry(sid) {
        Some(ce) => ce,
        None => return fail!("no context entry after the first mapping"),
    };

    vtd_map_range(sid, 0x80_0000, PhysAddr::new(0x0333_0000), PAGE_SIZE);

    let after_root = read_root_entry((sid >> 8) as usize);
    let after_ce = match read_context_entry(sid) {
        Some(ce) => ce,
        None => return fail!("context entry vanished"),
    };

    assert_test!(
        before_root == after_root,
        "root entry was reallocated on a repeat mapping"
    );
    assert_test!(
        before_ce.second_level_table_addr() == after_ce.second_level_table_addr(),
        "second-level root was reallocated on a repeat mapping"
    );
    pass!()
}

/// Remapping an iova overwrites the leaf: last write wins, with no
/// invalidation issued (the documented limitation of this builder).
pub fn test_map_range_overwrites_leaf() -> TestResult {
    vtd_init();

    let sid: u16 = 0x0038;
    let iova = 0x10_0000u64;
    vtd_map_range(sid, iova, PhysAddr::new(0x0444_0000), PAGE_SIZE);
    vtd_map_range(sid, iova, PhysAddr::new(0x0555_0000), PAGE_SIZE);

    let leaf = match read_leaf_pte(sid, iova) {
        Some(pte) => pte,
        None => return fail!("no leaf entry after remap"),
    };
    assert_test!(
        leaf == 0x0555_0000 | VTD_PTE_RW,
        "remap did not take: leaf 0x{:x}",
        leaf
    );
    pass!()
}

vtprobe_lib::define_test_suite!(
    vtd,
    [
        test_descriptor_sizes,
        test_root_entry_encoding,
        test_context_entry_encoding,
        test_irte_encoding,
        test_msi_handle_encoding_bijection,
        test_msi_data_zero_subhandle,
        test_irte_allocator_monotonic,
        test_irte_allocator_ceiling,
        test_bringup_status_bits,
        test_cap_39bit_address_width,
        test_cap_large_page_support,
        test_map_range_single_page,
        test_map_range_multi_page,
        test_map_range_reuses_tables,
        test_map_range_overwrites_leaf,
    ]
);
