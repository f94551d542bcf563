//! Capability-list walking diagnostics.
//!
//! q35 exposes a deterministic set of capability chains: the ICH9 AHCI
//! controller (8086:2922) carries MSI (and no MSI-X), the host bridge has
//! no capabilities at all. The walk itself is unguarded: it
//! stops on a zero next-offset and nothing else. These tests focus on
//! chain order, termination and the handler dispatch.

use vtprobe_lib::testing::TestResult;
use vtprobe_lib::{assert_test, fail, pass};

use crate::pci::{
    PciCapabilityIter, pci_cap_walk, pci_config_read8, pci_device_info, pci_find_capability,
    pci_find_device,
};
use crate::pci_defs::*;

const ICH9_AHCI: (u16, u16) = (0x8086, 0x2922);

const MAX_OBSERVED_CAPS: usize = 64;

fn collect_caps(dev: &PciDeviceInfo) -> ([PciCapability; MAX_OBSERVED_CAPS], usize) {
    let mut caps = [PciCapability { offset: 0, id: 0 }; MAX_OBSERVED_CAPS];
    let mut len = 0;
    for cap in PciCapabilityIter::for_device(dev) {
        if len == MAX_OBSERVED_CAPS {
            break;
        }
        caps[len] = cap;
        len += 1;
    }
    (caps, len)
}

fn first_device_with_caps() -> Option<PciDeviceInfo> {
    for devfn in 0..PCI_DEVFN_MAX {
        if let Some(dev) = pci_device_info(devfn as u8) {
            if PciCapabilityIter::for_device(&dev).next().is_some() {
                return Some(dev);
            }
        }
    }
    None
}

// =============================================================================
// Walk correctness
// =============================================================================

/// The q35 host bridge has no capabilities; the iterator must be empty.
pub fn test_walk_empty_for_no_caps_device() -> TestResult {
    let dev = match pci_device_info(0) {
        Some(d) => d,
        None => return fail!("no host bridge at 00:00.0"),
    };
    let (_, len) = collect_caps(&dev);
    assert_test!(
        len == 0,
        "host bridge should have 0 capabilities, got {}",
        len
    );
    pass!()
}

/// Two walks over the same chain must yield identical nodes in identical
/// order.
pub fn test_walk_deterministic() -> TestResult {
    let dev = match first_device_with_caps() {
        Some(d) => d,
        None => return fail!("no PCI device with capabilities found"),
    };

    let (first, first_len) = collect_caps(&dev);
    let (second, second_len) = collect_caps(&dev);

    assert_test!(
        first_len == second_len,
        "capability count changed between walks: {} vs {}",
        first_len,
        second_len
    );
    for i in 0..first_len {
        assert_test!(
            first[i] == second[i],
            "capability mismatch at index {}: ({:02x}@{:02x}) vs ({:02x}@{:02x})",
            i,
            first[i].id,
            first[i].offset,
            second[i].id,
            second[i].offset
        );
    }
    pass!()
}

/// The iterator must visit exactly the nodes the raw next-offset chain
/// links, in chain order, and stop at the zero offset.
pub fn test_walk_matches_manual_chain() -> TestResult {
    let dev = match first_device_with_caps() {
        Some(d) => d,
        None => return fail!("no PCI device with capabilities found"),
    };

    let (walked, walked_len) = collect_caps(&dev);

    let mut offset = pci_config_read8(dev.bus, dev.device, dev.function, PCI_CAP_PTR_OFFSET) & 0xFC;
    let mut manual_len = 0;
    while offset != 0 && manual_len < MAX_OBSERVED_CAPS {
        let id = pci_config_read8(dev.bus, dev.device, dev.function, offset);
        assert_test!(
            manual_len < walked_len,
            "iterator stopped early at node {}",
            manual_len
        );
        assert_test!(
            walked[manual_len] == PciCapability { offset, id },
            "node {} differs: iterator ({:02x}@{:02x}) vs chain ({:02x}@{:02x})",
            manual_len,
            walked[manual_len].id,
            walked[manual_len].offset,
            id,
            offset
        );
        manual_len += 1;
        offset = pci_config_read8(dev.bus, dev.device, dev.function, offset + 1) & 0xFC;
    }

    assert_test!(
        manual_len == walked_len,
        "iterator visited {} nodes, chain has {}",
        walked_len,
        manual_len
    );
    pass!()
}

/// Every capability offset must be dword aligned and clear of the
/// standard header.
pub fn test_cap_offsets_valid() -> TestResult {
    for devfn in 0..PCI_DEVFN_MAX {
        let Some(dev) = pci_device_info(devfn as u8) else {
            continue;
        };
        for cap in PciCapabilityIter::for_device(&dev) {
            assert_test!(
                cap.offset & 0x03 == 0,
                "cap 0x{:02x} at 0x{:02x} on devfn 0x{:02x} is not dword aligned",
                cap.id,
                cap.offset,
                devfn
            );
            assert_test!(
                cap.offset >= 0x40,
                "cap 0x{:02x} at 0x{:02x} on devfn 0x{:02x} overlaps the standard header",
                cap.id,
                cap.offset,
                devfn
            );
        }
    }
    pass!()
}

// =============================================================================
// Handler dispatch
// =============================================================================

/// The walk's MSI handler must cache the same offset a live search finds.
pub fn test_msi_handler_caches_offset() -> TestResult {
    let mut dev = match pci_find_device(ICH9_AHCI.0, ICH9_AHCI.1) {
        Some(d) => d,
        None => return fail!("AHCI controller 8086:2922 not found"),
    };

    pci_cap_walk(&mut dev);

    let live = pci_find_capability(dev.bus, dev.device, dev.function, PCI_CAP_ID_MSI);
    assert_test!(live.is_some(), "AHCI controller advertises no MSI capability");
    assert_test!(
        dev.msi_cap_offset == live,
        "cached MSI offset {:?} != live walk {:?}",
        dev.msi_cap_offset,
        live
    );
    assert_test!(dev.has_msi(), "has_msi() disagrees with the cached offset");
    pass!()
}

/// A second walk must reach the same conclusions (the dispatch has no
/// hidden per-walk state).
pub fn test_walk_idempotent() -> TestResult {
    let mut dev = match pci_find_device(ICH9_AHCI.0, ICH9_AHCI.1) {
        Some(d) => d,
        None => return fail!("AHCI controller 8086:2922 not found"),
    };

    pci_cap_walk(&mut dev);
    let first = dev.msi_cap_offset;
    pci_cap_walk(&mut dev);
    assert_test!(
        dev.msi_cap_offset == first,
        "MSI offset changed across walks: {:?} -> {:?}",
        first,
        dev.msi_cap_offset
    );
    pass!()
}

/// Ids nobody registered a handler for are visited and ignored.
pub fn test_unhandled_ids_are_ignored() -> TestResult {
    let mut dev = match first_device_with_caps() {
        Some(d) => d,
        None => return fail!("no PCI device with capabilities found"),
    };

    // The AHCI chain carries PM and SATA capabilities no handler knows;
    // walking must simply skip them.
    pci_cap_walk(&mut dev);
    pass!()
}

// =============================================================================
// Misses
// =============================================================================

pub fn test_find_nonexistent_cap_returns_none() -> TestResult {
    for devfn in 0..PCI_DEVFN_MAX {
        let Some(dev) = pci_device_info(devfn as u8) else {
            continue;
        };
        if let Some(offset) = dev.find_capability(0xFF) {
            return fail!(
                "find_capability(0xFF) returned Some(0x{:02x}) on devfn 0x{:02x}",
                offset,
                devfn
            );
        }
    }
    pass!()
}

/// On a nonexistent function the status register reads all-ones (so the
/// cap-list bit looks set) and every id reads 0xFF; searching for a real
/// id must still miss.
pub fn test_find_cap_on_nonexistent_function() -> TestResult {
    let result = pci_find_capability(0, 31, 7, PCI_CAP_ID_MSI);
    assert_test!(
        result.is_none(),
        "found an MSI capability on a function that does not exist"
    );
    pass!()
}

vtprobe_lib::define_test_suite!(
    pci_cap,
    [
        test_walk_empty_for_no_caps_device,
        test_walk_deterministic,
        test_walk_matches_manual_chain,
        test_cap_offsets_valid,
        test_msi_handler_caches_offset,
        test_walk_idempotent,
        test_unhandled_ids_are_ignored,
        test_find_nonexistent_cap_returns_none,
        test_find_cap_on_nonexistent_function,
    ]
);
