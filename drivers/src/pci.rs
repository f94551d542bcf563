//! PCI configuration-space access, device discovery, BAR sizing and the
//! capability walk.
//!
//! Everything here drives the legacy configuration mechanism (ports
//! 0xCF8/0xCFC) and only ever looks at bus 0; the machine under test is
//! QEMU q35 with every interesting device on the root bus. The raw
//! accessors at the top are the externally-supplied primitives the rest of
//! the layer is built from.

use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::instructions::interrupts;

use vtprobe_lib::ports::{PCI_CONFIG_ADDRESS, PCI_CONFIG_DATA};
use vtprobe_lib::{InitFlag, IrqMutex, klog_info};

pub use crate::pci_defs::*;

// =============================================================================
// Raw Configuration Space Access (legacy mechanism #1)
// =============================================================================

/// Compute the 32-bit address for legacy PCI configuration port I/O.
#[inline(always)]
fn pci_config_addr(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset as u32) & 0xFC)
}

/// Read a 32-bit value from PCI config space.
pub fn pci_config_read32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    unsafe {
        PCI_CONFIG_ADDRESS.write(pci_config_addr(bus, device, function, offset));
        PCI_CONFIG_DATA.read()
    }
}

/// Read a 16-bit value from PCI config space.
pub fn pci_config_read16(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    let value = pci_config_read32(bus, device, function, offset);
    ((value >> ((offset & 0x2) * 8)) & 0xFFFF) as u16
}

/// Read an 8-bit value from PCI config space.
pub fn pci_config_read8(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
    let value = pci_config_read32(bus, device, function, offset);
    ((value >> ((offset & 0x3) * 8)) & 0xFF) as u8
}

/// Write a 32-bit value to PCI config space.
pub fn pci_config_write32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    unsafe {
        PCI_CONFIG_ADDRESS.write(pci_config_addr(bus, device, function, offset));
        PCI_CONFIG_DATA.write(value);
    }
}

/// Write a 16-bit value to PCI config space (read-modify-write).
pub fn pci_config_write16(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    let dword = pci_config_read32(bus, device, function, offset);
    let shift = (offset & 0x2) * 8;
    let mask = !(0xFFFFu32 << shift);
    let new_dword = (dword & mask) | ((value as u32) << shift);
    pci_config_write32(bus, device, function, offset, new_dword);
}

/// Write an 8-bit value to PCI config space (read-modify-write).
pub fn pci_config_write8(bus: u8, device: u8, function: u8, offset: u8, value: u8) {
    let dword = pci_config_read32(bus, device, function, offset);
    let shift = (offset & 0x3) * 8;
    let mask = !(0xFFu32 << shift);
    let new_dword = (dword & mask) | ((value as u32) << shift);
    pci_config_write32(bus, device, function, offset, new_dword);
}

// =============================================================================
// Device Discovery (bus 0)
// =============================================================================

#[inline]
const fn devfn_device(devfn: u8) -> u8 {
    devfn >> 3
}

#[inline]
const fn devfn_function(devfn: u8) -> u8 {
    devfn & 0x7
}

/// Whether a device responds at the given bus-0 device/function slot.
///
/// A slot with nothing behind it reads all-ones; both the vendor id and
/// the device id must differ from the 0xFFFF sentinel.
pub fn pci_device_exists(devfn: u8) -> bool {
    let device = devfn_device(devfn);
    let function = devfn_function(devfn);
    pci_config_read16(0, device, function, PCI_VENDOR_ID_OFFSET) != PCI_VENDOR_ID_INVALID
        && pci_config_read16(0, device, function, PCI_DEVICE_ID_OFFSET) != PCI_VENDOR_ID_INVALID
}

/// Read the identity registers of a bus-0 slot into a fresh device handle.
///
/// BAR bases and the MSI offset are left uncached; [`pci_enable_defaults`]
/// fills them in.
pub fn pci_device_info(devfn: u8) -> Option<PciDeviceInfo> {
    if !pci_device_exists(devfn) {
        return None;
    }

    let device = devfn_device(devfn);
    let function = devfn_function(devfn);
    let mut info = PciDeviceInfo::zeroed();
    info.bus = 0;
    info.device = device;
    info.function = function;
    info.vendor_id = pci_config_read16(0, device, function, PCI_VENDOR_ID_OFFSET);
    info.device_id = pci_config_read16(0, device, function, PCI_DEVICE_ID_OFFSET);
    info.revision = pci_config_read8(0, device, function, PCI_REVISION_ID_OFFSET);
    info.prog_if = pci_config_read8(0, device, function, PCI_PROG_IF_OFFSET);
    info.subclass = pci_config_read8(0, device, function, PCI_SUBCLASS_OFFSET);
    info.class_code = pci_config_read8(0, device, function, PCI_CLASS_CODE_OFFSET);
    info.header_type = pci_config_read8(0, device, function, PCI_HEADER_TYPE_OFFSET) & 0x7F;
    Some(info)
}

/// Linear scan of every device/function slot on bus 0 for a vendor/device
/// pair. Returns the first match. Only bus 0 is scanned.
pub fn pci_find_device(vendor_id: u16, device_id: u16) -> Option<PciDeviceInfo> {
    for devfn in 0..PCI_DEVFN_MAX {
        let devfn = devfn as u8;
        let device = devfn_device(devfn);
        let function = devfn_function(devfn);
        if pci_config_read16(0, device, function, PCI_VENDOR_ID_OFFSET) == vendor_id
            && pci_config_read16(0, device, function, PCI_DEVICE_ID_OFFSET) == device_id
        {
            return pci_device_info(devfn);
        }
    }
    None
}

// =============================================================================
// Command Register
// =============================================================================

/// Set and clear bits in the command register, leaving the rest untouched.
///
/// # Panics
///
/// Panics if `set` and `clr` overlap.
pub fn pci_command_set_clr(dev: &PciDeviceInfo, set: u16, clr: u16) {
    assert!(set & clr == 0, "overlapping set/clear command bits");

    let mut value = pci_config_read16(dev.bus, dev.device, dev.function, PCI_COMMAND_OFFSET);
    value |= set;
    value &= !clr;
    pci_config_write16(dev.bus, dev.device, dev.function, PCI_COMMAND_OFFSET, value);
}

// =============================================================================
// BAR Sizing and Decoding
// =============================================================================

/// Classify a raw BAR dword.
///
/// # Panics
///
/// Panics on the reserved memory-type encoding (0x3), an out-of-spec
/// response from the device model.
pub fn pci_bar_kind(raw: u32) -> PciBarKind {
    if raw & PCI_BAR_SPACE_IO != 0 {
        return PciBarKind::Io;
    }
    match (raw >> PCI_BAR_MEM_TYPE_SHIFT) & PCI_BAR_MEM_TYPE_MASK {
        PCI_BAR_MEM_TYPE_32 => PciBarKind::Mem32,
        PCI_BAR_MEM_TYPE_1M => PciBarKind::Mem1M,
        PCI_BAR_MEM_TYPE_64 => PciBarKind::Mem64,
        _ => panic!("unrecognized BAR memory type encoding: 0x{:08x}", raw),
    }
}

/// Platform translation from a bus address decoded out of a BAR to the
/// physical address the CPU uses. Identity on q35.
#[inline]
pub fn pci_translate_addr(_devfn: u8, addr: u64) -> u64 {
    addr
}

/// Size-probe one BAR dword: save the original value, write all-ones, read
/// back, restore. Returns the raw probe readback.
fn pci_bar_size_probe(bus: u8, device: u8, function: u8, bar_idx: usize) -> u32 {
    let offset = PCI_BAR0_OFFSET + (bar_idx as u8) * 4;
    let original = pci_config_read32(bus, device, function, offset);
    pci_config_write32(bus, device, function, offset, !0u32);
    let probe = pci_config_read32(bus, device, function, offset);
    pci_config_write32(bus, device, function, offset, original);
    probe
}

/// Determine the address space consumed by one BAR.
///
/// The classic probe: save the original value, write all-ones, read back,
/// mask the information bits, restore, then invert and add one. For a
/// 64-bit BAR both halves are probed and concatenated before the invert.
/// The whole save/probe/restore sequence runs with interrupts disabled so
/// nothing else can observe or clobber the register mid-probe.
pub fn pci_bar_probe(dev: &PciDeviceInfo, bar_idx: usize) -> PciBarInfo {
    let (bus, device, function) = (dev.bus, dev.device, dev.function);
    let offset = PCI_BAR0_OFFSET + (bar_idx as u8) * 4;

    interrupts::without_interrupts(|| {
        let raw = pci_config_read32(bus, device, function, offset);
        let probe = pci_bar_size_probe(bus, device, function, bar_idx);
        if probe == 0 || probe == !0u32 {
            return PciBarInfo::absent();
        }

        let kind = pci_bar_kind(raw);
        let masked = probe & kind.size_mask();
        if masked == 0 {
            return PciBarInfo::absent();
        }

        let (base, size) = if kind.is_64bit() {
            let raw_hi = pci_config_read32(bus, device, function, offset + 4);
            let probe_hi = pci_bar_size_probe(bus, device, function, bar_idx + 1);
            let full = ((probe_hi as u64) << 32) | masked as u64;
            let base = ((raw_hi as u64) << 32) | (raw & kind.size_mask()) as u64;
            (base, (!full).wrapping_add(1))
        } else {
            let base = (raw & kind.size_mask()) as u64;
            (base, (!masked).wrapping_add(1) as u64)
        };

        PciBarInfo {
            base: pci_translate_addr(dev.devfn(), base),
            size,
            kind,
            prefetchable: kind != PciBarKind::Io && raw & PCI_BAR_PREFETCHABLE != 0,
        }
    })
}

/// Probe every BAR slot of a device. The high half of a 64-bit pair is
/// reported as an absent slot.
pub fn pci_enumerate_bars(dev: &PciDeviceInfo) -> [PciBarInfo; PCI_MAX_BARS] {
    let mut bars = [PciBarInfo::absent(); PCI_MAX_BARS];
    let mut idx = 0;
    while idx < PCI_MAX_BARS {
        let bar = pci_bar_probe(dev, idx);
        bars[idx] = bar;
        if bar.is_present() && bar.kind.is_64bit() {
            // The next slot holds the high dword, not a BAR of its own.
            idx += 1;
        }
        idx += 1;
    }
    bars
}

/// Probe all BARs and cache the decoded bases on the device handle.
pub fn pci_scan_bars(dev: &mut PciDeviceInfo) {
    dev.bars = pci_enumerate_bars(dev);
}

// =============================================================================
// Capability List Walking
// =============================================================================

/// Iterator over the nodes of a device's capability list.
///
/// Starts at the Capabilities Pointer (offset 0x34) and follows each
/// node's next-offset field (at `offset + 1`) until it reads zero. The
/// bottom two bits of every pointer are reserved and masked off.
///
/// There is no guard against a config space whose next-offsets form a
/// cycle: such a chain is walked forever. The device models this driver
/// probes are trusted to terminate their lists.
pub struct PciCapabilityIter {
    bus: u8,
    device: u8,
    function: u8,
    next_ptr: u8,
}

impl PciCapabilityIter {
    /// Create a capability iterator for the specified PCI function.
    ///
    /// Returns an empty iterator if the device's Status register does not
    /// advertise a capabilities list (bit 4 of Status).
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        let status = pci_config_read16(bus, device, function, PCI_STATUS_OFFSET);
        let first_ptr = if status & PCI_STATUS_CAP_LIST != 0 {
            pci_config_read8(bus, device, function, PCI_CAP_PTR_OFFSET) & 0xFC
        } else {
            0
        };

        Self {
            bus,
            device,
            function,
            next_ptr: first_ptr,
        }
    }

    /// Create a capability iterator for a known [`PciDeviceInfo`].
    pub fn for_device(info: &PciDeviceInfo) -> Self {
        Self::new(info.bus, info.device, info.function)
    }
}

impl Iterator for PciCapabilityIter {
    type Item = PciCapability;

    fn next(&mut self) -> Option<PciCapability> {
        if self.next_ptr == 0 {
            return None;
        }

        let offset = self.next_ptr;
        let id = pci_config_read8(self.bus, self.device, self.function, offset);
        let next = pci_config_read8(self.bus, self.device, self.function, offset + 1) & 0xFC;

        self.next_ptr = next;
        Some(PciCapability { offset, id })
    }
}

/// Find the first capability with the given ID.
///
/// Returns the config-space byte offset of the capability header, or
/// `None` if the device doesn't advertise that capability.
pub fn pci_find_capability(bus: u8, device: u8, function: u8, cap_id: u8) -> Option<u8> {
    PciCapabilityIter::new(bus, device, function)
        .find(|cap| cap.id == cap_id)
        .map(|cap| cap.offset)
}

impl PciDeviceInfo {
    /// Find the first capability with the given ID for this device.
    pub fn find_capability(&self, cap_id: u8) -> Option<u8> {
        pci_find_capability(self.bus, self.device, self.function, cap_id)
    }

    /// Iterate over all PCI capabilities of this device.
    pub fn capabilities(&self) -> PciCapabilityIter {
        PciCapabilityIter::for_device(self)
    }
}

// =============================================================================
// Capability Handler Dispatch
// =============================================================================

/// A handler invoked for each capability node whose id it registered for.
/// It receives the device handle and the node's config-space offset.
pub type PciCapHandler = fn(&mut PciDeviceInfo, u8);

#[derive(Clone, Copy)]
struct CapHandlerEntry {
    id: u8,
    handler: PciCapHandler,
}

struct CapHandlerRegistry {
    entries: [Option<CapHandlerEntry>; PCI_CAP_HANDLER_MAX],
    count: usize,
}

impl CapHandlerRegistry {
    const fn new() -> Self {
        Self {
            entries: [None; PCI_CAP_HANDLER_MAX],
            count: 0,
        }
    }
}

static CAP_HANDLERS: IrqMutex<CapHandlerRegistry> = IrqMutex::new(CapHandlerRegistry::new());
static CAP_HANDLERS_INIT: InitFlag = InitFlag::new();
static CAP_WALK_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Register a handler for a capability id. Returns `false` when the
/// registry is full. Capability ids without a handler are ignored by the
/// walk.
pub fn pci_register_cap_handler(cap_id: u8, handler: PciCapHandler) -> bool {
    let mut registry = CAP_HANDLERS.lock();
    let idx = registry.count;
    if idx >= PCI_CAP_HANDLER_MAX {
        return false;
    }
    registry.entries[idx] = Some(CapHandlerEntry {
        id: cap_id,
        handler,
    });
    registry.count = idx + 1;
    true
}

fn cap_handler_for(cap_id: u8) -> Option<PciCapHandler> {
    let registry = CAP_HANDLERS.lock();
    registry.entries[..registry.count]
        .iter()
        .flatten()
        .find(|entry| entry.id == cap_id)
        .map(|entry| entry.handler)
}

/// The one handler registered by default: remember where the MSI
/// capability lives so the interrupt path can program it later.
fn pci_cap_msi_handler(dev: &mut PciDeviceInfo, cap_offset: u8) {
    klog_info!(
        "PCI: detected MSI for device {:02x}:{:02x}.{} at offset 0x{:02x}",
        dev.bus,
        dev.device,
        dev.function,
        cap_offset
    );
    dev.msi_cap_offset = Some(cap_offset);
}

fn register_default_cap_handlers() {
    if !CAP_HANDLERS_INIT.init_once() {
        return;
    }
    pci_register_cap_handler(PCI_CAP_ID_MSI, pci_cap_msi_handler);
}

/// Walk the device's capability list, invoking the registered handler (if
/// any) for every node visited. Terminates on a zero next-offset.
pub fn pci_cap_walk(dev: &mut PciDeviceInfo) {
    register_default_cap_handlers();
    CAP_WALK_COUNT.fetch_add(1, Ordering::Relaxed);

    let iter = PciCapabilityIter::new(dev.bus, dev.device, dev.function);
    for cap in iter {
        klog_info!("PCI: detected cap 0x{:02x} at offset 0x{:02x}", cap.id, cap.offset);
        if let Some(handler) = cap_handler_for(cap.id) {
            handler(dev, cap.offset);
        }
    }
}

/// How many capability walks have run. Diagnostic counter.
pub fn pci_cap_walk_count() -> usize {
    CAP_WALK_COUNT.load(Ordering::Relaxed)
}

// =============================================================================
// Device Bring-up
// =============================================================================

/// Standard bring-up for a device this driver is about to use: cache its
/// BAR bases, allow it to master the bus (DMA), and walk its capability
/// list so the MSI offset is known.
pub fn pci_enable_defaults(dev: &mut PciDeviceInfo) {
    pci_scan_bars(dev);
    // Enable device DMA operations.
    pci_command_set_clr(dev, PCI_COMMAND_BUS_MASTER, 0);
    pci_cap_walk(dev);
}

// =============================================================================
// Bus Scan (logging)
// =============================================================================

/// Log every device on bus 0 together with its implemented BARs. Returns
/// the number of devices found.
pub fn pci_scan_bus() -> usize {
    let mut count = 0;
    for devfn in 0..PCI_DEVFN_MAX {
        let Some(dev) = pci_device_info(devfn as u8) else {
            continue;
        };
        count += 1;

        klog_info!(
            "PCI: [{:02x}:{:02x}.{}] VID=0x{:04x} DID=0x{:04x} class=0x{:02x}:{:02x} progif=0x{:02x} rev=0x{:02x}",
            dev.bus,
            dev.device,
            dev.function,
            dev.vendor_id,
            dev.device_id,
            dev.class_code,
            dev.subclass,
            dev.prog_if,
            dev.revision
        );

        if dev.header_type != 0 {
            continue;
        }

        for (idx, bar) in pci_enumerate_bars(&dev).iter().enumerate() {
            if !bar.is_present() {
                continue;
            }
            let space = match bar.kind {
                PciBarKind::Io => "PIO",
                PciBarKind::Mem32 => "MEM32",
                PciBarKind::Mem1M => "MEM1M",
                PciBarKind::Mem64 => "MEM64",
            };
            klog_info!(
                "    BAR{}: {} base=0x{:x} size=0x{:x}{}",
                idx,
                space,
                bar.base,
                bar.size,
                if bar.prefetchable { " prefetch" } else { "" }
            );
        }
    }
    count
}
