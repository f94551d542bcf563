//! Intel VT-d engine: register protocol, DMA-remapping table builder and
//! interrupt-remapping table builder.
//!
//! The engine owns the hardware-visible tables it allocates. Table pages
//! come out of the frame allocator via `OwnedPageFrame::into_phys`, which
//! transfers ownership to the table hierarchy; they are never freed. All
//! intermediate "pointers" in the hierarchy are physical addresses,
//! translated through the HHDM at every step of a walk; no raw pointer
//! arithmetic crosses a table level.
//!
//! Execution is single-threaded and synchronous. The only suspension point
//! is the global-command status poll, which blocks until the emulated
//! hardware acknowledges, so a hung device model hangs the caller. Callers on multiple contexts need external mutual exclusion;
//! the engine assumes one initializer and a sequential series of mapping
//! and interrupt-setup calls.

use core::hint::spin_loop;
use core::ptr::{read_volatile, write_volatile};

use spin::Once;

use vtprobe_abi::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr};
use vtprobe_lib::{InitFlag, IrqMutex, klog_debug, klog_info};
use vtprobe_mm::hhdm::PhysAddrHhdm;
use vtprobe_mm::page_alloc::OwnedPageFrame;

use crate::msi::{MsiError, pci_setup_msi};
use crate::pci_defs::PciDeviceInfo;
use crate::vtd_defs::*;

// =============================================================================
// Register Access
// =============================================================================

/// Virtual base of the register block, resolved through the HHDM once.
static VTD_REGS: Once<VirtAddr> = Once::new();

#[inline]
fn vtd_reg_ptr<T>(reg: usize) -> *mut T {
    let base = *VTD_REGS.call_once(|| PhysAddr::new(VTD_REG_BASE).to_virt());
    (base.as_u64() + reg as u64) as *mut T
}

pub fn vtd_readl(reg: usize) -> u32 {
    // SAFETY: `reg` is one of the DMAR_*_REG offsets into the mapped
    // register block; all accesses are naturally sized and volatile.
    unsafe { read_volatile(vtd_reg_ptr::<u32>(reg)) }
}

pub fn vtd_readq(reg: usize) -> u64 {
    unsafe { read_volatile(vtd_reg_ptr::<u64>(reg)) }
}

pub fn vtd_writel(reg: usize, value: u32) {
    unsafe { write_volatile(vtd_reg_ptr::<u32>(reg), value) }
}

pub fn vtd_writeq(reg: usize, value: u64) {
    unsafe { write_volatile(vtd_reg_ptr::<u64>(reg), value) }
}

// =============================================================================
// Engine State
// =============================================================================

/// Errors from the bounded register-protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtdError {
    /// The status register never reflected the issued command.
    HardwareUnresponsive,
}

/// Monotonic allocator for interrupt-remap table indexes.
///
/// Indexes are handed out once and never reused; the 16-bit MSI handle
/// encoding bounds the space. Owned state rather than a process-wide
/// counter so the ceiling is testable on a local instance.
pub struct IrteIndexAllocator {
    next: u32,
}

impl IrteIndexAllocator {
    /// Highest count of allocatable indexes.
    pub const MAX_INDEXES: u32 = 65535;

    #[inline]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Hand out the next index.
    ///
    /// # Panics
    ///
    /// Panics when the index space is exhausted.
    pub fn alloc(&mut self) -> u16 {
        assert!(
            self.next < Self::MAX_INDEXES,
            "interrupt-remap index space exhausted"
        );
        let index = self.next as u16;
        self.next += 1;
        index
    }

    /// How many indexes have been handed out.
    #[inline]
    pub const fn allocated(&self) -> u32 {
        self.next
    }

    /// How many more [`Self::alloc`] calls will succeed.
    #[inline]
    pub const fn remaining(&self) -> u32 {
        Self::MAX_INDEXES - self.next
    }
}

impl Default for IrteIndexAllocator {
    fn default() -> Self {
        Self::new()
    }
}

struct VtdState {
    irte_indexes: IrteIndexAllocator,
}

static VTD_STATE: IrqMutex<VtdState> = IrqMutex::new(VtdState {
    irte_indexes: IrteIndexAllocator::new(),
});
static VTD_INIT: InitFlag = InitFlag::new();

// =============================================================================
// Global Command Protocol
// =============================================================================

/// Write one command bit on top of the currently-enabled features.
///
/// The status register holds the authoritative picture of what is enabled;
/// OR-ing the new bit into it keeps unrelated features undisturbed.
fn vtd_gcmd_write(cmd: GlobalCommand) {
    // Mixing independent commands in one write is a programming error,
    // not a hardware capability.
    assert!(
        cmd.bits().count_ones() == 1,
        "global command writes must set exactly one bit"
    );
    let status = vtd_readl(DMAR_GSTS_REG);
    vtd_writel(DMAR_GCMD_REG, status | cmd.bits());
}

/// Issue one global command and wait for the hardware to acknowledge it.
///
/// One-shot commands return immediately; everything else spins on the
/// status register until the bit appears. There is no timeout: hardware
/// that never acknowledges hangs the caller here.
pub fn vtd_gcmd_set(cmd: GlobalCommand) {
    vtd_gcmd_write(cmd);
    if cmd.is_one_shot() {
        return;
    }
    while vtd_readl(DMAR_GSTS_REG) & cmd.bits() == 0 {
        spin_loop();
    }
}

/// [`vtd_gcmd_set`] with an iteration bound, for callers that prefer a
/// "hardware unresponsive" error to an indefinite hang.
pub fn vtd_gcmd_set_bounded(cmd: GlobalCommand, max_spins: u64) -> Result<(), VtdError> {
    vtd_gcmd_write(cmd);
    if cmd.is_one_shot() {
        return Ok(());
    }
    for _ in 0..max_spins {
        if vtd_readl(DMAR_GSTS_REG) & cmd.bits() != 0 {
            return Ok(());
        }
        spin_loop();
    }
    Err(VtdError::HardwareUnresponsive)
}

// =============================================================================
// Table Addresses
// =============================================================================

/// Physical base of the root table, read back from the hardware register.
/// No extended root table support.
pub fn vtd_root_table() -> PhysAddr {
    PhysAddr::new(vtd_readq(DMAR_RTADDR_REG) & VTD_RTA_MASK)
}

/// Physical base of the interrupt-remap table.
pub fn vtd_ir_table() -> PhysAddr {
    PhysAddr::new(vtd_readq(DMAR_IRTA_REG) & VTD_IRTA_MASK)
}

/// Allocate a zeroed page and transfer its ownership to the hardware
/// table hierarchy.
fn alloc_table_page() -> PhysAddr {
    let Some(page) = OwnedPageFrame::alloc_zeroed() else {
        panic!("out of page frames for a remapping table");
    };
    page.into_phys()
}

/// Entry pointer into a physically-addressed table, translated through
/// the HHDM.
#[inline]
fn table_entry_ptr<T>(table: PhysAddr, index: usize) -> *mut T {
    unsafe { table.to_virt().as_mut_ptr::<T>().add(index) }
}

// =============================================================================
// Initialization
// =============================================================================

fn vtd_dump_init_info() {
    klog_info!("VT-d: version 0x{:x}", vtd_readl(DMAR_VER_REG));
    klog_info!("VT-d: cap     0x{:016x}", vtd_readq(DMAR_CAP_REG));
    klog_info!("VT-d: ecap    0x{:016x}", vtd_readq(DMAR_ECAP_REG));
}

fn vtd_setup_root_table() {
    let root = alloc_table_page();
    vtd_writeq(DMAR_RTADDR_REG, root.as_u64());
    vtd_gcmd_set(GlobalCommand::ROOT_TABLE);
    klog_info!("VT-d: root table at 0x{:016x}", vtd_root_table().as_u64());
}

fn vtd_setup_ir_table() {
    let table = alloc_table_page();
    // Advertise the maximum table size; only low indexes are populated.
    vtd_writeq(DMAR_IRTA_REG, table.as_u64() | VTD_IRTA_SIZE_64K);
    vtd_gcmd_set(GlobalCommand::IR_TABLE);
    klog_info!(
        "VT-d: interrupt-remap table at 0x{:016x}",
        vtd_ir_table().as_u64()
    );
}

/// Bring up the IOMMU. Each step depends on the table addresses programmed
/// by the one before it, so the order is fixed: queued invalidation, root
/// table, interrupt-remap table, translation enable, interrupt-remap
/// enable.
///
/// Idempotent; only the first caller does the work.
pub fn vtd_init() {
    if !VTD_INIT.init_once() {
        return;
    }

    vtd_dump_init_info();
    vtd_gcmd_set(GlobalCommand::QUEUED_INVALIDATION);
    vtd_setup_root_table();
    vtd_setup_ir_table();
    vtd_gcmd_set(GlobalCommand::TRANSLATION);
    vtd_gcmd_set(GlobalCommand::INTERRUPT_REMAP);
    klog_info!("VT-d: translation and interrupt remapping enabled");
}

pub fn vtd_is_initialized() -> bool {
    VTD_INIT.is_set()
}

// =============================================================================
// DMA Remapping Table Builder
// =============================================================================

/// 9-bit slice of the I/O virtual address indexing the table at `level`
/// (level 1 is the leaf level).
#[inline]
pub const fn second_level_index(iova: u64, level: usize) -> usize {
    ((iova >> (PAGE_SHIFT + 9 * (level as u64 - 1))) & 0x1FF) as usize
}

/// Install one mapping at `target_level`, allocating intermediate tables
/// on the way down.
fn vtd_install_pte(slpt: PhysAddr, iova: u64, pa: PhysAddr, target_level: usize) {
    let mut table = slpt;
    let mut level = VTD_PAGE_LEVEL;

    while level > target_level {
        let entry = table_entry_ptr::<u64>(table, second_level_index(iova, level));
        // SAFETY: `entry` points into a zero-initialized table page owned
        // by this hierarchy.
        let mut pte = unsafe { read_volatile(entry) };
        if pte & VTD_PTE_RW == 0 {
            let child = alloc_table_page();
            pte = child.as_u64() | VTD_PTE_RW;
            unsafe { write_volatile(entry, pte) };
        }
        table = PhysAddr::new(pte & VTD_PTE_ADDR_MASK);
        level -= 1;
    }

    let entry = table_entry_ptr::<u64>(table, second_level_index(iova, level));
    let mut pte = pa.as_u64() | VTD_PTE_RW;
    if level != 1 {
        // A leaf above the deepest level is a huge page.
        pte |= PteFlags::HUGE.bits();
    }
    // Last write wins; a previous translation for this iova is not
    // invalidated from any IOTLB.
    unsafe { write_volatile(entry, pte) };
}

/// Map `[iova, iova + size)` to `[phys, phys + size)` for the device with
/// the given source id, creating root/context/page-table entries as
/// needed. Repeated calls for the same source id reuse the existing
/// entries.
///
/// # Panics
///
/// `iova`, `phys` and `size` must all be 4 KiB aligned; this is a caller contract,
/// not a recoverable error.
pub fn vtd_map_range(source_id: u16, mut iova: u64, phys: PhysAddr, size: u64) {
    assert!(iova & (PAGE_SIZE - 1) == 0, "iova must be 4 KiB aligned");
    assert!(phys.is_aligned(PAGE_SIZE), "phys must be 4 KiB aligned");
    assert!(size & (PAGE_SIZE - 1) == 0, "size must be 4 KiB aligned");

    let bus = (source_id >> 8) as usize;
    let devfn = (source_id & 0xFF) as usize;

    // Root entry for the device's bus.
    let re_ptr = table_entry_ptr::<RootEntry>(vtd_root_table(), bus);
    // SAFETY: the root table is one zeroed page owned by the engine;
    // `bus` indexes one of its 256 16-byte entries.
    let mut re = unsafe { read_volatile(re_ptr) };
    let context_table = if re.present() {
        PhysAddr::new(re.context_table_addr())
    } else {
        let table = alloc_table_page();
        re = RootEntry::zeroed();
        re.set_context_table_addr(table.as_u64());
        re.set_present();
        unsafe { write_volatile(re_ptr, re) };
        klog_info!("VT-d: allocated root entry for PCI bus {}", bus);
        table
    };

    // Context entry for the device's devfn.
    let ce_ptr = table_entry_ptr::<ContextEntry>(context_table, devfn);
    let mut ce = unsafe { read_volatile(ce_ptr) };
    let slpt = if ce.present() {
        PhysAddr::new(ce.second_level_table_addr())
    } else {
        let table = alloc_table_page();
        ce = ContextEntry::zeroed();
        // To keep it simple, the domain id is the source id.
        ce.set_domain_id(source_id);
        // Only the 39-bit (3-level) width is exercised.
        ce.set_address_width(VTD_CE_AW_39BIT);
        ce.set_second_level_table_addr(table.as_u64());
        ce.set_translation_type(VTD_CE_TT_MULTI_LEVEL);
        // No fault reporting wired up.
        ce.set_fault_report_disable();
        ce.set_present();
        unsafe { write_volatile(ce_ptr, ce) };
        klog_info!("VT-d: allocated context entry for devfn 0x{:02x}", devfn);
        table
    };

    let mut pa = phys.as_u64();
    let mut remaining = size;
    while remaining != 0 {
        klog_debug!(
            "VT-d: map 4K page iova 0x{:x} -> 0x{:x} (sid 0x{:04x})",
            iova,
            pa,
            source_id
        );
        vtd_install_pte(slpt, iova, PhysAddr::new(pa), 1);
        remaining -= PAGE_SIZE;
        iova += PAGE_SIZE;
        pa += PAGE_SIZE;
    }
}

// =============================================================================
// Interrupt Remapping Table Builder
// =============================================================================

/// Allocate the next interrupt-remap table index.
pub fn vtd_intr_index_alloc() -> u16 {
    VTD_STATE.lock().irte_indexes.alloc()
}

/// Populate the interrupt-remap entry at `index` for the given device.
pub fn vtd_setup_irte(dev: &PciDeviceInfo, index: u16, vector: u8, dest_id: u32) {
    let mut irte = IrtEntry::zeroed();
    irte.set_fault_processing_disable();
    irte.set_dest_mode(0); // physical
    irte.set_trigger_mode(0); // edge
    irte.set_delivery_mode(0); // fixed
    irte.set_irte_mode(0); // remapped
    irte.set_vector(vector);
    irte.set_dest_id(dest_id);
    irte.set_source_id(dev.source_id());
    irte.set_sid_qualifier(0);
    irte.set_sid_validation_type(IRTE_SVT_FULL_SID);
    irte.set_present();

    let (lo, hi) = irte.raw();
    let slot = table_entry_ptr::<u64>(vtd_ir_table(), index as usize * 2);
    // SAFETY: `slot` indexes a 16-byte entry of the interrupt-remap table
    // page. The high half lands before the low half, whose present bit
    // publishes the entry.
    unsafe {
        write_volatile(slot.add(1), hi);
        write_volatile(slot, lo);
    }

    klog_info!(
        "VT-d: IRTE {} -> vector 0x{:02x} dest {} (sid 0x{:04x})",
        index,
        vector,
        dest_id,
        dev.source_id()
    );
}

/// Route a device's MSI through the interrupt-remap table: allocate an
/// index, populate its entry, encode the handle into the remappable MSI
/// address format and program the device's MSI capability.
///
/// # Errors
///
/// Propagates [`MsiError::NoCapability`] from the MSI programmer
/// unchanged.
pub fn vtd_setup_msi(dev: &PciDeviceInfo, vector: u8, dest_id: u32) -> Result<(), MsiError> {
    let index = vtd_intr_index_alloc();
    klog_info!("VT-d: setting up remapped MSI via IRTE index {}", index);
    vtd_setup_irte(dev, index, vector, dest_id);

    let msi_addr = remappable_msi_addr(index);
    let msi_data = remappable_msi_data(0);
    pci_setup_msi(dev, msi_addr, msi_data)
}
