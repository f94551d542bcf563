//! Intel VT-d hardware definitions: register map, global command bits and
//! the remapping descriptor formats.
//!
//! Every hardware descriptor here is a raw fixed-width integer (or a pair
//! of them) with explicit shift/mask accessors, never a language-level
//! bitfield, so the in-memory layout is byte-for-byte what the IOMMU
//! walks.

use bitflags::bitflags;

use vtprobe_abi::PAGE_SIZE;

/// DMAR register block of the q35 machine (the DRHD unit QEMU emulates).
pub const VTD_REG_BASE: u64 = 0xFED9_0000;

// =============================================================================
// Register Offsets (Intel VT-d spec, ch. 10)
// =============================================================================

/// Version Register (32-bit, RO).
pub const DMAR_VER_REG: usize = 0x00;

/// Capability Register (64-bit, RO).
pub const DMAR_CAP_REG: usize = 0x08;

/// Extended Capability Register (64-bit, RO).
pub const DMAR_ECAP_REG: usize = 0x10;

/// Global Command Register (32-bit, WO).
pub const DMAR_GCMD_REG: usize = 0x18;

/// Global Status Register (32-bit, RO).
pub const DMAR_GSTS_REG: usize = 0x1C;

/// Root Table Address Register (64-bit, R/W).
pub const DMAR_RTADDR_REG: usize = 0x20;

/// Context Command Register (64-bit, R/W).
pub const DMAR_CCMD_REG: usize = 0x28;

/// Fault Status Register (32-bit, R/W1C).
pub const DMAR_FSTS_REG: usize = 0x34;

/// Fault Event Control Register (32-bit, R/W).
pub const DMAR_FECTL_REG: usize = 0x38;

/// Fault Event Data Register (32-bit, R/W).
pub const DMAR_FEDATA_REG: usize = 0x3C;

/// Fault Event Address Register (32-bit, R/W).
pub const DMAR_FEADDR_REG: usize = 0x40;

/// Interrupt Remapping Table Address Register (64-bit, R/W).
pub const DMAR_IRTA_REG: usize = 0xB8;

// =============================================================================
// Global Command / Status Bits
// =============================================================================

bitflags! {
    /// Global command register bits. The global status register mirrors
    /// each bit once the hardware has acted on it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GlobalCommand: u32 {
        /// Latch the interrupt-remap table address programmed in IRTA.
        const IR_TABLE = 1 << 24;
        /// Interrupt-remapping enable.
        const INTERRUPT_REMAP = 1 << 25;
        /// Queued-invalidation enable.
        const QUEUED_INVALIDATION = 1 << 26;
        /// Write-buffer flush (legacy implementations).
        const WRITE_BUFFER_FLUSH = 1 << 27;
        /// Enable the advanced fault log.
        const FAULT_LOG = 1 << 29;
        /// Latch the root table address programmed in RTADDR.
        const ROOT_TABLE = 1 << 30;
        /// DMA-remapping (translation) enable.
        const TRANSLATION = 1 << 31;
    }
}

impl GlobalCommand {
    /// Commands that take effect synchronously; issuing one skips the
    /// status poll.
    pub const ONE_SHOT: Self = Self::IR_TABLE
        .union(Self::WRITE_BUFFER_FLUSH)
        .union(Self::FAULT_LOG)
        .union(Self::ROOT_TABLE);

    #[inline]
    pub fn is_one_shot(self) -> bool {
        Self::ONE_SHOT.contains(self)
    }
}

// =============================================================================
// Capability Register Bits
// =============================================================================

/// CAP.SAGAW bit for a 39-bit (3-level) second-level walk.
pub const VTD_CAP_SAGAW_39BIT: u64 = 0x2 << 8;

/// CAP.SLLPS: second-level large-page support (2 MiB and 1 GiB leaves).
pub const VTD_CAP_SLLPS: u64 = 0x3 << 34;

// =============================================================================
// Table Address Register Masks
// =============================================================================

pub const VTD_RTA_MASK: u64 = !(PAGE_SIZE - 1);
pub const VTD_IRTA_MASK: u64 = !(PAGE_SIZE - 1);

/// IRTA size field requesting the maximum table: 2^(0xF + 1) = 65536
/// entries.
pub const VTD_IRTA_SIZE_64K: u64 = 0xF;

// =============================================================================
// Second-Level Translation Geometry
// =============================================================================

/// Levels of the second-level walk. QEMU's VT-d supports a 39-bit address
/// width, which is 3-level translation.
pub const VTD_PAGE_LEVEL: usize = 3;

/// Context-entry address-width code for 39-bit/3-level.
pub const VTD_CE_AW_39BIT: u64 = 0x1;

/// Context-entry translation type: multi-level second-level paging.
pub const VTD_CE_TT_MULTI_LEVEL: u64 = 0x0;

bitflags! {
    /// Second-level page-table entry flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Entry is a large-page leaf (only meaningful above level 1).
        const HUGE = 1 << 7;
    }
}

/// Address field of a second-level PTE (bits 51:12).
pub const VTD_PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Read/write leaf permissions.
pub const VTD_PTE_RW: u64 = PteFlags::READ.bits() | PteFlags::WRITE.bits();

// =============================================================================
// Root Entry
// =============================================================================

/// One of the 256 root-table entries, indexed by PCI bus number. 16 bytes;
/// the high quadword is reserved.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootEntry {
    lo: u64,
    hi: u64,
}

impl RootEntry {
    const PRESENT: u64 = 1 << 0;

    #[inline]
    pub const fn zeroed() -> Self {
        Self { lo: 0, hi: 0 }
    }

    #[inline]
    pub const fn present(&self) -> bool {
        self.lo & Self::PRESENT != 0
    }

    /// Setting present publishes the entry to the hardware walker.
    #[inline]
    pub fn set_present(&mut self) {
        self.lo |= Self::PRESENT;
    }

    /// Physical address of the context table (bits 63:12 hold the frame).
    #[inline]
    pub const fn context_table_addr(&self) -> u64 {
        self.lo & VTD_PTE_ADDR_MASK
    }

    #[inline]
    pub fn set_context_table_addr(&mut self, addr: u64) {
        debug_assert!(addr & (PAGE_SIZE - 1) == 0);
        self.lo = (self.lo & !VTD_PTE_ADDR_MASK) | (addr & VTD_PTE_ADDR_MASK);
    }

    #[inline]
    pub const fn raw(&self) -> (u64, u64) {
        (self.lo, self.hi)
    }
}

// =============================================================================
// Context Entry
// =============================================================================

/// One of the 256 context-table entries, indexed by devfn. 16 bytes.
///
/// Low quadword: present (bit 0), fault-report disable (bit 1),
/// translation type (bits 3:2), second-level table pointer (bits 63:12).
/// High quadword: address width (bits 2:0), domain id (bits 23:8).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextEntry {
    lo: u64,
    hi: u64,
}

impl ContextEntry {
    const PRESENT: u64 = 1 << 0;
    const FAULT_REPORT_DISABLE: u64 = 1 << 1;
    const TT_SHIFT: u64 = 2;
    const TT_MASK: u64 = 0x3;
    const AW_MASK: u64 = 0x7;
    const DOMAIN_SHIFT: u64 = 8;
    const DOMAIN_MASK: u64 = 0xFFFF;

    #[inline]
    pub const fn zeroed() -> Self {
        Self { lo: 0, hi: 0 }
    }

    #[inline]
    pub const fn present(&self) -> bool {
        self.lo & Self::PRESENT != 0
    }

    #[inline]
    pub fn set_present(&mut self) {
        self.lo |= Self::PRESENT;
    }

    /// Suppress fault recording for this device's translations.
    #[inline]
    pub fn set_fault_report_disable(&mut self) {
        self.lo |= Self::FAULT_REPORT_DISABLE;
    }

    #[inline]
    pub fn set_translation_type(&mut self, tt: u64) {
        self.lo = (self.lo & !(Self::TT_MASK << Self::TT_SHIFT))
            | ((tt & Self::TT_MASK) << Self::TT_SHIFT);
    }

    /// Physical address of the second-level page-table root.
    #[inline]
    pub const fn second_level_table_addr(&self) -> u64 {
        self.lo & VTD_PTE_ADDR_MASK
    }

    #[inline]
    pub fn set_second_level_table_addr(&mut self, addr: u64) {
        debug_assert!(addr & (PAGE_SIZE - 1) == 0);
        self.lo = (self.lo & !VTD_PTE_ADDR_MASK) | (addr & VTD_PTE_ADDR_MASK);
    }

    #[inline]
    pub fn set_address_width(&mut self, aw: u64) {
        self.hi = (self.hi & !Self::AW_MASK) | (aw & Self::AW_MASK);
    }

    #[inline]
    pub const fn address_width(&self) -> u64 {
        self.hi & Self::AW_MASK
    }

    #[inline]
    pub fn set_domain_id(&mut self, domain: u16) {
        self.hi = (self.hi & !(Self::DOMAIN_MASK << Self::DOMAIN_SHIFT))
            | ((domain as u64) << Self::DOMAIN_SHIFT);
    }

    #[inline]
    pub const fn domain_id(&self) -> u16 {
        ((self.hi >> Self::DOMAIN_SHIFT) & Self::DOMAIN_MASK) as u16
    }

    #[inline]
    pub const fn raw(&self) -> (u64, u64) {
        (self.lo, self.hi)
    }
}

// =============================================================================
// Interrupt Remap Table Entry
// =============================================================================

/// Source-id validation: verify the full 16-bit requester id.
pub const IRTE_SVT_FULL_SID: u64 = 0x1;

/// One interrupt-remap table entry. 16 bytes.
///
/// Low quadword: present (0), fault-processing disable (1), destination
/// mode (2), redirection hint (3), trigger mode (4), delivery mode (7:5),
/// IRTE mode (15), vector (23:16), destination id (63:32).
/// High quadword: source id (15:0), source-id qualifier (17:16),
/// source-id validation type (19:18).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrtEntry {
    lo: u64,
    hi: u64,
}

impl IrtEntry {
    const PRESENT: u64 = 1 << 0;
    const FAULT_PROCESSING_DISABLE: u64 = 1 << 1;
    const DEST_MODE_SHIFT: u64 = 2;
    const REDIR_HINT_SHIFT: u64 = 3;
    const TRIGGER_MODE_SHIFT: u64 = 4;
    const DELIVERY_MODE_SHIFT: u64 = 5;
    const DELIVERY_MODE_MASK: u64 = 0x7;
    const IRTE_MODE_SHIFT: u64 = 15;
    const VECTOR_SHIFT: u64 = 16;
    const DEST_ID_SHIFT: u64 = 32;
    const SID_Q_SHIFT: u64 = 16;
    const SID_VTYPE_SHIFT: u64 = 18;

    #[inline]
    pub const fn zeroed() -> Self {
        Self { lo: 0, hi: 0 }
    }

    #[inline]
    pub const fn present(&self) -> bool {
        self.lo & Self::PRESENT != 0
    }

    #[inline]
    pub fn set_present(&mut self) {
        self.lo |= Self::PRESENT;
    }

    #[inline]
    pub fn set_fault_processing_disable(&mut self) {
        self.lo |= Self::FAULT_PROCESSING_DISABLE;
    }

    /// 0 = physical destination, 1 = logical.
    #[inline]
    pub fn set_dest_mode(&mut self, mode: u64) {
        self.lo = (self.lo & !(1 << Self::DEST_MODE_SHIFT))
            | ((mode & 1) << Self::DEST_MODE_SHIFT);
    }

    #[inline]
    pub fn set_redirection_hint(&mut self, hint: u64) {
        self.lo = (self.lo & !(1 << Self::REDIR_HINT_SHIFT))
            | ((hint & 1) << Self::REDIR_HINT_SHIFT);
    }

    /// 0 = edge, 1 = level.
    #[inline]
    pub fn set_trigger_mode(&mut self, mode: u64) {
        self.lo = (self.lo & !(1 << Self::TRIGGER_MODE_SHIFT))
            | ((mode & 1) << Self::TRIGGER_MODE_SHIFT);
    }

    /// 0 = fixed delivery.
    #[inline]
    pub fn set_delivery_mode(&mut self, mode: u64) {
        self.lo = (self.lo & !(Self::DELIVERY_MODE_MASK << Self::DELIVERY_MODE_SHIFT))
            | ((mode & Self::DELIVERY_MODE_MASK) << Self::DELIVERY_MODE_SHIFT);
    }

    /// 0 = remapped, 1 = posted.
    #[inline]
    pub fn set_irte_mode(&mut self, mode: u64) {
        self.lo = (self.lo & !(1 << Self::IRTE_MODE_SHIFT))
            | ((mode & 1) << Self::IRTE_MODE_SHIFT);
    }

    #[inline]
    pub fn set_vector(&mut self, vector: u8) {
        self.lo = (self.lo & !(0xFF << Self::VECTOR_SHIFT))
            | ((vector as u64) << Self::VECTOR_SHIFT);
    }

    #[inline]
    pub const fn vector(&self) -> u8 {
        ((self.lo >> Self::VECTOR_SHIFT) & 0xFF) as u8
    }

    #[inline]
    pub fn set_dest_id(&mut self, dest: u32) {
        self.lo = (self.lo & 0xFFFF_FFFF) | ((dest as u64) << Self::DEST_ID_SHIFT);
    }

    #[inline]
    pub const fn dest_id(&self) -> u32 {
        (self.lo >> Self::DEST_ID_SHIFT) as u32
    }

    #[inline]
    pub fn set_source_id(&mut self, sid: u16) {
        self.hi = (self.hi & !0xFFFF) | sid as u64;
    }

    #[inline]
    pub const fn source_id(&self) -> u16 {
        (self.hi & 0xFFFF) as u16
    }

    #[inline]
    pub fn set_sid_qualifier(&mut self, q: u64) {
        self.hi = (self.hi & !(0x3 << Self::SID_Q_SHIFT)) | ((q & 0x3) << Self::SID_Q_SHIFT);
    }

    #[inline]
    pub fn set_sid_validation_type(&mut self, vtype: u64) {
        self.hi = (self.hi & !(0x3 << Self::SID_VTYPE_SHIFT))
            | ((vtype & 0x3) << Self::SID_VTYPE_SHIFT);
    }

    #[inline]
    pub const fn raw(&self) -> (u64, u64) {
        (self.lo, self.hi)
    }
}

// =============================================================================
// Remappable MSI Message Encoding
// =============================================================================

/// Fixed interrupt head pattern of every x86 MSI address (0xFEEx_xxxx).
pub const MSI_ADDR_HEAD: u32 = 0xFEE << 20;

/// Interrupt format: remappable (the address carries a table handle).
pub const MSI_ADDR_REMAP_FORMAT: u32 = 1 << 4;

/// Sub-handle valid.
pub const MSI_ADDR_SHV: u32 = 1 << 3;

/// Bit 15 of the handle lands in address bit 2.
pub const MSI_ADDR_HANDLE_15: u32 = 1 << 2;

/// Handle bits 14:0 occupy address bits 19:5.
pub const MSI_ADDR_HANDLE_SHIFT: u32 = 5;

/// Encode an interrupt-remap table handle into the remappable MSI address
/// format. The high dword is zero (only used with x2APIC).
pub const fn remappable_msi_addr(handle: u16) -> u64 {
    let mut addr = MSI_ADDR_HEAD | MSI_ADDR_REMAP_FORMAT;
    addr |= ((handle as u32) & 0x7FFF) << MSI_ADDR_HANDLE_SHIFT;
    if handle & 0x8000 != 0 {
        addr |= MSI_ADDR_HANDLE_15;
    }
    addr as u64
}

/// Recover the handle from a remappable MSI address. Inverse of
/// [`remappable_msi_addr`].
pub const fn remappable_msi_handle(addr: u64) -> u16 {
    let low = ((addr >> MSI_ADDR_HANDLE_SHIFT as u64) & 0x7FFF) as u16;
    let high = (((addr >> 2) & 1) as u16) << 15;
    low | high
}

/// Encode the remappable MSI data word. Only the sub-handle field is
/// populated (upper half of the dword).
pub const fn remappable_msi_data(subhandle: u16) -> u32 {
    (subhandle as u32) << 16
}
