//! MSI (Message Signaled Interrupts) programming for PCI devices.
//!
//! This module writes a fully-formed message address/data pair into a
//! device's MSI capability registers. It does not decide what the message
//! *means*; on this machine the interrupt-remapping engine encodes the
//! address as a table handle and hands it over (`vtd::vtd_setup_msi`).
//!
//! ## Register layout reference (PCI Local Bus Spec §6.8)
//!
//! ```text
//! Offset  Size  Field
//! +0x00   8     Cap ID (0x05) | Next Pointer
//! +0x02   16    Message Control
//! +0x04   32    Message Address (lower)
//! +0x08   32    Message Address (upper), only if 64-bit capable
//! +0x08/C 32    Message Data
//! ```

use vtprobe_lib::klog_info;

use crate::pci::{pci_config_read16, pci_config_write16, pci_config_write32};
use crate::pci_defs::PciDeviceInfo;

// =============================================================================
// MSI Message Control register bits (offset +2 from capability base)
// =============================================================================

/// MSI enable bit (bit 0 of Message Control).
const MSI_CTRL_ENABLE: u16 = 1 << 0;

/// Multi-message capable mask (bits 3:1), log2 of max vectors.
const MSI_CTRL_MMC_SHIFT: u16 = 1;

/// 64-bit address capable (bit 7).
const MSI_CTRL_64BIT: u16 = 1 << 7;

/// Per-vector masking capable (bit 8).
const MSI_CTRL_PVM: u16 = 1 << 8;

// =============================================================================
// Register offsets (relative to capability base)
// =============================================================================

const MSI_REG_CONTROL: u8 = 0x02;
const MSI_REG_ADDR_LO: u8 = 0x04;
const MSI_REG_ADDR_HI: u8 = 0x08; // only if 64-bit

// Data register offset depends on 64-bit capability:
const MSI_REG_DATA_32: u8 = 0x08;
const MSI_REG_DATA_64: u8 = 0x0C;

// =============================================================================
// Public types
// =============================================================================

/// Parsed MSI capability information for a PCI device.
#[derive(Debug, Clone, Copy)]
pub struct MsiCapability {
    /// Byte offset of the MSI capability in PCI config space.
    pub cap_offset: u8,
    /// Raw Message Control register value at parse time.
    pub control: u16,
    /// Whether the device supports 64-bit message addresses.
    pub is_64bit: bool,
    /// Whether the device supports per-vector masking.
    pub has_per_vector_masking: bool,
    /// log2 of the maximum vectors the device can generate (0-5 -> 1-32).
    pub multi_message_capable: u8,
}

impl MsiCapability {
    /// Maximum number of vectors the device can generate.
    #[inline]
    pub const fn max_vectors(&self) -> u8 {
        1u8 << self.multi_message_capable
    }

    /// Config-space offset of the Message Data register.
    #[inline]
    const fn data_offset(&self) -> u8 {
        if self.is_64bit {
            self.cap_offset + MSI_REG_DATA_64
        } else {
            self.cap_offset + MSI_REG_DATA_32
        }
    }

    /// Whether MSI is currently enabled on this device.
    #[inline]
    pub const fn is_enabled(&self) -> bool {
        self.control & MSI_CTRL_ENABLE != 0
    }
}

/// Errors from MSI programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiError {
    /// The device has no discovered MSI capability.
    NoCapability,
}

// =============================================================================
// Capability parsing
// =============================================================================

/// Read and parse the MSI capability structure for a PCI device.
///
/// `cap_offset` is the config-space byte offset of the MSI capability
/// header (cached on the handle by the capability walk).
pub fn msi_read_capability(bus: u8, device: u8, function: u8, cap_offset: u8) -> MsiCapability {
    let control = pci_config_read16(bus, device, function, cap_offset + MSI_REG_CONTROL);
    MsiCapability {
        cap_offset,
        control,
        is_64bit: control & MSI_CTRL_64BIT != 0,
        has_per_vector_masking: control & MSI_CTRL_PVM != 0,
        multi_message_capable: ((control >> MSI_CTRL_MMC_SHIFT) & 0x7) as u8,
    }
}

// =============================================================================
// Programming
// =============================================================================

/// Program a device's MSI capability with a pre-encoded message.
///
/// Writes the low address dword, then, if the capability is 64-bit, the
/// high address dword and the 64-bit data register, otherwise the 32-bit
/// data register. Only after both address and data are fully written does
/// the enable bit get set: a device enabled with a half-written message
/// may fire with garbage.
///
/// # Errors
///
/// [`MsiError::NoCapability`] if the capability walk found no MSI
/// capability on this device.
pub fn pci_setup_msi(dev: &PciDeviceInfo, msi_addr: u64, msi_data: u32) -> Result<(), MsiError> {
    let Some(cap_offset) = dev.msi_cap_offset else {
        klog_info!(
            "MSI: device {:02x}:{:02x}.{} does not support MSI",
            dev.bus,
            dev.device,
            dev.function
        );
        return Err(MsiError::NoCapability);
    };

    let (bus, device, function) = (dev.bus, dev.device, dev.function);
    let cap = msi_read_capability(bus, device, function, cap_offset);

    pci_config_write32(
        bus,
        device,
        function,
        cap_offset + MSI_REG_ADDR_LO,
        msi_addr as u32,
    );

    if cap.is_64bit {
        pci_config_write32(
            bus,
            device,
            function,
            cap_offset + MSI_REG_ADDR_HI,
            (msi_addr >> 32) as u32,
        );
        pci_config_write32(bus, device, function, cap.data_offset(), msi_data);
        klog_info!(
            "MSI: device {:02x}:{:02x}.{} 64-bit message addr=0x{:x} data=0x{:x}",
            bus,
            device,
            function,
            msi_addr,
            msi_data
        );
    } else {
        pci_config_write32(bus, device, function, cap.data_offset(), msi_data);
        klog_info!(
            "MSI: device {:02x}:{:02x}.{} 32-bit message addr=0x{:x} data=0x{:x}",
            bus,
            device,
            function,
            msi_addr,
            msi_data
        );
    }

    // Address and data are in place; flipping the enable bit is safe now.
    let control = pci_config_read16(bus, device, function, cap_offset + MSI_REG_CONTROL);
    pci_config_write16(
        bus,
        device,
        function,
        cap_offset + MSI_REG_CONTROL,
        control | MSI_CTRL_ENABLE,
    );

    Ok(())
}
