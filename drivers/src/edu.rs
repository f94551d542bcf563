//! QEMU "edu" test device.
//!
//! A scratch PCI device whose only job here is to source and sink DMA so
//! the remapping path can be exercised end to end. See docs/specs/edu.txt
//! in the QEMU tree for the device manual.

use core::hint::spin_loop;
use core::ptr::{read_volatile, write_volatile};

use vtprobe_abi::PhysAddr;
use vtprobe_lib::klog_info;
use vtprobe_mm::hhdm::PhysAddrHhdm;

use crate::pci::{pci_enable_defaults, pci_find_device};
use crate::pci_defs::PciDeviceInfo;

pub const PCI_VENDOR_ID_QEMU: u16 = 0x1234;
pub const PCI_DEVICE_ID_EDU: u16 = 0x11E8;

/// The only BAR the edu device implements.
const EDU_BAR_MEM: usize = 0;

const EDU_REG_ID: usize = 0x0;
const EDU_REG_ALIVE: usize = 0x4;
const EDU_REG_DMA_SRC: usize = 0x80;
const EDU_REG_DMA_DST: usize = 0x88;
const EDU_REG_DMA_COUNT: usize = 0x90;
const EDU_REG_DMA_CMD: usize = 0x98;

const EDU_CMD_DMA_START: u32 = 0x01;
const EDU_CMD_DMA_FROM: u32 = 0x02;
const EDU_CMD_DMA_TO: u32 = 0x00;

/// Device-local address of the DMA buffer window.
const EDU_DMA_START: u64 = 0x40000;

/// Largest single transfer the device accepts.
pub const EDU_DMA_SIZE_MAX: u64 = 4096;

/// An initialized edu device: the PCI handle plus the liveness counter
/// the scratch-register check advances.
pub struct EduDevice {
    pub pci: PciDeviceInfo,
    live_count: u32,
}

impl EduDevice {
    #[inline]
    fn reg_ptr<T>(&self, reg: usize) -> *mut T {
        let bar = self.pci.bars[EDU_BAR_MEM].base;
        unsafe {
            PhysAddr::new(bar)
                .to_virt()
                .as_mut_ptr::<u8>()
                .add(reg)
                .cast()
        }
    }

    fn reg_read(&self, reg: usize) -> u32 {
        // SAFETY: `reg` is a register offset inside the device's BAR 0
        // MMIO window, mapped through the HHDM.
        unsafe { read_volatile(self.reg_ptr::<u32>(reg)) }
    }

    fn reg_write(&self, reg: usize, value: u32) {
        unsafe { write_volatile(self.reg_ptr::<u32>(reg), value) }
    }

    fn reg_writeq(&self, reg: usize, value: u64) {
        unsafe { write_volatile(self.reg_ptr::<u64>(reg), value) }
    }

    /// The requester id this device presents to the IOMMU.
    #[inline]
    pub fn source_id(&self) -> u16 {
        self.pci.source_id()
    }

    /// Hardware id register (magic 0xED in the top byte).
    pub fn id(&self) -> u32 {
        self.reg_read(EDU_REG_ID)
    }

    /// Poke the inverting scratch register and check the device answers.
    pub fn check_alive(&mut self) -> bool {
        let probe = self.live_count;
        self.live_count = self.live_count.wrapping_add(1);
        self.reg_write(EDU_REG_ALIVE, probe);
        let value = self.reg_read(EDU_REG_ALIVE);
        probe == !value
    }

    /// Run one DMA transfer between `iova` in the device's address space
    /// and `dev_offset` inside the device-local buffer, blocking until the
    /// device retires it.
    ///
    /// # Panics
    ///
    /// `size` and `dev_offset` must fit the device's buffer window.
    pub fn dma(&self, iova: u64, size: u64, dev_offset: u64, from_device: bool) {
        assert!(size <= EDU_DMA_SIZE_MAX, "transfer exceeds the device buffer");
        assert!(dev_offset < EDU_DMA_SIZE_MAX, "device offset out of range");

        klog_info!(
            "edu: DMA {} iova 0x{:x} size {} device offset 0x{:x}",
            if from_device { "from device" } else { "to device" },
            iova,
            size,
            dev_offset
        );

        let (from, to, cmd) = if from_device {
            (EDU_DMA_START + dev_offset, iova, EDU_CMD_DMA_START | EDU_CMD_DMA_FROM)
        } else {
            (iova, EDU_DMA_START + dev_offset, EDU_CMD_DMA_START | EDU_CMD_DMA_TO)
        };

        self.reg_writeq(EDU_REG_DMA_SRC, from);
        self.reg_writeq(EDU_REG_DMA_DST, to);
        self.reg_writeq(EDU_REG_DMA_COUNT, size);
        self.reg_write(EDU_REG_DMA_CMD, cmd);

        // Wait until the device clears the start bit.
        while self.reg_read(EDU_REG_DMA_CMD) & EDU_CMD_DMA_START != 0 {
            spin_loop();
        }
    }
}

/// Find and bring up the edu device. `None` when the machine was started
/// without one.
///
/// # Panics
///
/// Panics if a device is present but fails its liveness check.
pub fn edu_init() -> Option<EduDevice> {
    let mut pci = pci_find_device(PCI_VENDOR_ID_QEMU, PCI_DEVICE_ID_EDU)?;
    pci_enable_defaults(&mut pci);

    let mut dev = EduDevice { pci, live_count: 1 };
    assert!(dev.check_alive(), "edu device failed its liveness check");
    Some(dev)
}
