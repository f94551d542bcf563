#![no_std]

pub mod edu;
pub mod msi;
pub mod pci;
pub mod pci_defs;
pub mod serial;
pub mod vtd;
pub mod vtd_defs;

pub mod pci_cap_tests;
pub mod vtd_tests;
