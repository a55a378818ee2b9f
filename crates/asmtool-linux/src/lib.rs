//! asmtool-linux - Linux platform backend
//!
//! PCI configuration space goes through sysfs
//! (`/sys/bus/pci/devices/*/config`) and MMIO windows are mapped from
//! `/dev/mem`. Both need root for the registers the ASMedia protocol uses.
//!
//! # Usage with asmtool CLI
//!
//! ```bash
//! sudo asmtool -b linux flash_read -o dump.bin
//! sudo asmtool -b linux:domain=0001 mem_read
//! ```

#![cfg(target_os = "linux")]

pub mod error;
pub mod physmap;
pub mod sysfs;

pub use error::LinuxPciError;
pub use physmap::PhysMap;
pub use sysfs::{LinuxPci, LinuxPciOptions};

/// Open the Linux backend from programmer-style options
pub fn open_linux(
    options: &[(&str, &str)],
) -> Result<Box<dyn asmtool_core::PciAccess>, Box<dyn std::error::Error>> {
    let options = LinuxPciOptions::from_options(options)?;
    Ok(Box::new(LinuxPci::new(options)))
}
