//! asmtool-core - ASMedia ASM2142/ASM3142 controller support
//!
//! This crate implements the vendor register protocol that ASMedia USB 3.1
//! host controllers expose through a window in PCI configuration space,
//! and the firmware image container those controllers boot from.
//!
//! Platform access goes through the [`PciAccess`] trait so the protocol and
//! device code can run against real hardware or an emulated bus.
//!
//! # Example
//!
//! ```ignore
//! use asmtool_core::{AsmDevice, DeviceOptions, NoProgress};
//!
//! fn dump<A: asmtool_core::PciAccess>(io: A) -> asmtool_core::Result<()> {
//!     let mut dev = AsmDevice::open(io, DeviceOptions::default())?;
//!     dev.dump_flash_to_file("dump.bin".as_ref(), &mut NoProgress)?;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod access;
pub mod device;
pub mod error;
pub mod firmware;
pub mod pci;
pub mod prober;
pub mod protocol;
pub mod regs;

pub use access::{DriverSession, MmioRegion, PciAccess, PollBudget};
pub use device::{AsmDevice, ChipRevision, DeviceOptions, DumpProgress, DumpStats, NoProgress};
pub use error::{Error, Result};
pub use firmware::{ChipType, FirmwareImage, OpenMode};
pub use pci::{Bar, PciAddress};
pub use protocol::{ProtocolGeneration, ProtocolSelection};
