//! PCI addressing and BAR decoding

use core::fmt;
use core::str::FromStr;

use crate::error::{Error, Result};

/// Number of buses in the configuration address space
pub const PCI_BUS_MAX: u16 = 256;
/// Devices per bus
pub const PCI_DEV_MAX: u8 = 32;
/// Functions per device
pub const PCI_FUNC_MAX: u8 = 8;

/// Identity dword returned for an empty slot
pub const PCI_ABSENT: u32 = 0xFFFF_FFFF;

/// Standard configuration space offsets used by the tool
pub mod config {
    /// Identity dword (vendor/device IDs)
    pub const IDENTITY: u8 = 0x00;
    /// Base Address Register 0
    pub const BAR0: u8 = 0x10;
}

/// Bus/device/function triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    /// PCI bus number
    pub bus: u8,
    /// PCI device (slot) number
    pub device: u8,
    /// PCI function number
    pub function: u8,
}

impl PciAddress {
    /// Create an address, checking the device and function ranges
    pub fn new(bus: u8, device: u8, function: u8) -> Result<Self> {
        let addr = Self {
            bus,
            device,
            function,
        };
        if !addr.is_valid() {
            return Err(Error::InvalidAddress(addr.to_string()));
        }
        Ok(addr)
    }

    /// Check that device < 32 and function < 8
    pub fn is_valid(&self) -> bool {
        self.device < PCI_DEV_MAX && self.function < PCI_FUNC_MAX
    }

    /// Address echo as carried in a response packet (three LE dwords)
    pub fn to_echo(&self) -> [u8; 12] {
        let mut echo = [0u8; 12];
        echo[0..4].copy_from_slice(&u32::from(self.bus).to_le_bytes());
        echo[4..8].copy_from_slice(&u32::from(self.device).to_le_bytes());
        echo[8..12].copy_from_slice(&u32::from(self.function).to_le_bytes());
        echo
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    /// Parse "bb:dd.f" (hex fields, as printed by lspci)
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let (bus, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (device, function) = rest.split_once('.').ok_or_else(invalid)?;

        let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        Self::new(bus, device, function)
    }
}

/// Memory decoding type from BAR bits 1-2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Anywhere in 32-bit space
    Base32,
    /// Below 1 MiB (legacy)
    Below1M,
    /// Anywhere in 64-bit space
    Base64,
    /// Reserved encoding
    Reserved,
}

/// Decoded Base Address Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    raw: u32,
}

impl Bar {
    pub fn from_raw(raw: u32) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Bit 0 of the raw value
    pub fn memory_space(&self) -> u8 {
        (self.raw & 1) as u8
    }

    pub fn memory_type(&self) -> MemoryType {
        match (self.raw >> 1) & 0x3 {
            0 => MemoryType::Base32,
            1 => MemoryType::Below1M,
            2 => MemoryType::Base64,
            _ => MemoryType::Reserved,
        }
    }

    pub fn is_prefetchable(&self) -> bool {
        (self.raw >> 3) & 1 == 1
    }

    /// Bits 4-31, shifted down
    pub fn base_address(&self) -> u32 {
        self.raw >> 4
    }

    /// Physical address of the decoded region (low flag bits masked off)
    pub fn phys_base(&self) -> u64 {
        u64::from(self.raw & !0xF)
    }
}

impl fmt::Display for Bar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X} (base {:#x}, {:?}{})",
            self.raw,
            self.phys_base(),
            self.memory_type(),
            if self.is_prefetchable() { ", prefetchable" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_range_checks() {
        assert!(PciAddress::new(255, 31, 7).is_ok());
        assert!(PciAddress::new(0, 32, 0).is_err());
        assert!(PciAddress::new(0, 0, 8).is_err());
    }

    #[test]
    fn test_address_parse_and_display() {
        let addr: PciAddress = "02:05.1".parse().unwrap();
        assert_eq!(
            addr,
            PciAddress {
                bus: 2,
                device: 5,
                function: 1
            }
        );
        assert_eq!(addr.to_string(), "02:05.1");
        assert!("02:05".parse::<PciAddress>().is_err());
        assert!("zz:05.1".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_bar_decode() {
        // 64-bit prefetchable memory BAR at 0xFE500000
        let bar = Bar::from_raw(0xFE50_000C);
        assert_eq!(bar.memory_space(), 0);
        assert_eq!(bar.memory_type(), MemoryType::Base64);
        assert!(bar.is_prefetchable());
        assert_eq!(bar.base_address(), 0x0FE5_0000);
        assert_eq!(bar.phys_base(), 0xFE50_0000);

        let bar = Bar::from_raw(0xF7C0_0001);
        assert_eq!(bar.memory_space(), 1);
        assert_eq!(bar.memory_type(), MemoryType::Base32);
        assert!(!bar.is_prefetchable());
    }

    #[test]
    fn test_echo_layout() {
        let echo = PciAddress::new(2, 5, 1).unwrap().to_echo();
        assert_eq!(&echo[0..4], &[2, 0, 0, 0]);
        assert_eq!(&echo[4..8], &[5, 0, 0, 0]);
        assert_eq!(&echo[8..12], &[1, 0, 0, 0]);
    }
}
