//! Brute-force PCI bus scan
//!
//! Walks every bus/device/function through config space reads, so it works
//! with any [`PciAccess`] backend without relying on OS enumeration.

use crate::access::PciAccess;
use crate::error::{Error, Result};
use crate::pci::{config, PciAddress, PCI_ABSENT, PCI_BUS_MAX, PCI_DEV_MAX, PCI_FUNC_MAX};
use crate::protocol::{ProtocolGeneration, ProtocolSelection};

/// Chip IDs tried, in order
pub const ASMEDIA_CHIP_IDS: [u16; 2] = [0x2142, 0x3142];

/// Which half of the identity dword an ID is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Bits 16-31 of the identity dword
    Vendor,
    /// Bits 0-15 of the identity dword
    Product,
}

impl MatchKind {
    pub fn matches(self, ident: u32, id: u16) -> bool {
        match self {
            Self::Vendor => (ident >> 16) as u16 == id,
            Self::Product => ident as u16 == id,
        }
    }

    /// Probe style used by each protocol generation
    pub fn for_generation(generation: ProtocolGeneration) -> Self {
        match generation {
            ProtocolGeneration::Legacy => Self::Vendor,
            ProtocolGeneration::Revised => Self::Product,
        }
    }
}

/// Find the first function whose identity matches `id`
///
/// Addresses are visited in ascending (bus, device, function) order.
pub fn find_device<A: PciAccess + ?Sized>(
    io: &mut A,
    kind: MatchKind,
    id: u16,
) -> Result<PciAddress> {
    for bus in 0..PCI_BUS_MAX {
        for device in 0..PCI_DEV_MAX {
            for function in 0..PCI_FUNC_MAX {
                let addr = PciAddress {
                    bus: bus as u8,
                    device,
                    function,
                };
                let ident = io.read_config32(addr, config::IDENTITY)?;
                if ident == PCI_ABSENT {
                    continue;
                }

                log::trace!(
                    "[{}] {:04X}:{:04X}",
                    addr,
                    (ident >> 16) & 0xFFFF,
                    ident & 0xFFFF
                );

                if kind.matches(ident, id) {
                    return Ok(addr);
                }
            }
        }
    }

    Err(Error::DeviceNotFound)
}

/// Locate an ASM2142/ASM3142 and decide which protocol generation to speak
pub fn find_asmedia<A: PciAccess + ?Sized>(
    io: &mut A,
    selection: ProtocolSelection,
) -> Result<(PciAddress, ProtocolGeneration)> {
    let generations: &[ProtocolGeneration] = match selection {
        ProtocolSelection::Auto => &[ProtocolGeneration::Legacy, ProtocolGeneration::Revised],
        ProtocolSelection::Fixed(ProtocolGeneration::Legacy) => &[ProtocolGeneration::Legacy],
        ProtocolSelection::Fixed(ProtocolGeneration::Revised) => &[ProtocolGeneration::Revised],
    };

    for &generation in generations {
        let kind = MatchKind::for_generation(generation);
        for id in ASMEDIA_CHIP_IDS {
            match find_device(io, kind, id) {
                Ok(addr) => {
                    log::info!("Found ASMedia {:04X} at {} ({} protocol)", id, addr, generation);
                    return Ok((addr, generation));
                }
                Err(Error::DeviceNotFound) => {
                    log::debug!("No {:04X} device by {:?} ID", id, kind);
                }
                Err(e) => return Err(e),
            }
        }
    }

    Err(Error::DeviceNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Identity table; every other address reads as absent
    #[derive(Default)]
    struct FakeBus {
        idents: HashMap<PciAddress, u32>,
        reads: usize,
    }

    impl FakeBus {
        fn with(mut self, bus: u8, device: u8, function: u8, ident: u32) -> Self {
            self.idents
                .insert(PciAddress::new(bus, device, function).unwrap(), ident);
            self
        }
    }

    impl PciAccess for FakeBus {
        fn read_config8(&mut self, _addr: PciAddress, _offset: u8) -> Result<u8> {
            Ok(0xFF)
        }

        fn read_config32(&mut self, addr: PciAddress, offset: u8) -> Result<u32> {
            assert_eq!(offset, config::IDENTITY);
            self.reads += 1;
            Ok(self.idents.get(&addr).copied().unwrap_or(PCI_ABSENT))
        }

        fn write_config8(&mut self, _addr: PciAddress, _offset: u8, _value: u8) -> Result<()> {
            unreachable!("prober never writes")
        }

        fn write_config32(&mut self, _addr: PciAddress, _offset: u8, _value: u32) -> Result<()> {
            unreachable!("prober never writes")
        }
    }

    #[test]
    fn test_empty_bus_not_found() {
        let mut bus = FakeBus::default();
        let err = find_device(&mut bus, MatchKind::Vendor, 0x2142).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
        // Whole address space visited
        assert_eq!(bus.reads, 256 * 32 * 8);
    }

    #[test]
    fn test_finds_vendor_match() {
        let mut bus = FakeBus::default()
            .with(0, 0, 0, 0x1234_8086)
            .with(2, 5, 1, 0x2142_1B21);
        let addr = find_device(&mut bus, MatchKind::Vendor, 0x2142).unwrap();
        assert_eq!(
            addr,
            PciAddress {
                bus: 2,
                device: 5,
                function: 1
            }
        );
    }

    #[test]
    fn test_first_match_in_ascending_order() {
        let mut bus = FakeBus::default()
            .with(3, 0, 0, 0x2142_1B21)
            .with(2, 7, 3, 0x2142_1B21)
            .with(2, 7, 2, 0x2142_1B21);
        let addr = find_device(&mut bus, MatchKind::Vendor, 0x2142).unwrap();
        assert_eq!(addr, PciAddress::new(2, 7, 2).unwrap());
    }

    #[test]
    fn test_product_match_uses_low_half() {
        let mut bus = FakeBus::default().with(1, 0, 0, 0x1B21_3142);
        assert!(find_device(&mut bus, MatchKind::Vendor, 0x3142).is_err());
        let addr = find_device(&mut bus, MatchKind::Product, 0x3142).unwrap();
        assert_eq!(addr, PciAddress::new(1, 0, 0).unwrap());
    }

    #[test]
    fn test_find_asmedia_selects_generation() {
        let mut bus = FakeBus::default().with(4, 0, 0, 0x1B21_3142);
        let (addr, generation) = find_asmedia(&mut bus, ProtocolSelection::Auto).unwrap();
        assert_eq!(addr, PciAddress::new(4, 0, 0).unwrap());
        assert_eq!(generation, ProtocolGeneration::Revised);

        let mut bus = FakeBus::default().with(4, 0, 0, 0x3142_1B21);
        let (_, generation) = find_asmedia(&mut bus, ProtocolSelection::Auto).unwrap();
        assert_eq!(generation, ProtocolGeneration::Legacy);

        let mut bus = FakeBus::default().with(4, 0, 0, 0x3142_1B21);
        let err = find_asmedia(
            &mut bus,
            ProtocolSelection::Fixed(ProtocolGeneration::Revised),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
    }
}
