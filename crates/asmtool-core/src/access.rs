//! Platform access trait
//!
//! [`PciAccess`] is the only seam between the protocol code and the
//! platform. Backends provide raw configuration space access; the register
//! window operations (`write_command_all`, the ready polls and the response
//! packet read) have default implementations built on top of it, which a
//! backend with a native driver interface may override.

use crate::error::{Error, PollStage, Result};
use crate::pci::PciAddress;
use crate::protocol::{ResponsePacket, PACKET_SIZE};
use crate::regs::{
    ControlFlags, CONTROL_ABSENT, REG_CONTROL, REG_DATA_IN, REG_DATA_OUT1, REG_DATA_OUT2,
    REG_SELECT,
};

/// Default ready poll iterations
pub const DEFAULT_POLL_BUDGET: u32 = 20000;

/// Consecutive 0xFF control reads after which the device is treated as gone
const DEVICE_GONE_THRESHOLD: u32 = 10;

/// How long a ready poll may spin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBudget {
    /// Give up after this many control register reads
    Bounded(u32),
    /// Spin until the condition asserts
    Unbounded,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::Bounded(DEFAULT_POLL_BUDGET)
    }
}

impl PollBudget {
    /// Build from a CLI count where 0 means unbounded
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            Self::Unbounded
        } else {
            Self::Bounded(count)
        }
    }

    fn allows(&self, attempt: u32) -> bool {
        match self {
            Self::Bounded(max) => attempt < *max,
            Self::Unbounded => true,
        }
    }
}

/// A mapped physical memory region; unmapped when dropped
pub trait MmioRegion {
    /// Physical address of the first byte
    fn phys_addr(&self) -> u64;

    /// Size of the region in bytes
    fn size(&self) -> usize;

    /// Read one byte at `offset` (must be below `size()`)
    fn read8(&self, offset: usize) -> u8;
}

/// Low-level platform interface to PCI configuration space
pub trait PciAccess {
    /// Acquire whatever privileges or handles the backend needs
    fn load_driver(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release backend resources
    fn unload_driver(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read a config byte. Absent functions read as 0xFF.
    fn read_config8(&mut self, addr: PciAddress, offset: u8) -> Result<u8>;

    /// Read a config dword. Absent functions read as 0xFFFFFFFF.
    fn read_config32(&mut self, addr: PciAddress, offset: u8) -> Result<u32>;

    /// Write a config byte
    fn write_config8(&mut self, addr: PciAddress, offset: u8, value: u8) -> Result<()>;

    /// Write a config dword
    fn write_config32(&mut self, addr: PciAddress, offset: u8, value: u32) -> Result<()>;

    /// Spin until the chip is not processing a command
    fn wait_write_ready(&mut self, addr: PciAddress, budget: PollBudget) -> Result<()> {
        poll_control(self, addr, budget, PollStage::WriteReady, |flags| {
            !flags.contains(ControlFlags::WRITE_BUSY)
        })
    }

    /// Spin until response data is available
    fn wait_read_ready(&mut self, addr: PciAddress, budget: PollBudget) -> Result<()> {
        poll_control(self, addr, budget, PollStage::ReadReady, |flags| {
            flags.contains(ControlFlags::READ_READY)
        })
    }

    /// Submit a full internal register command
    ///
    /// `reg` is the 3-byte selector, `data[0]` the address/offset word and
    /// `data[1..3]` the two payload words. The command goes out as two
    /// select/data/strobe sequences, each preceded by a write-ready poll.
    fn write_command_all(
        &mut self,
        addr: PciAddress,
        reg: [u8; 3],
        data: [u32; 3],
        budget: PollBudget,
    ) -> Result<()> {
        let select = u32::from_le_bytes([reg[0], reg[1], reg[2], 0]);

        self.wait_write_ready(addr, budget)?;
        submit(self, addr, select, data[0])?;

        self.wait_write_ready(addr, budget)?;
        submit(self, addr, data[1], data[2])
    }

    /// Fetch one response packet and acknowledge it
    fn read_response_packet(&mut self, addr: PciAddress) -> Result<[u8; PACKET_SIZE]> {
        let data1 = self.read_config32(addr, REG_DATA_OUT1)?;
        let data2 = self.read_config32(addr, REG_DATA_OUT2)?;
        self.write_config8(addr, REG_CONTROL, ControlFlags::READ_READY.bits())?;

        Ok(ResponsePacket::new(addr, data1, data2).to_bytes())
    }

    /// Map a physical memory range (BAR-decoded MMIO)
    fn map_physical_memory(&mut self, address: u64, size: usize) -> Result<Box<dyn MmioRegion>> {
        let _ = (address, size);
        Err(Error::NotSupported("physical memory mapping"))
    }
}

fn submit<A: PciAccess + ?Sized>(
    io: &mut A,
    addr: PciAddress,
    select: u32,
    data: u32,
) -> Result<()> {
    io.write_config32(addr, REG_SELECT, select)?;
    io.write_config32(addr, REG_DATA_IN, data)?;
    io.write_config8(addr, REG_CONTROL, ControlFlags::WRITE_BUSY.bits())
}

fn poll_control<A, F>(
    io: &mut A,
    addr: PciAddress,
    budget: PollBudget,
    stage: PollStage,
    ready: F,
) -> Result<()>
where
    A: PciAccess + ?Sized,
    F: Fn(ControlFlags) -> bool,
{
    let mut attempt = 0u32;
    let mut absent = 0u32;

    while budget.allows(attempt) {
        let raw = io.read_config8(addr, REG_CONTROL)?;
        if raw == CONTROL_ABSENT {
            absent += 1;
            if absent >= DEVICE_GONE_THRESHOLD {
                return Err(Error::DeviceGone);
            }
        } else {
            absent = 0;
            if ready(ControlFlags::from_bits_truncate(raw)) {
                return Ok(());
            }
        }

        attempt = attempt.saturating_add(1);
        core::hint::spin_loop();
    }

    log::debug!("{} poll on {} gave up after {} reads", stage, addr, attempt);
    Err(Error::ProtocolTimeout { stage })
}

macro_rules! forward_pci_access {
    ($ty:ty) => {
        impl<T: PciAccess + ?Sized> PciAccess for $ty {
            fn load_driver(&mut self) -> Result<()> {
                (**self).load_driver()
            }

            fn unload_driver(&mut self) -> Result<()> {
                (**self).unload_driver()
            }

            fn read_config8(&mut self, addr: PciAddress, offset: u8) -> Result<u8> {
                (**self).read_config8(addr, offset)
            }

            fn read_config32(&mut self, addr: PciAddress, offset: u8) -> Result<u32> {
                (**self).read_config32(addr, offset)
            }

            fn write_config8(&mut self, addr: PciAddress, offset: u8, value: u8) -> Result<()> {
                (**self).write_config8(addr, offset, value)
            }

            fn write_config32(&mut self, addr: PciAddress, offset: u8, value: u32) -> Result<()> {
                (**self).write_config32(addr, offset, value)
            }

            fn wait_write_ready(&mut self, addr: PciAddress, budget: PollBudget) -> Result<()> {
                (**self).wait_write_ready(addr, budget)
            }

            fn wait_read_ready(&mut self, addr: PciAddress, budget: PollBudget) -> Result<()> {
                (**self).wait_read_ready(addr, budget)
            }

            fn write_command_all(
                &mut self,
                addr: PciAddress,
                reg: [u8; 3],
                data: [u32; 3],
                budget: PollBudget,
            ) -> Result<()> {
                (**self).write_command_all(addr, reg, data, budget)
            }

            fn read_response_packet(&mut self, addr: PciAddress) -> Result<[u8; PACKET_SIZE]> {
                (**self).read_response_packet(addr)
            }

            fn map_physical_memory(
                &mut self,
                address: u64,
                size: usize,
            ) -> Result<Box<dyn MmioRegion>> {
                (**self).map_physical_memory(address, size)
            }
        }
    };
}

forward_pci_access!(&mut T);
forward_pci_access!(Box<T>);

/// Loads the backend driver for a scope and unloads it on drop
///
/// Any stale instance is unloaded first, so a previous crashed run does not
/// leave the backend in a half-initialised state.
pub struct DriverSession<A: PciAccess> {
    io: A,
}

impl<A: PciAccess> DriverSession<A> {
    pub fn start(mut io: A) -> Result<Self> {
        log::debug!("Unloading access driver...");
        if let Err(e) = io.unload_driver() {
            log::debug!("Stale driver unload failed: {}", e);
        }

        log::debug!("Loading access driver...");
        io.load_driver()?;
        Ok(Self { io })
    }

    pub fn io_mut(&mut self) -> &mut A {
        &mut self.io
    }
}

impl<A: PciAccess> Drop for DriverSession<A> {
    fn drop(&mut self) {
        if let Err(e) = self.io.unload_driver() {
            log::warn!("Failed to unload access driver: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Control register that reports a fixed value; records strobes
    struct FixedControl {
        control: u8,
        writes: Vec<(u8, u32)>,
    }

    impl PciAccess for FixedControl {
        fn read_config8(&mut self, _addr: PciAddress, offset: u8) -> Result<u8> {
            Ok(if offset == REG_CONTROL { self.control } else { 0 })
        }

        fn read_config32(&mut self, _addr: PciAddress, offset: u8) -> Result<u32> {
            Ok(match offset {
                REG_DATA_OUT1 => 0x1122_3344,
                REG_DATA_OUT2 => 0x5566_7788,
                _ => 0,
            })
        }

        fn write_config8(&mut self, _addr: PciAddress, offset: u8, value: u8) -> Result<()> {
            self.writes.push((offset, u32::from(value)));
            Ok(())
        }

        fn write_config32(&mut self, _addr: PciAddress, offset: u8, value: u32) -> Result<()> {
            self.writes.push((offset, value));
            Ok(())
        }
    }

    fn addr() -> PciAddress {
        PciAddress::new(2, 5, 1).unwrap()
    }

    #[test]
    fn test_bounded_poll_times_out() {
        let mut io = FixedControl {
            control: ControlFlags::WRITE_BUSY.bits(),
            writes: Vec::new(),
        };
        let err = io
            .wait_write_ready(addr(), PollBudget::Bounded(50))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolTimeout {
                stage: PollStage::WriteReady
            }
        ));

        let err = io.wait_read_ready(addr(), PollBudget::Bounded(50)).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolTimeout {
                stage: PollStage::ReadReady
            }
        ));
    }

    #[test]
    fn test_absent_control_is_device_gone() {
        let mut io = FixedControl {
            control: CONTROL_ABSENT,
            writes: Vec::new(),
        };
        // Even an unbounded poll terminates once the device is gone
        let err = io.wait_read_ready(addr(), PollBudget::Unbounded).unwrap_err();
        assert!(matches!(err, Error::DeviceGone));
    }

    /// Control register that alternates between 0xFF and not-ready
    struct FlickeringControl {
        reads: u32,
    }

    impl PciAccess for FlickeringControl {
        fn read_config8(&mut self, _addr: PciAddress, _offset: u8) -> Result<u8> {
            self.reads += 1;
            Ok(if self.reads % 2 == 0 { CONTROL_ABSENT } else { 0 })
        }

        fn read_config32(&mut self, _addr: PciAddress, _offset: u8) -> Result<u32> {
            Ok(0)
        }

        fn write_config8(&mut self, _addr: PciAddress, _offset: u8, _value: u8) -> Result<()> {
            Ok(())
        }

        fn write_config32(&mut self, _addr: PciAddress, _offset: u8, _value: u32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_interrupted_absent_reads_do_not_accumulate() {
        let mut io = FlickeringControl { reads: 0 };
        let err = io
            .wait_read_ready(addr(), PollBudget::Bounded(100))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolTimeout {
                stage: PollStage::ReadReady
            }
        ));
        assert_eq!(io.reads, 100);
    }

    #[test]
    fn test_write_command_all_sequence() {
        let mut io = FixedControl {
            control: 0,
            writes: Vec::new(),
        };
        io.write_command_all(
            addr(),
            [0x40, 0x10, 0x08],
            [0x100, 0xAAAA, 0xBBBB],
            PollBudget::default(),
        )
        .unwrap();

        assert_eq!(
            io.writes,
            vec![
                (REG_SELECT, 0x0008_1040),
                (REG_DATA_IN, 0x100),
                (REG_CONTROL, 0x02),
                (REG_SELECT, 0xAAAA),
                (REG_DATA_IN, 0xBBBB),
                (REG_CONTROL, 0x02),
            ]
        );
    }

    #[test]
    fn test_default_packet_read_acknowledges() {
        let mut io = FixedControl {
            control: ControlFlags::READ_READY.bits(),
            writes: Vec::new(),
        };
        let raw = io.read_response_packet(addr()).unwrap();
        let pkt = ResponsePacket::decode(&raw).unwrap();
        assert_eq!(pkt.value(), 0x5566_7788_1122_3344);
        assert_eq!(pkt.address(), addr());
        assert_eq!(io.writes, vec![(REG_CONTROL, 0x01)]);
    }

    #[test]
    fn test_poll_budget_from_count() {
        assert_eq!(PollBudget::from_count(0), PollBudget::Unbounded);
        assert_eq!(PollBudget::from_count(7), PollBudget::Bounded(7));
        assert_eq!(PollBudget::default(), PollBudget::Bounded(DEFAULT_POLL_BUDGET));
    }
}
