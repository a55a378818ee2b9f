//! Device-level operations on a detected ASMedia controller

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::access::{MmioRegion, PciAccess, PollBudget};
use crate::error::{Error, Result};
use crate::pci::{config, Bar, PciAddress};
use crate::prober::find_asmedia;
use crate::protocol::{
    Command, ProtocolGeneration, ProtocolSelection, RegisterProtocol, RegisterSelector, Target,
};

/// Flash ROM size (128 KiB)
pub const FLASH_SIZE: usize = 131072;
/// Bytes returned by one flash read
pub const FLASH_WORD_SIZE: usize = 8;
/// Bytes returned by one chip memory read
pub const MEMORY_WORD_SIZE: usize = 4;
/// Default upper bound for memory dumps
pub const DEFAULT_MEMORY_LIMIT: u32 = 0x20000;

/// Chip memory addresses holding revision bytes
pub const CHIP_REV0_ADDR: u32 = 0x150B2;
pub const CHIP_REV1_ADDR: u32 = 0xF38C;

/// Options for opening a device
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    /// Protocol generation (auto-detected by default)
    pub protocol: ProtocolSelection,
    /// Ready poll budget
    pub poll_budget: PollBudget,
}

impl DeviceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: ProtocolSelection) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_poll_budget(mut self, poll_budget: PollBudget) -> Self {
        self.poll_budget = poll_budget;
        self
    }
}

/// Progress callbacks for bulk dumps
pub trait DumpProgress {
    fn start(&mut self, _total: u64) {}
    fn advance(&mut self, _done: u64) {}
    fn finish(&mut self) {}
}

/// Progress sink that ignores everything
pub struct NoProgress;

impl DumpProgress for NoProgress {}

/// Outcome of a dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpStats {
    /// Bytes written to the output
    pub bytes: u64,
    /// False if the dump stopped before the configured size
    pub complete: bool,
}

/// Live chip revision bytes; `None` where the read failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChipRevision {
    pub rev0: Option<u8>,
    pub rev1: Option<u8>,
}

/// A mapped window of the device BAR
pub struct MmioWindow {
    region: Box<dyn MmioRegion>,
}

impl MmioWindow {
    pub fn phys_addr(&self) -> u64 {
        self.region.phys_addr()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Read `len` bytes starting at `offset`, one byte access at a time
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(len).filter(|&end| end <= self.size());
        if end.is_none() {
            return Err(Error::Truncated {
                offset,
                len,
                size: self.size(),
            });
        }
        Ok((offset..offset + len).map(|off| self.region.read8(off)).collect())
    }
}

/// An opened ASMedia controller
pub struct AsmDevice<A: PciAccess> {
    proto: RegisterProtocol<A>,
    bar: Bar,
}

impl<A: PciAccess> AsmDevice<A> {
    /// Scan the bus for a controller and bind to it
    pub fn open(mut io: A, options: DeviceOptions) -> Result<Self> {
        log::info!("Scanning for ASMedia ICs...");
        let (addr, generation) = find_asmedia(&mut io, options.protocol)?;

        let bar = Bar::from_raw(io.read_config32(addr, config::BAR0)?);
        log::debug!("BAR: {}", bar);

        Ok(Self {
            proto: RegisterProtocol::new(io, addr, generation, options.poll_budget),
            bar,
        })
    }

    pub fn address(&self) -> PciAddress {
        self.proto.address()
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.proto.generation()
    }

    pub fn bar(&self) -> Bar {
        self.bar
    }

    pub fn protocol_mut(&mut self) -> &mut RegisterProtocol<A> {
        &mut self.proto
    }

    /// Read one 4-byte word of chip memory
    pub fn read_memory(&mut self, address: u32) -> Result<[u8; 4]> {
        let selector =
            RegisterSelector::new(Command::Read, Target::ChipMemory, MEMORY_WORD_SIZE as u8);
        self.proto.read_small(selector, address)
    }

    /// Write bytes to chip memory in 8-byte units
    pub fn write_memory(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        log::debug!("Writing {} bytes at {:#x}", bytes.len(), address);
        self.proto.write_chunks(Target::ChipMemory, address, bytes)
    }

    /// Read one 8-byte flash word
    pub fn read_flash_qword(&mut self, offset: u32) -> Result<u64> {
        let selector =
            RegisterSelector::new(Command::Read, Target::FlashStorage, FLASH_WORD_SIZE as u8);
        Ok(self.proto.exchange(selector, offset)?.value())
    }

    /// Dump the whole flash ROM
    ///
    /// Stops at the first failed read and returns its error; everything read
    /// up to that point has already been written and flushed.
    pub fn dump_flash<W: Write>(
        &mut self,
        out: &mut W,
        progress: &mut dyn DumpProgress,
    ) -> Result<DumpStats> {
        progress.start(FLASH_SIZE as u64);

        let mut written = 0u64;
        for offset in (0..FLASH_SIZE).step_by(FLASH_WORD_SIZE) {
            let qword = match self.read_flash_qword(offset as u32) {
                Ok(qword) => qword,
                Err(e) => {
                    log::warn!("Invalid SPI read at offset {:#x}: {}", offset, e);
                    out.flush()?;
                    progress.finish();
                    return Err(e);
                }
            };
            out.write_all(&qword.to_le_bytes())?;
            written += FLASH_WORD_SIZE as u64;
            progress.advance(written);
        }

        out.flush()?;
        progress.finish();
        Ok(DumpStats {
            bytes: written,
            complete: true,
        })
    }

    pub fn dump_flash_to_file(
        &mut self,
        path: &Path,
        progress: &mut dyn DumpProgress,
    ) -> Result<DumpStats> {
        let mut out = BufWriter::new(File::create(path)?);
        self.dump_flash(&mut out, progress)
    }

    /// Dump chip memory from address 0 until a read fails or `limit` is hit
    ///
    /// A failed read marks the end of the readable range; it is not an error.
    pub fn dump_memory<W: Write>(
        &mut self,
        out: &mut W,
        limit: u32,
        progress: &mut dyn DumpProgress,
    ) -> Result<DumpStats> {
        progress.start(u64::from(limit));

        let mut written = 0u64;
        let mut complete = true;
        for address in (0..limit).step_by(MEMORY_WORD_SIZE) {
            match self.read_memory(address) {
                Ok(word) => {
                    // The last word is cut short when `limit` is not word aligned
                    let take = MEMORY_WORD_SIZE.min((limit - address) as usize);
                    out.write_all(&word[..take])?;
                    written += take as u64;
                    progress.advance(written);
                }
                Err(e) => {
                    log::info!("Memory read stopped at {:#x}: {}", address, e);
                    complete = false;
                    break;
                }
            }
        }

        out.flush()?;
        progress.finish();
        Ok(DumpStats {
            bytes: written,
            complete,
        })
    }

    pub fn dump_memory_to_file(
        &mut self,
        path: &Path,
        limit: u32,
        progress: &mut dyn DumpProgress,
    ) -> Result<DumpStats> {
        let mut out = BufWriter::new(File::create(path)?);
        self.dump_memory(&mut out, limit, progress)
    }

    /// Read the two chip revision bytes
    pub fn chip_revision(&mut self) -> ChipRevision {
        let mut read_byte = |address: u32| match self.read_memory(address) {
            Ok(word) => Some(word[0]),
            Err(e) => {
                log::warn!("Failed to read chip memory at {:#x}: {}", address, e);
                None
            }
        };

        let rev0 = read_byte(CHIP_REV0_ADDR);
        let rev1 = read_byte(CHIP_REV1_ADDR);
        ChipRevision { rev0, rev1 }
    }

    /// Map `size` bytes of the BAR-decoded region starting at `offset`
    pub fn map_bar_window(&mut self, offset: u32, size: usize) -> Result<MmioWindow> {
        let phys = self.bar.phys_base() + u64::from(offset);
        log::debug!("Mapping BAR window at {:#x} (size {:#x})", phys, size);
        let region = self.proto.io_mut().map_physical_memory(phys, size)?;
        Ok(MmioWindow { region })
    }
}
