//! asmtool-dummy - Simulated PCI bus with an emulated ASMedia controller
//!
//! [`DummyBus`] implements [`PciAccess`] at the config register level: the
//! emulated chip decodes selector/data/strobe writes, queues response
//! packets, and serves them through the output registers. Everything runs
//! in memory, so the full device stack can be exercised without hardware.

use std::collections::VecDeque;
use std::fs;

use asmtool_core::access::{MmioRegion, PciAccess};
use asmtool_core::device::{CHIP_REV0_ADDR, CHIP_REV1_ADDR, DEFAULT_MEMORY_LIMIT, FLASH_SIZE};
use asmtool_core::error::{Error, Result};
use asmtool_core::firmware::ChipType;
use asmtool_core::pci::{config, Bar, PciAddress, PCI_ABSENT};
use asmtool_core::protocol::{
    pack_chunk, Command, ProtocolGeneration, ProtocolSelection, RegisterSelector, Target,
    SMALL_READ_MAX,
};
use asmtool_core::regs::{
    ControlFlags, REG_CONTROL, REG_DATA_IN, REG_DATA_OUT1, REG_DATA_OUT2, REG_SELECT,
};

/// ASMedia PCI vendor ID
pub const ASMEDIA_VENDOR_ID: u16 = 0x1B21;

/// Configuration for the simulated bus
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Where the controller sits on the bus
    pub address: PciAddress,
    /// Chip ID (0x2142 or 0x3142)
    pub chip_id: u16,
    /// Which identity layout and protocol the chip answers to
    pub generation: ProtocolGeneration,
    /// Raw BAR0 value
    pub bar: u32,
    /// Flash ROM contents
    pub flash: Vec<u8>,
    /// Chip memory contents; reads past the end never complete
    pub memory: Vec<u8>,
    /// Revision bytes placed at the chip revision addresses
    pub chip_rev: [u8; 2],
    /// Zero-based flash read that the chip never answers
    pub fail_flash_read_at: Option<u32>,
    /// Other functions on the bus (address, identity dword)
    pub decoys: Vec<(PciAddress, u32)>,
    /// Contents of the BAR-decoded MMIO window
    pub mmio: Vec<u8>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            address: PciAddress {
                bus: 2,
                device: 5,
                function: 1,
            },
            chip_id: 0x2142,
            generation: ProtocolGeneration::Legacy,
            bar: 0xFE50_0004,
            flash: vec![0xFF; FLASH_SIZE],
            memory: vec![0; DEFAULT_MEMORY_LIMIT as usize],
            chip_rev: [0x02, 0x11],
            fail_flash_read_at: None,
            decoys: Vec::new(),
            mmio: (0..0x1000u32).map(|i| i as u8).collect(),
        }
    }
}

fn parse_num<T: TryFrom<u64>>(key: &str, value: &str) -> Result<T> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| Error::InvalidAddress(format!("{}={}", key, value)))
}

impl DummyConfig {
    /// Identity dword as the chip reports it at config offset 0
    pub fn identity(&self) -> u32 {
        let chip = u32::from(self.chip_id);
        let vendor = u32::from(ASMEDIA_VENDOR_ID);
        match self.generation {
            ProtocolGeneration::Legacy => (chip << 16) | vendor,
            ProtocolGeneration::Revised => (vendor << 16) | chip,
        }
    }

    /// Parse backend options (key=value pairs)
    pub fn from_options(options: &[(&str, &str)]) -> Result<Self> {
        let mut config = Self::default();
        let mut bus = config.address.bus;
        let mut device = config.address.device;
        let mut function = config.address.function;

        for (key, value) in options {
            match *key {
                "chip" => {
                    config.chip_id = match value.parse::<ChipType>()? {
                        ChipType::Asm2142 => 0x2142,
                        ChipType::Asm3142 => 0x3142,
                    };
                }
                "bus" => bus = parse_num(key, value)?,
                "dev" => device = parse_num(key, value)?,
                "func" => function = parse_num(key, value)?,
                "generation" => {
                    config.generation = match ProtocolSelection::parse(value) {
                        Some(ProtocolSelection::Fixed(generation)) => generation,
                        _ => {
                            return Err(Error::NotSupported(
                                "Invalid generation value (use: legacy or revised)",
                            ))
                        }
                    };
                }
                "flash" => {
                    let image = fs::read(value)?;
                    let len = image.len().min(config.flash.len());
                    config.flash[..len].copy_from_slice(&image[..len]);
                }
                "fail_flash_read" => config.fail_flash_read_at = Some(parse_num(key, value)?),
                "mem_size" => {
                    let size: usize = parse_num(key, value)?;
                    config.memory.resize(size, 0);
                }
                _ => {
                    log::warn!("Unknown dummy backend option: {}={}", key, value);
                }
            }
        }

        config.address = PciAddress::new(bus, device, function)?;
        Ok(config)
    }
}

/// A copy of the MMIO window handed out by [`DummyBus::map_physical_memory`]
struct DummyRegion {
    phys: u64,
    bytes: Vec<u8>,
}

impl MmioRegion for DummyRegion {
    fn phys_addr(&self) -> u64 {
        self.phys
    }

    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read8(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or(0xFF)
    }
}

/// Simulated PCI bus hosting one ASMedia controller
pub struct DummyBus {
    config: DummyConfig,
    select: u32,
    data_in: u32,
    /// First half of a command waiting for its payload strobe
    pending: Option<(u32, u32)>,
    outputs: VecDeque<(u32, u32)>,
    flash_reads: u32,
    writes: Vec<(u8, u32)>,
    present: bool,
    driver_loads: u32,
    driver_loaded: bool,
}

impl DummyBus {
    pub fn new(mut config: DummyConfig) -> Self {
        for (addr, rev) in [CHIP_REV0_ADDR, CHIP_REV1_ADDR].into_iter().zip(config.chip_rev) {
            if let Some(byte) = config.memory.get_mut(addr as usize) {
                *byte = rev;
            }
        }

        Self {
            config,
            select: 0,
            data_in: 0,
            pending: None,
            outputs: VecDeque::new(),
            flash_reads: 0,
            writes: Vec::new(),
            present: true,
            driver_loads: 0,
            driver_loaded: false,
        }
    }

    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    pub fn flash(&self) -> &[u8] {
        &self.config.flash
    }

    pub fn memory(&self) -> &[u8] {
        &self.config.memory
    }

    /// Config writes to the controller, in order
    pub fn writes(&self) -> &[(u8, u32)] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Number of `load_driver` calls so far
    pub fn driver_loads(&self) -> u32 {
        self.driver_loads
    }

    pub fn driver_loaded(&self) -> bool {
        self.driver_loaded
    }

    /// Surprise-remove the controller; all config reads return all-ones
    pub fn unplug(&mut self) {
        self.present = false;
    }

    fn is_chip(&self, addr: PciAddress) -> bool {
        self.present && addr == self.config.address
    }

    fn control(&self) -> u8 {
        if self.outputs.is_empty() {
            0
        } else {
            ControlFlags::READ_READY.bits()
        }
    }

    fn strobe(&mut self) {
        match self.pending.take() {
            None => self.pending = Some((self.select, self.data_in)),
            Some((select, address)) => {
                let [b0, b1, b2, _] = select.to_le_bytes();
                self.execute([b0, b1, b2], address, [self.select, self.data_in]);
            }
        }
    }

    fn execute(&mut self, reg: [u8; 3], address: u32, data: [u32; 2]) {
        let selector = match RegisterSelector::from_bytes(reg) {
            Ok(selector) => selector,
            Err(e) => {
                log::warn!("dummy: ignoring command: {}", e);
                return;
            }
        };
        log::trace!("dummy: {} at {:#x}", selector, address);

        let len = usize::from(selector.word_size);
        match (selector.command, selector.target) {
            (Command::Read, Target::FlashStorage) => {
                let index = self.flash_reads;
                self.flash_reads += 1;
                if self.config.fail_flash_read_at == Some(index) {
                    log::debug!("dummy: dropping flash read #{}", index);
                    return;
                }
                self.respond(Target::FlashStorage, address, len);
            }
            (Command::Read, Target::ChipMemory) => self.respond(Target::ChipMemory, address, len),
            (Command::Write, target) => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&data[0].to_le_bytes());
                payload[4..].copy_from_slice(&data[1].to_le_bytes());
                let len = len.min(payload.len());

                let storage = self.storage_mut(target);
                let start = address as usize;
                match storage.get_mut(start..start + len) {
                    Some(dest) => dest.copy_from_slice(&payload[..len]),
                    None => log::warn!("dummy: write past end of {:?} at {:#x}", target, address),
                }
            }
            (command, target) => {
                log::debug!("dummy: {:?} on {:?} accepted without effect", command, target);
            }
        }
    }

    fn storage_mut(&mut self, target: Target) -> &mut Vec<u8> {
        match target {
            Target::FlashStorage => &mut self.config.flash,
            Target::ChipMemory => &mut self.config.memory,
        }
    }

    /// Queue the response to a read; out-of-range reads never complete
    fn respond(&mut self, target: Target, address: u32, len: usize) {
        let start = address as usize;
        let words = match self.storage_mut(target).get(start..start + len) {
            Some(bytes) => pack_chunk(bytes),
            None => {
                log::debug!("dummy: {:?} read out of range at {:#x}", target, address);
                return;
            }
        };

        if len > SMALL_READ_MAX {
            self.outputs.push_back((0, 0));
        }
        self.outputs.push_back((words[0], words[1]));
    }
}

impl PciAccess for DummyBus {
    fn load_driver(&mut self) -> Result<()> {
        self.driver_loads += 1;
        self.driver_loaded = true;
        Ok(())
    }

    fn unload_driver(&mut self) -> Result<()> {
        self.driver_loaded = false;
        Ok(())
    }

    fn read_config8(&mut self, addr: PciAddress, offset: u8) -> Result<u8> {
        let dword = self.read_config32(addr, offset & !3)?;
        Ok((dword >> ((offset & 3) * 8)) as u8)
    }

    fn read_config32(&mut self, addr: PciAddress, offset: u8) -> Result<u32> {
        if !self.present {
            return Ok(PCI_ABSENT);
        }
        if !self.is_chip(addr) {
            let decoy = self.config.decoys.iter().find(|(a, _)| *a == addr);
            return Ok(match decoy {
                Some((_, ident)) if offset == config::IDENTITY => *ident,
                Some(_) => 0,
                None => PCI_ABSENT,
            });
        }

        let current = self.outputs.front().copied().unwrap_or((0, 0));
        Ok(match offset {
            config::IDENTITY => self.config.identity(),
            config::BAR0 => self.config.bar,
            REG_CONTROL => u32::from(self.control()),
            REG_DATA_OUT1 => current.0,
            REG_DATA_OUT2 => current.1,
            REG_SELECT => self.select,
            REG_DATA_IN => self.data_in,
            _ => 0,
        })
    }

    fn write_config8(&mut self, addr: PciAddress, offset: u8, value: u8) -> Result<()> {
        if !self.is_chip(addr) {
            return Ok(());
        }
        self.writes.push((offset, u32::from(value)));

        if offset == REG_CONTROL {
            let flags = ControlFlags::from_bits_truncate(value);
            if flags.contains(ControlFlags::READ_READY) {
                self.outputs.pop_front();
            }
            if flags.contains(ControlFlags::WRITE_BUSY) {
                self.strobe();
            }
        }
        Ok(())
    }

    fn write_config32(&mut self, addr: PciAddress, offset: u8, value: u32) -> Result<()> {
        if !self.is_chip(addr) {
            return Ok(());
        }
        self.writes.push((offset, value));

        match offset {
            REG_SELECT => self.select = value,
            REG_DATA_IN => self.data_in = value,
            _ => {}
        }
        Ok(())
    }

    fn map_physical_memory(&mut self, address: u64, size: usize) -> Result<Box<dyn MmioRegion>> {
        let base = Bar::from_raw(self.config.bar).phys_base();
        let bytes = address
            .checked_sub(base)
            .and_then(|off| usize::try_from(off).ok())
            .and_then(|off| self.config.mmio.get(off..off.checked_add(size)?))
            .ok_or(Error::MemoryMap { address, size })?;

        Ok(Box::new(DummyRegion {
            phys: address,
            bytes: bytes.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asmtool_core::access::{DriverSession, PollBudget};
    use asmtool_core::device::{AsmDevice, DeviceOptions, DumpProgress, NoProgress};
    use asmtool_core::error::PollStage;

    fn quick() -> DeviceOptions {
        DeviceOptions::default().with_poll_budget(PollBudget::Bounded(64))
    }

    fn patterned_flash() -> Vec<u8> {
        (0..FLASH_SIZE).map(|i| (i ^ (i >> 8)) as u8).collect()
    }

    #[test]
    fn test_identity_layout() {
        let legacy = DummyConfig::default();
        assert_eq!(legacy.identity(), 0x2142_1B21);

        let revised = DummyConfig {
            chip_id: 0x3142,
            generation: ProtocolGeneration::Revised,
            ..DummyConfig::default()
        };
        assert_eq!(revised.identity(), 0x1B21_3142);
    }

    #[test]
    fn test_open_detects_generation() {
        let dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        assert_eq!(dev.address(), PciAddress::new(2, 5, 1).unwrap());
        assert_eq!(dev.generation(), ProtocolGeneration::Legacy);
        assert_eq!(dev.bar().phys_base(), 0xFE50_0000);

        let bus = DummyBus::new(DummyConfig {
            generation: ProtocolGeneration::Revised,
            chip_id: 0x3142,
            decoys: vec![(PciAddress::new(0, 0, 0).unwrap(), 0x1234_8086)],
            ..DummyConfig::default()
        });
        let dev = AsmDevice::open(bus, quick()).unwrap();
        assert_eq!(dev.generation(), ProtocolGeneration::Revised);
        assert_eq!(dev.address(), PciAddress::new(2, 5, 1).unwrap());
    }

    #[test]
    fn test_empty_bus_not_found() {
        let mut bus = DummyBus::new_default();
        bus.unplug();
        let err = AsmDevice::open(bus, quick()).err().unwrap();
        assert!(matches!(err, Error::DeviceNotFound));
    }

    #[test]
    fn test_register_write_transcript() {
        let mut dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        dev.protocol_mut().io_mut().clear_writes();

        dev.write_memory(0x1000, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
            .unwrap();

        let writes = dev.protocol_mut().io_mut().writes().to_vec();
        assert_eq!(
            writes,
            vec![
                (REG_SELECT, 0x0008_0423),
                (REG_DATA_IN, 0x1000),
                (REG_CONTROL, 0x02),
                (REG_SELECT, 0x4433_2211),
                (REG_DATA_IN, 0x8877_6655),
                (REG_CONTROL, 0x02),
            ]
        );
    }

    #[test]
    fn test_flash_dump_reproduces_image() {
        let flash = patterned_flash();
        let bus = DummyBus::new(DummyConfig {
            flash: flash.clone(),
            ..DummyConfig::default()
        });
        let mut dev = AsmDevice::open(bus, quick()).unwrap();

        let mut out = Vec::new();
        let stats = dev.dump_flash(&mut out, &mut NoProgress).unwrap();
        assert!(stats.complete);
        assert_eq!(stats.bytes, FLASH_SIZE as u64);
        assert_eq!(out, flash);
    }

    #[test]
    fn test_flash_dump_aborts_on_stuck_read() {
        let flash = patterned_flash();
        let bus = DummyBus::new(DummyConfig {
            flash: flash.clone(),
            fail_flash_read_at: Some(100),
            ..DummyConfig::default()
        });
        let mut dev = AsmDevice::open(bus, quick()).unwrap();

        let mut out = Vec::new();
        let err = dev.dump_flash(&mut out, &mut NoProgress).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolTimeout {
                stage: PollStage::ReadReady
            }
        ));
        assert_eq!(out.len(), 800);
        assert_eq!(out[..], flash[..800]);
    }

    #[test]
    fn test_flash_dump_to_file_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        let bus = DummyBus::new(DummyConfig {
            fail_flash_read_at: Some(3),
            ..DummyConfig::default()
        });
        let mut dev = AsmDevice::open(bus, quick()).unwrap();

        assert!(dev.dump_flash_to_file(&path, &mut NoProgress).is_err());
        assert_eq!(fs::read(&path).unwrap(), vec![0xFF; 24]);
    }

    #[test]
    fn test_memory_dump_stops_at_memory_size() {
        let memory: Vec<u8> = (0..0x100u32).map(|i| (i * 3) as u8).collect();
        let bus = DummyBus::new(DummyConfig {
            memory: memory.clone(),
            ..DummyConfig::default()
        });
        let mut dev = AsmDevice::open(bus, quick()).unwrap();

        let mut out = Vec::new();
        let stats = dev
            .dump_memory(&mut out, DEFAULT_MEMORY_LIMIT, &mut NoProgress)
            .unwrap();
        assert!(!stats.complete);
        assert_eq!(stats.bytes, 0x100);
        assert_eq!(out, memory);
    }

    #[test]
    fn test_memory_dump_respects_limit() {
        let mut dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        let mut out = Vec::new();
        let stats = dev.dump_memory(&mut out, 0x40, &mut NoProgress).unwrap();
        assert!(stats.complete);
        assert_eq!(out.len(), 0x40);
    }

    #[test]
    fn test_memory_dump_unaligned_limit() {
        let memory: Vec<u8> = (0..0x100u32).map(|i| i as u8).collect();
        let bus = DummyBus::new(DummyConfig {
            memory: memory.clone(),
            ..DummyConfig::default()
        });
        let mut dev = AsmDevice::open(bus, quick()).unwrap();

        let mut out = Vec::new();
        let stats = dev.dump_memory(&mut out, 0x41, &mut NoProgress).unwrap();
        assert!(stats.complete);
        assert_eq!(stats.bytes, 0x41);
        assert_eq!(out, &memory[..0x41]);
    }

    #[test]
    fn test_write_memory_in_chunks() {
        let mut dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        let payload: Vec<u8> = (1..=11).collect();
        dev.write_memory(0x40, &payload).unwrap();

        let bus = dev.protocol_mut().io_mut();
        assert_eq!(&bus.memory()[0x40..0x4B], &payload[..]);
        assert_eq!(bus.memory()[0x4B], 0);
        let strobes = bus
            .writes()
            .iter()
            .filter(|&&(offset, value)| offset == REG_CONTROL && value == 0x02)
            .count();
        assert_eq!(strobes, 4);

        assert_eq!(dev.read_memory(0x44).unwrap(), [5, 6, 7, 8]);
    }

    #[test]
    fn test_chip_revision() {
        let mut dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        let rev = dev.chip_revision();
        assert_eq!(rev.rev0, Some(0x02));
        assert_eq!(rev.rev1, Some(0x11));

        let bus = DummyBus::new(DummyConfig {
            memory: vec![0; 0x10000],
            ..DummyConfig::default()
        });
        let mut dev = AsmDevice::open(bus, quick()).unwrap();
        let rev = dev.chip_revision();
        assert_eq!(rev.rev0, None);
        assert_eq!(rev.rev1, Some(0x11));
    }

    #[test]
    fn test_unplug_reports_device_gone() {
        let mut dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        dev.protocol_mut().io_mut().unplug();
        assert!(matches!(dev.read_flash_qword(0), Err(Error::DeviceGone)));
    }

    #[test]
    fn test_bar_window() {
        let mut dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        let window = dev.map_bar_window(0x10, 0x20).unwrap();
        assert_eq!(window.phys_addr(), 0xFE50_0010);
        assert_eq!(window.read(0, 4).unwrap(), vec![0x10, 0x11, 0x12, 0x13]);
        assert!(matches!(window.read(0x1E, 4), Err(Error::Truncated { .. })));

        assert!(matches!(
            dev.map_bar_window(0xFF0, 0x20),
            Err(Error::MemoryMap { .. })
        ));
    }

    #[test]
    fn test_driver_session_loads_and_unloads() {
        let mut bus = DummyBus::new_default();
        {
            let mut session = DriverSession::start(&mut bus).unwrap();
            assert!(session.io_mut().driver_loaded());
        }
        assert!(!bus.driver_loaded());
        assert_eq!(bus.driver_loads(), 1);
    }

    #[test]
    fn test_progress_reports_total() {
        #[derive(Default)]
        struct Recorder {
            total: u64,
            last: u64,
            finished: bool,
        }

        impl DumpProgress for Recorder {
            fn start(&mut self, total: u64) {
                self.total = total;
            }
            fn advance(&mut self, done: u64) {
                self.last = done;
            }
            fn finish(&mut self) {
                self.finished = true;
            }
        }

        let mut dev = AsmDevice::open(DummyBus::new_default(), quick()).unwrap();
        let mut progress = Recorder::default();
        dev.dump_flash(&mut std::io::sink(), &mut progress).unwrap();
        assert_eq!(progress.total, FLASH_SIZE as u64);
        assert_eq!(progress.last, FLASH_SIZE as u64);
        assert!(progress.finished);
    }

    #[test]
    fn test_from_options() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("flash.bin");
        fs::write(&image, [0xAA, 0xBB, 0xCC]).unwrap();
        let image = image.to_str().unwrap();

        let config = DummyConfig::from_options(&[
            ("chip", "3142"),
            ("bus", "0x10"),
            ("dev", "3"),
            ("func", "0"),
            ("generation", "revised"),
            ("flash", image),
            ("fail_flash_read", "7"),
            ("mem_size", "0x800"),
            ("colour", "blue"),
        ])
        .unwrap();

        assert_eq!(config.chip_id, 0x3142);
        assert_eq!(config.address, PciAddress::new(0x10, 3, 0).unwrap());
        assert_eq!(config.generation, ProtocolGeneration::Revised);
        assert_eq!(&config.flash[..4], &[0xAA, 0xBB, 0xCC, 0xFF]);
        assert_eq!(config.fail_flash_read_at, Some(7));
        assert_eq!(config.memory.len(), 0x800);

        assert!(DummyConfig::from_options(&[("dev", "40")]).is_err());
        assert!(DummyConfig::from_options(&[("generation", "auto")]).is_err());
        assert!(DummyConfig::from_options(&[("chip", "1042")]).is_err());
    }
}
