//! PCI configuration space access via sysfs
//!
//! Each function's config space is exposed as
//! `/sys/bus/pci/devices/DDDD:bb:dd.f/config`. Functions with no sysfs node
//! read as all-ones, like an unclaimed bus cycle.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use asmtool_core::error::{Error, Result};
use asmtool_core::pci::PciAddress;
use asmtool_core::{MmioRegion, PciAccess};

use crate::error::LinuxPciError;
use crate::physmap::PhysMap;

/// Default sysfs PCI device tree
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Options for the Linux backend
#[derive(Debug, Clone)]
pub struct LinuxPciOptions {
    /// PCI domain (segment)
    pub domain: u16,
    /// sysfs device tree
    pub sysfs_root: PathBuf,
    /// Skip the effective UID check
    pub skip_root_check: bool,
}

impl Default for LinuxPciOptions {
    fn default() -> Self {
        Self {
            domain: 0,
            sysfs_root: PathBuf::from(SYSFS_PCI_DEVICES),
            skip_root_check: false,
        }
    }
}

impl LinuxPciOptions {
    /// Parse backend options (key=value pairs)
    pub fn from_options(options: &[(&str, &str)]) -> std::result::Result<Self, LinuxPciError> {
        let mut opts = Self::default();

        for (key, value) in options {
            match *key {
                "domain" => {
                    let hex = value.strip_prefix("0x").unwrap_or(*value);
                    opts.domain = u16::from_str_radix(hex, 16).map_err(|e| {
                        LinuxPciError::InvalidParameter {
                            name: "domain",
                            message: e.to_string(),
                        }
                    })?;
                }
                "sysfs" => opts.sysfs_root = PathBuf::from(*value),
                "noroot" => {
                    opts.skip_root_check = matches!(*value, "1" | "yes" | "true");
                }
                _ => {
                    log::warn!("Unknown linux backend option: {}={}", key, value);
                }
            }
        }

        Ok(opts)
    }
}

/// sysfs-backed [`PciAccess`] implementation
pub struct LinuxPci {
    options: LinuxPciOptions,
    /// Open config files; `None` marks a function with no sysfs node
    handles: HashMap<PciAddress, Option<File>>,
}

impl LinuxPci {
    pub fn new(options: LinuxPciOptions) -> Self {
        Self {
            options,
            handles: HashMap::new(),
        }
    }

    fn config_path(&self, addr: PciAddress) -> PathBuf {
        self.options.sysfs_root.join(format!(
            "{:04x}:{:02x}:{:02x}.{:x}/config",
            self.options.domain, addr.bus, addr.device, addr.function
        ))
    }

    fn handle(&mut self, addr: PciAddress) -> std::result::Result<Option<&File>, LinuxPciError> {
        if !self.handles.contains_key(&addr) {
            let path = self.config_path(addr);
            let file = open_config(&path)?;
            self.handles.insert(addr, file);
        }
        Ok(self.handles.get(&addr).and_then(Option::as_ref))
    }

    fn read_config(&mut self, addr: PciAddress, offset: u8, buf: &mut [u8]) -> Result<bool> {
        let Some(file) = self.handle(addr)? else {
            return Ok(false);
        };
        match file.read_exact_at(buf, u64::from(offset)) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::debug!("config read {} +{:#x}: {}", addr, offset, e);
                Err(Error::ConfigRead { addr, offset })
            }
        }
    }

    fn write_config(&mut self, addr: PciAddress, offset: u8, buf: &[u8]) -> Result<()> {
        let file = self.handle(addr)?.ok_or(Error::ConfigWrite { addr, offset })?;
        file.write_all_at(buf, u64::from(offset)).map_err(|e| {
            log::debug!("config write {} +{:#x}: {}", addr, offset, e);
            Error::ConfigWrite { addr, offset }
        })
    }
}

impl Default for LinuxPci {
    fn default() -> Self {
        Self::new(LinuxPciOptions::default())
    }
}

fn open_config(path: &Path) -> std::result::Result<Option<File>, LinuxPciError> {
    let opened = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .or_else(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => File::open(path),
            _ => Err(e),
        });

    match opened {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LinuxPciError::ConfigOpen {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl PciAccess for LinuxPci {
    fn load_driver(&mut self) -> Result<()> {
        if !self.options.sysfs_root.is_dir() {
            return Err(LinuxPciError::SysfsMissing(self.options.sysfs_root.clone()).into());
        }
        // SAFETY: geteuid has no preconditions
        if !self.options.skip_root_check && unsafe { libc::geteuid() } != 0 {
            return Err(LinuxPciError::NotRoot.into());
        }
        log::debug!("Using PCI sysfs at {}", self.options.sysfs_root.display());
        Ok(())
    }

    fn unload_driver(&mut self) -> Result<()> {
        self.handles.clear();
        Ok(())
    }

    fn read_config8(&mut self, addr: PciAddress, offset: u8) -> Result<u8> {
        let mut buf = [0xFFu8; 1];
        self.read_config(addr, offset, &mut buf)?;
        Ok(buf[0])
    }

    fn read_config32(&mut self, addr: PciAddress, offset: u8) -> Result<u32> {
        let mut buf = [0xFFu8; 4];
        self.read_config(addr, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_config8(&mut self, addr: PciAddress, offset: u8, value: u8) -> Result<()> {
        self.write_config(addr, offset, &[value])
    }

    fn write_config32(&mut self, addr: PciAddress, offset: u8, value: u32) -> Result<()> {
        self.write_config(addr, offset, &value.to_le_bytes())
    }

    fn map_physical_memory(&mut self, address: u64, size: usize) -> Result<Box<dyn MmioRegion>> {
        Ok(Box::new(PhysMap::new(address, size)?))
    }
}
