//! Error types for the Linux backend

use std::io;
use std::path::PathBuf;

use asmtool_core::Error;
use thiserror::Error;

/// Linux backend errors
#[derive(Debug, Error)]
pub enum LinuxPciError {
    /// sysfs PCI tree is not available
    #[error("PCI sysfs tree not found at {0}")]
    SysfsMissing(PathBuf),

    /// Config space past the standard header needs root
    #[error("root privileges are required for PCI config and /dev/mem access")]
    NotRoot,

    /// Failed to open a device's config file
    #[error("Failed to open '{path}': {source}")]
    ConfigOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// mmap of /dev/mem failed
    #[error("Failed to map {size:#x} bytes at {address:#x}: {source}")]
    MemoryMap {
        address: u64,
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Invalid backend option
    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: &'static str, message: String },
}

impl From<LinuxPciError> for Error {
    fn from(e: LinuxPciError) -> Self {
        match e {
            LinuxPciError::MemoryMap { address, size, source } => {
                log::debug!("mmap failed: {}", source);
                Error::MemoryMap { address, size }
            }
            other => Error::Backend(Box::new(other)),
        }
    }
}
