//! Error types for asmtool-core

use core::fmt;
use std::io;
use thiserror::Error;

use crate::pci::PciAddress;

/// Which ready condition a poll was waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStage {
    /// Control register write-busy bit to clear
    WriteReady,
    /// Control register read-ready bit to assert
    ReadReady,
}

impl fmt::Display for PollStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteReady => write!(f, "write ready"),
            Self::ReadReady => write!(f, "read ready"),
        }
    }
}

/// Checksummed region of a firmware image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumRegion {
    Header,
    Body,
}

impl fmt::Display for ChecksumRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => write!(f, "header"),
            Self::Body => write!(f, "body"),
        }
    }
}

/// Error type for device and firmware operations
#[derive(Debug, Error)]
pub enum Error {
    /// No ASMedia controller matched during bus probing
    #[error("no ASMedia device detected")]
    DeviceNotFound,

    /// A ready poll exhausted its budget
    #[error("timed out waiting for {stage}")]
    ProtocolTimeout { stage: PollStage },

    /// The control register kept reading 0xFF
    #[error("device stopped responding (control register reads 0xFF)")]
    DeviceGone,

    /// Firmware signature is neither generation's magic
    #[error("unexpected firmware magic \"{0}\"")]
    UnrecognizedMagic(String),

    /// Firmware descriptor names a chip we have no handling for
    #[error("unknown chip id {0:#04x}")]
    UnknownChipId(u8),

    /// Stored checksum differs from the computed one
    #[error("{region} checksum mismatch: stored {stored:#04x}, computed {computed:#04x}")]
    ChecksumMismatch {
        region: ChecksumRegion,
        stored: u8,
        computed: u8,
    },

    /// A field lies outside the image buffer
    #[error("image truncated: {len} bytes at offset {offset:#x} exceed image size {size:#x}")]
    Truncated {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Register selector bytes do not name a known command/target
    #[error("invalid register selector {0:#04x}:{1:#04x}")]
    InvalidSelector(u8, u8),

    /// Bus/device/function out of range or unparsable
    #[error("invalid PCI address: {0}")]
    InvalidAddress(String),

    /// Chip type string is not a supported model
    #[error("invalid chip type \"{0}\" (expected 2142 or 3142)")]
    InvalidChipType(String),

    /// Failed to read PCI config space
    #[error("failed to read PCI config at {addr} reg {offset:#x}")]
    ConfigRead { addr: PciAddress, offset: u8 },

    /// Failed to write PCI config space
    #[error("failed to write PCI config at {addr} reg {offset:#x}")]
    ConfigWrite { addr: PciAddress, offset: u8 },

    /// Failed to map physical memory
    #[error("failed to map memory at {address:#x} (size {size})")]
    MemoryMap { address: u64, size: usize },

    /// Operation not supported by this backend or image
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Platform backend failure
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for asmtool-core operations
pub type Result<T> = core::result::Result<T, Error>;
