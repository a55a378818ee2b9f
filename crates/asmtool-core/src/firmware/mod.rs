//! ASMedia firmware image format
//!
//! Layout (all multi-byte fields little endian):
//!
//! ```text
//! 0x00         header (length H at [4:6]), signature at [6:16]
//! H            header checksum
//! H+5..H+8     body length B (24 bits)
//! H+S..H+S+B   body, S = 7 (gen1) or 9 (gen2)
//! H+S+B+8      body checksum
//! H+B+9        footer signature (8 bytes)
//! 0xB9..0xBF   descriptor: version[3], chip type, sub type, reserved
//! 0xC0         firmware name (NUL terminated)
//! ```

mod checksum;
mod image;

use core::fmt;
use core::str::FromStr;

use crate::error::{Error, Result};

pub use checksum::{checksum, Check, ChecksumReport};
pub use image::{FirmwareImage, OpenMode};

/// Offset of the header length field
pub const HEADER_LEN_OFFSET: usize = 4;
/// Offset and length of the layout signature
pub const SIGNATURE_OFFSET: usize = 6;
pub const SIGNATURE_LEN: usize = 10;
/// Offset of the body length, relative to the header end
pub const BODY_LEN_OFFSET: usize = 5;
/// Distance from the body end to the body checksum
pub const BODY_CHECKSUM_GAP: usize = 8;
/// Distance from header+body to the footer signature
pub const FOOTER_GAP: usize = 9;
pub const FOOTER_LEN: usize = 8;

/// Firmware descriptor
pub const DESCRIPTOR_OFFSET: usize = 0xB9;
pub const DESCRIPTOR_LEN: usize = 6;
/// Chip type byte (descriptor byte 3)
pub const CHIP_TYPE_OFFSET: usize = DESCRIPTOR_OFFSET + 3;
/// Firmware name string
pub const NAME_OFFSET: usize = DESCRIPTOR_OFFSET + 7;

pub const MAGIC_GEN1: &str = "2114A_RCFG";
pub const MAGIC_GEN2: &str = "2214A_RCFG";

/// Layout generation, identified by the signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen1,
    Gen2,
}

impl Generation {
    pub fn from_magic(magic: &str) -> Result<Self> {
        match magic {
            MAGIC_GEN1 => Ok(Self::Gen1),
            MAGIC_GEN2 => Ok(Self::Gen2),
            _ => Err(Error::UnrecognizedMagic(magic.to_string())),
        }
    }

    pub fn magic(self) -> &'static str {
        match self {
            Self::Gen1 => MAGIC_GEN1,
            Self::Gen2 => MAGIC_GEN2,
        }
    }

    /// Body start relative to the header end
    pub fn body_start_offset(self) -> usize {
        match self {
            Self::Gen1 => 7,
            Self::Gen2 => 9,
        }
    }
}

/// Chip model a firmware targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChipType {
    Asm2142 = 0x50,
    Asm3142 = 0x70,
}

impl ChipType {
    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            0x50 => Ok(Self::Asm2142),
            0x70 => Ok(Self::Asm3142),
            other => Err(Error::UnknownChipId(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Asm2142 => "ASM2142",
            Self::Asm3142 => "ASM3142",
        }
    }
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().trim_start_matches("asm") {
            "2142" => Ok(Self::Asm2142),
            "3142" => Ok(Self::Asm3142),
            _ => Err(Error::InvalidChipType(s.to_string())),
        }
    }
}
