//! Firmware image buffer with lazy field access and chip type patching

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::checksum::{checksum, Check, ChecksumReport};
use super::{
    ChipType, Generation, BODY_CHECKSUM_GAP, BODY_LEN_OFFSET, CHIP_TYPE_OFFSET,
    DESCRIPTOR_LEN, DESCRIPTOR_OFFSET, FOOTER_GAP, FOOTER_LEN, HEADER_LEN_OFFSET, NAME_OFFSET,
    SIGNATURE_LEN, SIGNATURE_OFFSET,
};
use crate::error::{Error, Result};

/// How an image file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A firmware image held in memory
///
/// Only the signature, header length and body length are decoded up front.
/// Every other field is read from the buffer when asked for.
#[derive(Debug)]
pub struct FirmwareImage {
    data: Vec<u8>,
    path: Option<PathBuf>,
    mode: OpenMode,
    generation: Generation,
    header_len: usize,
    body_len: usize,
    dirty: bool,
}

fn slice_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(Error::Truncated {
            offset,
            len,
            size: data.len(),
        })
}

impl FirmwareImage {
    /// Load and parse an image file
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Opening firmware {} ({:?})", path.display(), mode);
        let data = fs::read(path)?;
        let mut image = Self::parse(data, mode)?;
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    /// Parse an in-memory image with no backing file
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::parse(data, OpenMode::ReadWrite)
    }

    fn parse(data: Vec<u8>, mode: OpenMode) -> Result<Self> {
        let raw = slice_at(&data, SIGNATURE_OFFSET, SIGNATURE_LEN)?;
        let generation = Generation::from_magic(&String::from_utf8_lossy(raw))?;

        let raw = slice_at(&data, HEADER_LEN_OFFSET, 2)?;
        let header_len = usize::from(u16::from_le_bytes([raw[0], raw[1]]));

        let raw = slice_at(&data, header_len + BODY_LEN_OFFSET, 3)?;
        let body_len = usize::from(raw[0]) | usize::from(raw[1]) << 8 | usize::from(raw[2]) << 16;

        let image = Self {
            data,
            path: None,
            mode,
            generation,
            header_len,
            body_len,
            dirty: false,
        };

        // Both checksummed ranges and their checksum bytes must be present
        slice_at(&image.data, 0, image.header_len + 1)?;
        slice_at(&image.data, image.body_start(), image.body_len)?;
        slice_at(&image.data, image.body_checksum_offset(), 1)?;

        log::debug!(
            "Firmware {:?}: header {:#x} bytes, body {:#x} bytes",
            image.generation,
            image.header_len,
            image.body_len
        );
        Ok(image)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    fn body_start(&self) -> usize {
        self.header_len + self.generation.body_start_offset()
    }

    fn header_checksum_offset(&self) -> usize {
        self.header_len
    }

    fn body_checksum_offset(&self) -> usize {
        self.body_start() + self.body_len + BODY_CHECKSUM_GAP
    }

    /// The 10-byte layout signature
    pub fn signature(&self) -> &'static str {
        self.generation.magic()
    }

    /// The 8-byte footer signature
    pub fn footer_signature(&self) -> Result<String> {
        let offset = self.header_len + self.body_len + FOOTER_GAP;
        let raw = slice_at(&self.data, offset, FOOTER_LEN)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Raw descriptor bytes: version triplet, chip type, sub type, reserved
    pub fn descriptor(&self) -> Result<[u8; DESCRIPTOR_LEN]> {
        let raw = slice_at(&self.data, DESCRIPTOR_OFFSET, DESCRIPTOR_LEN)?;
        let mut out = [0u8; DESCRIPTOR_LEN];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn chip_type(&self) -> Result<ChipType> {
        ChipType::from_byte(self.descriptor()?[3])
    }

    /// Descriptor formatted as `VVVVVV_CC_SS_RR`
    pub fn version_string(&self) -> Result<String> {
        let d = self.descriptor()?;
        Ok(format!(
            "{:02X}{:02X}{:02X}_{:02X}_{:02X}_{:02X}",
            d[0], d[1], d[2], d[3], d[4], d[5]
        ))
    }

    /// NUL-terminated name following the descriptor
    pub fn firmware_name(&self) -> Result<String> {
        let tail = self.data.get(NAME_OFFSET..).ok_or(Error::Truncated {
            offset: NAME_OFFSET,
            len: 1,
            size: self.data.len(),
        })?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    pub fn stored_header_checksum(&self) -> u8 {
        self.data[self.header_checksum_offset()]
    }

    pub fn stored_body_checksum(&self) -> u8 {
        self.data[self.body_checksum_offset()]
    }

    pub fn compute_header_checksum(&self) -> u8 {
        checksum(&self.data[..self.header_len])
    }

    pub fn compute_body_checksum(&self) -> u8 {
        let start = self.body_start();
        checksum(&self.data[start..start + self.body_len])
    }

    pub fn verify_checksums(&self) -> ChecksumReport {
        ChecksumReport {
            header: Check {
                stored: self.stored_header_checksum(),
                computed: self.compute_header_checksum(),
            },
            body: Check {
                stored: self.stored_body_checksum(),
                computed: self.compute_body_checksum(),
            },
        }
    }

    /// Patch the chip type and refresh both checksums
    pub fn set_chip_type(&mut self, chip: ChipType) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::NotSupported("image opened read-only"));
        }
        slice_at(&self.data, CHIP_TYPE_OFFSET, 1)?;
        if CHIP_TYPE_OFFSET == self.header_checksum_offset()
            || CHIP_TYPE_OFFSET == self.body_checksum_offset()
        {
            return Err(Error::NotSupported("chip type byte overlaps a checksum byte"));
        }

        log::debug!("Setting chip type to {} ({:#04x})", chip, chip as u8);
        self.data[CHIP_TYPE_OFFSET] = chip as u8;

        let header = self.compute_header_checksum();
        let header_at = self.header_checksum_offset();
        self.data[header_at] = header;

        let body = self.compute_body_checksum();
        let body_at = self.body_checksum_offset();
        self.data[body_at] = body;

        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the image to `path` through a sibling temporary file
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.verify_checksums().into_result()?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        // Replacing a file keeps its permissions
        if let Ok(meta) = fs::metadata(path) {
            tmp.as_file().set_permissions(meta.permissions())?;
        }
        tmp.write_all(&self.data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        log::debug!("Wrote {} bytes to {}", self.data.len(), path.display());
        Ok(())
    }

    /// Write pending changes back to the backing file
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let path = self
            .path
            .clone()
            .ok_or(Error::NotSupported("image has no backing file"))?;
        self.save_to(&path)?;
        self.dirty = false;
        Ok(())
    }

    /// Flush and release the image
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        self.dirty = false;
        result
    }
}

impl Drop for FirmwareImage {
    fn drop(&mut self) {
        if self.dirty && self.path.is_some() {
            if let Err(e) = self.flush() {
                log::warn!("Failed to write back firmware image: {}", e);
            }
        }
    }
}
