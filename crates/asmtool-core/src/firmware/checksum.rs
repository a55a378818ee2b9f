//! Firmware header/body checksum
//!
//! An 8-bit wrapping sum kept exactly as the vendor flashing tool computes
//! it: low bytes of each pair, high bytes of each pair, and a trailing odd
//! byte are summed separately and then combined.

use crate::error::{ChecksumRegion, Error, Result};

/// Checksum over a byte range
pub fn checksum(bytes: &[u8]) -> u8 {
    let mut pairs = bytes.chunks_exact(2);
    let mut p0 = 0u8;
    let mut p1 = 0u8;
    for pair in &mut pairs {
        p0 = p0.wrapping_add(pair[0]);
        p1 = p1.wrapping_add(pair[1]);
    }
    let p2 = pairs.remainder().first().copied().unwrap_or(0);

    p0.wrapping_add(p1).wrapping_add(p2)
}

/// Stored vs. computed checksum for one region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Check {
    pub stored: u8,
    pub computed: u8,
}

impl Check {
    pub fn is_valid(&self) -> bool {
        self.stored == self.computed
    }
}

/// Result of verifying both checksums of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumReport {
    pub header: Check,
    pub body: Check,
}

impl ChecksumReport {
    pub fn is_valid(&self) -> bool {
        self.header.is_valid() && self.body.is_valid()
    }

    /// First mismatch as an error
    pub fn into_result(self) -> Result<()> {
        for (region, check) in [
            (ChecksumRegion::Header, self.header),
            (ChecksumRegion::Body, self.body),
        ] {
            if !check.is_valid() {
                return Err(Error::ChecksumMismatch {
                    region,
                    stored: check.stored,
                    computed: check.computed,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_header() {
        assert_eq!(checksum(&[0u8; 0x40]), 0);
    }

    #[test]
    fn test_single_byte_header() {
        assert_eq!(checksum(&[0xFF]), 0xFF);
    }

    #[test]
    fn test_empty_range() {
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_wrapping_sum() {
        // p0 = 0x80 + 0x90 = 0x10, p1 = 0x01 + 0x02 = 0x03, p2 = 0xF0
        assert_eq!(checksum(&[0x80, 0x01, 0x90, 0x02, 0xF0]), 0x03);
    }

    #[test]
    fn test_single_byte_change_is_detected() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let base = checksum(&data);
        assert_eq!(checksum(&data), base);

        let mut modified = data.clone();
        modified[517] ^= 0x10;
        assert_ne!(checksum(&modified), base);
    }

    #[test]
    fn test_report_into_result() {
        let ok = Check {
            stored: 0x12,
            computed: 0x12,
        };
        let bad = Check {
            stored: 0x12,
            computed: 0x34,
        };
        assert!(ChecksumReport { header: ok, body: ok }.into_result().is_ok());

        let err = ChecksumReport {
            header: ok,
            body: bad,
        }
        .into_result()
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                region: ChecksumRegion::Body,
                stored: 0x12,
                computed: 0x34
            }
        ));
    }
}
