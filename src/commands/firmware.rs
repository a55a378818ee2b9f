//! fw_info and fw_set_type

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use asmtool_core::firmware::ChipType;
use asmtool_core::{ChipRevision, FirmwareImage};

/// Render the image report, and the live chip revision when available
pub fn format_fw_info(
    image: &FirmwareImage,
    revision: Option<ChipRevision>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut out = String::new();
    let report = image.verify_checksums();

    writeln!(out, "==== File Info ====")?;
    if let Some(path) = image.path() {
        writeln!(out, "File: {}", path.display())?;
    }
    writeln!(out, "File Checksum [header]: {:02X}", report.header.stored)?;
    writeln!(out, "File Checksum [body]: {:02X}", report.body.stored)?;
    writeln!(out, "Computed Checksum [header]: {:02X}", report.header.computed)?;
    writeln!(out, "Computed Checksum [body]: {:02X}", report.body.computed)?;
    if !report.is_valid() {
        writeln!(out, "!! WARNING: Checksum Mismatch")?;
    }

    writeln!(out, "Signature: {}", image.signature())?;
    writeln!(out, "FW Name: {}", image.firmware_name()?)?;
    writeln!(out, "Footer: {}", image.footer_signature()?)?;

    let chip = image.chip_type()?;
    writeln!(out, "Chip: 0x{:02X}: {}", chip as u8, chip.name())?;
    writeln!(out, "Version: {}", image.version_string()?)?;

    if let Some(rev) = revision {
        writeln!(out, "==== Actual Chip Info ====")?;
        if let Some(rev0) = rev.rev0 {
            writeln!(out, "Chip Rev0: 0x{:02X}", rev0)?;
        }
        if let Some(rev1) = rev.rev1 {
            writeln!(out, "Chip Rev1: 0x{:02X}", rev1)?;
        }
    }
    Ok(out)
}

/// `dir/name.bin` -> `dir/name_patched.bin`
pub fn patched_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}_patched.bin", stem))
}

/// Copy `path` next to itself and retarget the copy to `chip`
pub fn run_fw_set_type(
    path: &Path,
    chip: &str,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let chip: ChipType = chip.parse()?;
    let patched = patched_path(path);

    fs::copy(path, &patched)?;
    let mut image = FirmwareImage::open(&patched, asmtool_core::OpenMode::ReadWrite)?;
    println!("Setting {}", chip);
    image.set_chip_type(chip)?;
    image.close()?;

    println!("Wrote {}", patched.display());
    Ok(patched)
}
