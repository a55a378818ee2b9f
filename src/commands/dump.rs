//! flash_read and mem_read

use std::path::Path;

use asmtool_core::{AsmDevice, PciAccess};

use super::progress::IndicatifProgress;

/// Dump the flash ROM to `output`
///
/// A failed read aborts the dump; whatever was read stays in the file.
pub fn run_flash_read<A: PciAccess>(
    dev: &mut AsmDevice<A>,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Dumping firmware...");
    let mut progress = IndicatifProgress::new("flash");

    let stats = dev.dump_flash_to_file(output, &mut progress)?;
    println!("Wrote {} bytes to {:?}", stats.bytes, output);
    Ok(())
}

/// Dump chip memory to `output`, stopping at the first unreadable word
pub fn run_mem_read<A: PciAccess>(
    dev: &mut AsmDevice<A>,
    output: &Path,
    limit: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Dumping memory...");
    let mut progress = IndicatifProgress::new("memory");

    let stats = dev.dump_memory_to_file(output, limit, &mut progress)?;
    if !stats.complete {
        println!("Memory readable up to {:#x}", stats.bytes);
    }
    println!("Wrote {} bytes to {:?}", stats.bytes, output);
    Ok(())
}
