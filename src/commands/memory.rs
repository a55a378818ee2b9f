//! mem_write and bar_read

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use asmtool_core::{AsmDevice, PciAccess};

/// Write `data` to chip memory at `address`
pub fn run_mem_write<A: PciAccess>(
    dev: &mut AsmDevice<A>,
    address: u32,
    data: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Writing {} bytes to {:#x}", data.len(), address);
    dev.write_memory(address, data)?;
    println!("Wrote {} bytes at {:#07x}", data.len(), address);
    Ok(())
}

/// Read `size` bytes of the BAR window at `offset`
///
/// Prints a hexdump, or writes the raw bytes when `output` is given.
pub fn run_bar_read<A: PciAccess>(
    dev: &mut AsmDevice<A>,
    offset: u32,
    size: u32,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let size = size as usize;
    let window = dev.map_bar_window(offset, size)?;
    let data = window.read(0, size)?;

    match output {
        Some(path) => {
            fs::write(path, &data)?;
            println!("Wrote {} bytes to {:?}", data.len(), path);
        }
        None => print!("{}", hexdump(u64::from(offset), &data)),
    }
    Ok(())
}

/// Format `data` as 16-byte hexdump lines labelled from `base`
pub fn hexdump(base: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}: ", base + (i * 16) as u64);
        for col in 0..16 {
            match line.get(col) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use asmtool_core::{DeviceOptions, PollBudget};
    use asmtool_dummy::DummyBus;

    #[test]
    fn test_hexdump_layout() {
        let dump = hexdump(0x20, b"ASM2142\x00\x01");
        assert_eq!(
            dump,
            "00000020: 41 53 4d 32 31 34 32 00 01                       ASM2142..\n"
        );
    }

    #[test]
    fn test_hexdump_multiple_lines() {
        let data: Vec<u8> = (0..20).collect();
        let dump = hexdump(0, &data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("00000010: 10 11 12 13 "));
    }

    #[test]
    fn test_mem_write_and_bar_read() {
        let options = DeviceOptions::default().with_poll_budget(PollBudget::Bounded(32));
        let mut dev = AsmDevice::open(DummyBus::new_default(), options).unwrap();
        run_mem_write(&mut dev, 0x100, &[1, 2, 3, 4]).unwrap();
        assert_eq!(dev.read_memory(0x100).unwrap(), [1, 2, 3, 4]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bar.bin");
        run_bar_read(&mut dev, 0x10, 0x20, Some(&path)).unwrap();
        let expected: Vec<u8> = (0x10..0x30).collect();
        assert_eq!(fs::read(&path).unwrap(), expected);
    }
}
