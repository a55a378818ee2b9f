//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Raw bytes given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

/// Parse a hex byte string ("deadbeef", "de:ad:be:ef" or "de ad be ef")
fn parse_hex_bytes(s: &str) -> Result<HexBytes, String> {
    let digits: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ' ' | ':' | ',' | '_'))
        .collect();

    if digits.is_empty() {
        return Err("No bytes given".to_string());
    }
    if !digits.is_ascii() {
        return Err(format!("Invalid hex string '{}'", s));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits in '{}'", s));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex byte '{}': {}", &digits[i..i + 2], e))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(HexBytes)
}

#[derive(Parser)]
#[command(name = "asmtool")]
#[command(author, version, about = "ASMedia ASM2142/ASM3142 firmware tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Access backend with options [available: linux, dummy]
    /// (e.g. "linux" or "dummy:chip=3142,generation=revised")
    #[arg(short, long, global = true, default_value = "linux")]
    pub backend: String,

    /// Register protocol generation (auto, legacy, revised)
    #[arg(long, global = true, default_value = "auto")]
    pub protocol: String,

    /// Ready poll iterations before a command times out (0 = wait forever)
    #[arg(long, global = true, default_value_t = 20000)]
    pub poll_budget: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dump the controller's flash ROM
    #[command(name = "flash_read", alias = "flash-read")]
    FlashRead {
        /// Output file
        #[arg(short, long, default_value = "dump.bin")]
        output: PathBuf,
    },

    /// Dump controller memory until a read fails
    #[command(name = "mem_read", alias = "mem-read")]
    MemRead {
        /// Output file
        #[arg(short, long, default_value = "mem.bin")]
        output: PathBuf,

        /// Stop after this many bytes (hex or decimal)
        #[arg(long, value_parser = parse_hex_u32, default_value = "0x20000")]
        limit: u32,
    },

    /// Write bytes to controller memory
    #[command(name = "mem_write", alias = "mem-write")]
    MemWrite {
        /// Target address (hex or decimal)
        #[arg(value_parser = parse_hex_u32)]
        address: u32,

        /// Bytes to write, as hex ("deadbeef" or "de:ad:be:ef")
        #[arg(value_parser = parse_hex_bytes)]
        data: HexBytes,
    },

    /// Show firmware image metadata and checksums
    #[command(name = "fw_info", alias = "fw-info")]
    FwInfo {
        /// Firmware image
        path: PathBuf,

        /// Do not query the controller for its revision
        #[arg(long)]
        offline: bool,
    },

    /// Write a copy of a firmware image retargeted to another chip
    #[command(name = "fw_set_type", alias = "fw-set-type")]
    FwSetType {
        /// Firmware image (left untouched; the copy is <name>_patched.bin)
        path: PathBuf,

        /// Target chip (2142 or 3142)
        chip: String,
    },

    /// Read from the controller's BAR-mapped register window
    #[command(name = "bar_read", alias = "bar-read")]
    BarRead {
        /// Offset into the window (hex or decimal)
        #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// Number of bytes (hex or decimal)
        #[arg(long, value_parser = parse_hex_u32, default_value = "0x100")]
        size: u32,

        /// Write raw bytes to a file instead of a hexdump
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List available access backends
    #[command(name = "list_backends", alias = "list-backends")]
    ListBackends,
}
