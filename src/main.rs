//! asmtool - ASMedia ASM2142/ASM3142 USB controller firmware tool
//!
//! Talks to the controller through its PCI configuration space register
//! window to dump the flash ROM and chip memory, and inspects or retargets
//! firmware images offline.
//!
//! # Architecture
//!
//! Config space access is provided by a backend (`linux` on real hardware,
//! `dummy` for a simulated controller). The backend is wrapped in a
//! `DriverSession` for the duration of a command, and `AsmDevice` runs the
//! register protocol on top of it.

mod backends;
mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

use asmtool_core::{
    AsmDevice, DeviceOptions, DriverSession, FirmwareImage, OpenMode, PciAccess, PollBudget,
    ProtocolSelection,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let protocol = ProtocolSelection::parse(&cli.protocol).ok_or_else(|| {
        format!(
            "Invalid protocol '{}' (expected auto, legacy or revised)",
            cli.protocol
        )
    })?;
    let options = DeviceOptions::new()
        .with_protocol(protocol)
        .with_poll_budget(PollBudget::from_count(cli.poll_budget));

    let result = match cli.command {
        Commands::FlashRead { output } => with_device(&cli.backend, options, |dev| {
            commands::dump::run_flash_read(dev, &output)
        }),
        Commands::MemRead { output, limit } => with_device(&cli.backend, options, |dev| {
            commands::dump::run_mem_read(dev, &output, limit)
        }),
        Commands::MemWrite { address, data } => with_device(&cli.backend, options, |dev| {
            commands::memory::run_mem_write(dev, address, &data.0)
        }),
        Commands::BarRead {
            offset,
            size,
            output,
        } => with_device(&cli.backend, options, |dev| {
            commands::memory::run_bar_read(dev, offset, size, output.as_deref())
        }),
        Commands::FwInfo { path, offline } => {
            let image = FirmwareImage::open(&path, OpenMode::ReadOnly)?;
            let revision = if offline {
                None
            } else {
                with_device(&cli.backend, options, |dev| Ok(dev.chip_revision()))
                    .map_err(|e| log::warn!("Skipping chip info: {}", e))
                    .ok()
            };
            commands::firmware::format_fw_info(&image, revision).map(|info| print!("{}", info))
        }
        Commands::FwSetType { path, chip } => {
            commands::firmware::run_fw_set_type(&path, &chip).map(|_| ())
        }
        Commands::ListBackends => {
            backends::list_backends();
            Ok(())
        }
    };

    result
}

/// Open the backend, load its driver and run `f` against the detected device
///
/// The driver is unloaded again when `f` returns, whatever the outcome.
fn with_device<T, F>(
    backend: &str,
    options: DeviceOptions,
    f: F,
) -> Result<T, Box<dyn std::error::Error>>
where
    F: FnOnce(&mut AsmDevice<&mut Box<dyn PciAccess>>) -> Result<T, Box<dyn std::error::Error>>,
{
    let io = backends::open_backend(backend)?;

    log::info!("Loading access driver...");
    let mut session = DriverSession::start(io)?;
    let mut dev = AsmDevice::open(session.io_mut(), options)?;
    log::info!(
        "Found {} controller at {} (BAR {})",
        dev.generation(),
        dev.address(),
        dev.bar()
    );

    f(&mut dev)
}
