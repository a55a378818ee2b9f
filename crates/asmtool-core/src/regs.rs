//! ASMedia vendor register window in PCI configuration space
//!
//! The controller exposes its internal register interface through five
//! vendor-specific config registers. A command is submitted by writing a
//! selector and a data dword and then strobing the control register; results
//! come back through the two data-out registers.

use bitflags::bitflags;

/// Control/status register (8 bits)
pub const REG_CONTROL: u8 = 0xE0;
/// First response data dword
pub const REG_DATA_OUT1: u8 = 0xF0;
/// Second response data dword
pub const REG_DATA_OUT2: u8 = 0xF4;
/// Internal register selector (24 bits used)
pub const REG_SELECT: u8 = 0xF8;
/// Command data dword
pub const REG_DATA_IN: u8 = 0xFC;

/// Control register value while the device is absent or wedged
pub const CONTROL_ABSENT: u8 = 0xFF;

bitflags! {
    /// Control register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        /// Response data is available (host writes it back to acknowledge)
        const READ_READY = 0x01;
        /// A command is being processed (host writes it to strobe a command)
        const WRITE_BUSY = 0x02;
    }
}
