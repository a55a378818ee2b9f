//! Internal register command/response protocol
//!
//! Every logical operation is a register write (selector + address + up to
//! two payload words) followed, for reads, by polled response packets.
//! There are no retries: the first failed poll or packet read aborts the
//! operation.

use core::fmt;

use crate::access::{PciAccess, PollBudget};
use crate::error::{Error, Result};
use crate::pci::PciAddress;
use crate::regs::{ControlFlags, REG_CONTROL, REG_DATA_OUT1};

/// Size of a response packet
pub const PACKET_SIZE: usize = 0x2C;

/// Payload bytes carried by one register write
pub const WRITE_CHUNK_SIZE: usize = 8;

/// Largest word the lightweight response-window path can return
pub const SMALL_READ_MAX: usize = 4;

/// Operation code (selector byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Read = 0x40,
    SectorErase = 0x30,
    SectorWrite = 0x1E,
    Write = 0x23,
    WriteStatusRegister = 0x4C,
}

impl Command {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x40 => Some(Self::Read),
            0x30 => Some(Self::SectorErase),
            0x1E => Some(Self::SectorWrite),
            0x23 => Some(Self::Write),
            0x4C => Some(Self::WriteStatusRegister),
            _ => None,
        }
    }
}

/// Addressed storage (selector byte 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Target {
    ChipMemory = 0x04,
    FlashStorage = 0x10,
}

impl Target {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x04 => Some(Self::ChipMemory),
            0x10 => Some(Self::FlashStorage),
            _ => None,
        }
    }
}

/// Internal register selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSelector {
    pub command: Command,
    pub target: Target,
    /// Word size in bytes (selector byte 2)
    pub word_size: u8,
}

impl RegisterSelector {
    pub const fn new(command: Command, target: Target, word_size: u8) -> Self {
        Self {
            command,
            target,
            word_size,
        }
    }

    /// Selector as its three register bytes
    pub fn to_bytes(self) -> [u8; 3] {
        [self.command as u8, self.target as u8, self.word_size]
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Result<Self> {
        let command =
            Command::from_byte(bytes[0]).ok_or(Error::InvalidSelector(bytes[0], bytes[1]))?;
        let target =
            Target::from_byte(bytes[1]).ok_or(Error::InvalidSelector(bytes[0], bytes[1]))?;
        Ok(Self::new(command, target, bytes[2]))
    }

    /// Single 24-bit register value used by the legacy interface
    pub fn compose(self) -> u32 {
        let [b0, b1, b2] = self.to_bytes();
        u32::from(b0) + ((u32::from(b1) + (u32::from(b2) << 8)) << 8)
    }

    pub fn decompose(value: u32) -> Result<Self> {
        Self::from_bytes([value as u8, (value >> 8) as u8, (value >> 16) as u8])
    }
}

impl fmt::Display for RegisterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{}", self.command, self.target, self.word_size)
    }
}

/// Register protocol generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolGeneration {
    /// Composed 24-bit register id; device found by its high identity half
    Legacy,
    /// Separate command/function/size fields; device found by its low half
    Revised,
}

impl ProtocolGeneration {
    /// Register bytes handed to `write_command_all`
    pub fn encode(self, selector: RegisterSelector) -> [u8; 3] {
        match self {
            Self::Legacy => {
                let reg = selector.compose();
                [reg as u8, (reg >> 8) as u8, (reg >> 16) as u8]
            }
            Self::Revised => selector.to_bytes(),
        }
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Revised => write!(f, "revised"),
        }
    }
}

/// Configured protocol choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolSelection {
    /// Pick the generation by how the device was found during probing
    #[default]
    Auto,
    Fixed(ProtocolGeneration),
}

impl ProtocolSelection {
    /// Parse from a string (auto, legacy, revised)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "legacy" => Some(Self::Fixed(ProtocolGeneration::Legacy)),
            "revised" => Some(Self::Fixed(ProtocolGeneration::Revised)),
            _ => None,
        }
    }
}

/// Decoded 0x2C-byte response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    /// Bus/device/function echo
    pub echo: [u32; 3],
    pub data1: u32,
    pub data2: u32,
    pub reserved: [u8; 24],
}

impl ResponsePacket {
    pub fn new(addr: PciAddress, data1: u32, data2: u32) -> Self {
        Self {
            echo: [
                u32::from(addr.bus),
                u32::from(addr.device),
                u32::from(addr.function),
            ],
            data1,
            data2,
            reserved: [0; 24],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_SIZE {
            return Err(Error::Truncated {
                offset: 0,
                len: PACKET_SIZE,
                size: buf.len(),
            });
        }

        let dword =
            |off: usize| u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let mut reserved = [0u8; 24];
        reserved.copy_from_slice(&buf[20..PACKET_SIZE]);

        Ok(Self {
            echo: [dword(0), dword(4), dword(8)],
            data1: dword(12),
            data2: dword(16),
            reserved,
        })
    }

    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        for (i, word) in self.echo.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        buf[12..16].copy_from_slice(&self.data1.to_le_bytes());
        buf[16..20].copy_from_slice(&self.data2.to_le_bytes());
        buf[20..].copy_from_slice(&self.reserved);
        buf
    }

    /// Echoed address (fields truncated to their PCI widths)
    pub fn address(&self) -> PciAddress {
        PciAddress {
            bus: self.echo[0] as u8,
            device: self.echo[1] as u8,
            function: self.echo[2] as u8,
        }
    }

    /// Data2:Data1 as one little-endian qword
    pub fn value(&self) -> u64 {
        (u64::from(self.data2) << 32) | u64::from(self.data1)
    }
}

/// Pack up to 8 bytes into two little-endian words, zero padded
pub fn pack_chunk(chunk: &[u8]) -> [u32; 2] {
    let mut words = [0u32; 2];
    for (i, &byte) in chunk.iter().take(WRITE_CHUNK_SIZE).enumerate() {
        words[i / 4] |= u32::from(byte) << ((i % 4) * 8);
    }
    words
}

/// Register protocol bound to one resolved device
pub struct RegisterProtocol<A: PciAccess> {
    io: A,
    addr: PciAddress,
    generation: ProtocolGeneration,
    budget: PollBudget,
}

impl<A: PciAccess> RegisterProtocol<A> {
    pub fn new(
        io: A,
        addr: PciAddress,
        generation: ProtocolGeneration,
        budget: PollBudget,
    ) -> Self {
        Self {
            io,
            addr,
            generation,
            budget,
        }
    }

    pub fn address(&self) -> PciAddress {
        self.addr
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn budget(&self) -> PollBudget {
        self.budget
    }

    pub fn io_mut(&mut self) -> &mut A {
        &mut self.io
    }

    pub fn into_inner(self) -> A {
        self.io
    }

    /// Submit a selector with an address word and two payload words
    pub fn write_register(
        &mut self,
        selector: RegisterSelector,
        address: u32,
        data: [u32; 2],
    ) -> Result<()> {
        let reg = self.generation.encode(selector);
        log::trace!(
            "write_register {} reg={:02x}{:02x}{:02x} addr={:#x} data={:08x}:{:08x}",
            selector,
            reg[2],
            reg[1],
            reg[0],
            address,
            data[1],
            data[0]
        );
        self.io
            .write_command_all(self.addr, reg, [address, data[0], data[1]], self.budget)
    }

    /// Wait for and decode one response packet
    pub fn read_packet(&mut self) -> Result<ResponsePacket> {
        self.io.wait_read_ready(self.addr, self.budget)?;
        let raw = self.io.read_response_packet(self.addr)?;
        ResponsePacket::decode(&raw)
    }

    /// Full read exchange: register write, ack packet, reply packet
    pub fn exchange(&mut self, selector: RegisterSelector, address: u32) -> Result<ResponsePacket> {
        self.write_register(selector, address, [0, 0])?;
        let _ack = self.read_packet()?;
        let reply = self.read_packet()?;
        log::trace!("reply {:#018x}", reply.value());
        Ok(reply)
    }

    /// Lightweight read through the response byte window
    ///
    /// Only `selector.word_size` bytes are read; the rest stay zero.
    pub fn read_small(&mut self, selector: RegisterSelector, address: u32) -> Result<[u8; 4]> {
        let len = usize::from(selector.word_size);
        if len > SMALL_READ_MAX {
            return Err(Error::NotSupported("word size too large for the response window"));
        }

        self.write_register(selector, address, [0, 0])?;
        self.io.wait_read_ready(self.addr, self.budget)?;

        let mut out = [0u8; 4];
        for (i, byte) in out.iter_mut().take(len).enumerate() {
            *byte = self.io.read_config8(self.addr, REG_DATA_OUT1 + i as u8)?;
        }
        self.io
            .write_config8(self.addr, REG_CONTROL, ControlFlags::READ_READY.bits())?;
        Ok(out)
    }

    /// Write a payload in 8-byte units, each followed by a write-ready poll
    pub fn write_chunks(&mut self, target: Target, address: u32, bytes: &[u8]) -> Result<()> {
        for (index, chunk) in bytes.chunks(WRITE_CHUNK_SIZE).enumerate() {
            let chunk_addr = u32::try_from(index * WRITE_CHUNK_SIZE)
                .ok()
                .and_then(|off| address.checked_add(off))
                .ok_or(Error::NotSupported("write crosses the 32-bit address space"))?;

            let selector = RegisterSelector::new(Command::Write, target, chunk.len() as u8);
            self.write_register(selector, chunk_addr, pack_chunk(chunk))?;
            self.io.wait_write_ready(self.addr, self.budget)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_COMMANDS: [Command; 5] = [
        Command::Read,
        Command::SectorErase,
        Command::SectorWrite,
        Command::Write,
        Command::WriteStatusRegister,
    ];

    #[test]
    fn test_selector_decode_inverts_encode() {
        for command in ALL_COMMANDS {
            for target in [Target::ChipMemory, Target::FlashStorage] {
                for word_size in [1u8, 4, 8] {
                    let sel = RegisterSelector::new(command, target, word_size);
                    assert_eq!(RegisterSelector::from_bytes(sel.to_bytes()).unwrap(), sel);
                    assert_eq!(RegisterSelector::decompose(sel.compose()).unwrap(), sel);
                }
            }
        }
    }

    #[test]
    fn test_flash_read_selector_value() {
        let sel = RegisterSelector::new(Command::Read, Target::FlashStorage, 8);
        assert_eq!(sel.compose(), 0x08_10_40);
        assert_eq!(ProtocolGeneration::Legacy.encode(sel), [0x40, 0x10, 0x08]);
        assert_eq!(ProtocolGeneration::Revised.encode(sel), [0x40, 0x10, 0x08]);
    }

    #[test]
    fn test_invalid_selector_rejected() {
        assert!(matches!(
            RegisterSelector::from_bytes([0x99, 0x10, 8]),
            Err(Error::InvalidSelector(0x99, 0x10))
        ));
        assert!(RegisterSelector::from_bytes([0x40, 0x05, 8]).is_err());
    }

    #[test]
    fn test_packet_decode() {
        let mut raw = [0u8; PACKET_SIZE];
        raw[0] = 2;
        raw[4] = 5;
        raw[8] = 1;
        raw[12..16].copy_from_slice(&0xDDCC_BBAAu32.to_le_bytes());
        raw[16..20].copy_from_slice(&0x4433_2211u32.to_le_bytes());
        raw[43] = 0x5A;

        let pkt = ResponsePacket::decode(&raw).unwrap();
        assert_eq!(pkt.address(), PciAddress::new(2, 5, 1).unwrap());
        assert_eq!(pkt.value(), 0x4433_2211_DDCC_BBAA);
        assert_eq!(pkt.reserved[23], 0x5A);
        assert_eq!(pkt.to_bytes(), raw);
    }

    #[test]
    fn test_short_packet_is_truncated() {
        let err = ResponsePacket::decode(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::Truncated { len: PACKET_SIZE, size: 20, .. }));
    }

    #[test]
    fn test_pack_chunk() {
        assert_eq!(
            pack_chunk(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]),
            [0x0403_0201, 0x0807_0605]
        );
        assert_eq!(pack_chunk(&[0xAA, 0xBB, 0xCC]), [0x00CC_BBAA, 0]);
        assert_eq!(pack_chunk(&[]), [0, 0]);
    }

    #[test]
    fn test_protocol_selection_parse() {
        assert_eq!(ProtocolSelection::parse("auto"), Some(ProtocolSelection::Auto));
        assert_eq!(
            ProtocolSelection::parse("Legacy"),
            Some(ProtocolSelection::Fixed(ProtocolGeneration::Legacy))
        );
        assert_eq!(ProtocolSelection::parse("v3"), None);
    }
}
