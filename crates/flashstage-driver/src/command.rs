//! Flash transaction descriptors
//!
//! A [`FlashCommand`] describes one bus transaction: opcode, line count per
//! phase, optional address, dummy cycles and data direction. It is pure data;
//! [`FlashController`](crate::FlashController) issues it. Phases a command
//! does not use are [`LineMode::None`], never left implicit.

use flashstage_chip::nor::{self, Protocol};
use flashstage_chip::regs::ccr;

/// Number of data lines used by one command phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// Phase skipped
    None,
    /// One line
    Single,
    /// Two lines
    Dual,
    /// Four lines
    Quad,
}

impl LineMode {
    /// Line mode every phase uses while the device speaks `protocol`
    pub const fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Spi => Self::Single,
            Protocol::Qpi => Self::Quad,
        }
    }

    const fn bits(self) -> u32 {
        match self {
            Self::None => ccr::mode::NONE,
            Self::Single => ccr::mode::SINGLE,
            Self::Dual => ccr::mode::DUAL,
            Self::Quad => ccr::mode::QUAD,
        }
    }

    /// Decode a two-bit CCR line-mode field
    pub const fn from_bits(bits: u32) -> Self {
        match bits & ccr::FIELD2_MASK {
            ccr::mode::NONE => Self::None,
            ccr::mode::SINGLE => Self::Single,
            ccr::mode::DUAL => Self::Dual,
            _ => Self::Quad,
        }
    }
}

/// Width of the address phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSize {
    /// 24-bit address (3 bytes)
    Bits24,
    /// 32-bit address (4 bytes)
    Bits32,
}

impl AddressSize {
    const fn bits(self) -> u32 {
        match self {
            Self::Bits24 => ccr::size::BITS_24,
            Self::Bits32 => ccr::size::BITS_32,
        }
    }
}

/// Direction of the data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    None,
    /// Device to host
    Read,
    /// Host to device
    Write,
}

/// One bus transaction descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashCommand {
    /// Instruction opcode
    pub instruction: u8,
    /// Lines used for the instruction phase
    pub instruction_lines: LineMode,
    /// Address, if the command has an address phase
    pub address: Option<u32>,
    /// Lines used for the address phase
    pub address_lines: LineMode,
    /// Address phase width
    pub address_size: AddressSize,
    /// Dummy cycles between address and data
    pub dummy_cycles: u8,
    /// Lines used for the data phase
    pub data_lines: LineMode,
    /// Data direction
    pub direction: DataDirection,
}

impl FlashCommand {
    /// Instruction-only command: no address, no dummy cycles, no data
    pub const fn control(instruction: u8, protocol: Protocol) -> Self {
        Self {
            instruction,
            instruction_lines: LineMode::for_protocol(protocol),
            address: None,
            address_lines: LineMode::None,
            address_size: AddressSize::Bits32,
            dummy_cycles: 0,
            data_lines: LineMode::None,
            direction: DataDirection::None,
        }
    }

    /// Set the write-enable latch
    pub const fn write_enable(protocol: Protocol) -> Self {
        Self::control(nor::CMD_WRITE_ENABLE, protocol)
    }

    /// Switch the device from SPI to QPI protocol
    ///
    /// Always issued on one line: the device decodes it only while in SPI.
    pub const fn enter_qpi() -> Self {
        Self::control(nor::CMD_ENTER_QPI, Protocol::Spi)
    }

    /// Return the device from QPI to SPI protocol
    pub const fn exit_qpi() -> Self {
        Self::control(nor::CMD_EXIT_QPI, Protocol::Qpi)
    }

    /// Fast read at `address`, every phase on the protocol's line count
    pub const fn fast_read(protocol: Protocol, address: u32) -> Self {
        let lines = LineMode::for_protocol(protocol);
        Self {
            instruction: nor::CMD_FAST_READ,
            instruction_lines: lines,
            address: Some(address),
            address_lines: lines,
            address_size: AddressSize::Bits32,
            dummy_cycles: protocol.fast_read_dummy_cycles(),
            data_lines: lines,
            direction: DataDirection::Read,
        }
    }

    /// Persistent fast-read configuration for memory-mapped mode
    ///
    /// Same phases as [`fast_read`](Self::fast_read); the address comes from
    /// each load inside the mapped window.
    pub const fn memory_mapped_read(protocol: Protocol) -> Self {
        let mut cmd = Self::fast_read(protocol, 0);
        cmd.address = None;
        cmd
    }

    /// Encode as a CCR word with the given functional mode
    pub const fn ccr(&self, fmode: u32) -> u32 {
        // A memory-mapped command has no explicit address but still clocks one
        // out on the bus.
        let address_lines = if self.address.is_some() || fmode == ccr::fmode::MEMORY_MAPPED {
            self.address_lines
        } else {
            LineMode::None
        };
        (self.instruction as u32 & ccr::INSTRUCTION_MASK)
            | (self.instruction_lines.bits() << ccr::IMODE_SHIFT)
            | (address_lines.bits() << ccr::ADMODE_SHIFT)
            | (self.address_size.bits() << ccr::ADSIZE_SHIFT)
            | (ccr::mode::NONE << ccr::ABMODE_SHIFT)
            | ((self.dummy_cycles as u32 & ccr::DCYC_MASK) << ccr::DCYC_SHIFT)
            | (self.data_lines.bits() << ccr::DMODE_SHIFT)
            | ((fmode & ccr::FIELD2_MASK) << ccr::FMODE_SHIFT)
    }
}

/// CCR fields decoded back into their parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCcr {
    /// Instruction opcode
    pub instruction: u8,
    /// Instruction phase lines
    pub instruction_lines: LineMode,
    /// Address phase lines
    pub address_lines: LineMode,
    /// Raw ADSIZE field
    pub address_size: u32,
    /// Dummy cycles
    pub dummy_cycles: u8,
    /// Data phase lines
    pub data_lines: LineMode,
    /// Raw FMODE field
    pub fmode: u32,
}

impl DecodedCcr {
    /// Split a CCR word into its fields
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word: u32) -> Self {
        use flashstage_chip::regs::field;
        Self {
            instruction: (word & ccr::INSTRUCTION_MASK) as u8,
            instruction_lines: LineMode::from_bits(field(word, ccr::IMODE_SHIFT, ccr::FIELD2_MASK)),
            address_lines: LineMode::from_bits(field(word, ccr::ADMODE_SHIFT, ccr::FIELD2_MASK)),
            address_size: field(word, ccr::ADSIZE_SHIFT, ccr::FIELD2_MASK),
            dummy_cycles: field(word, ccr::DCYC_SHIFT, ccr::DCYC_MASK) as u8,
            data_lines: LineMode::from_bits(field(word, ccr::DMODE_SHIFT, ccr::FIELD2_MASK)),
            fmode: field(word, ccr::FMODE_SHIFT, ccr::FIELD2_MASK),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qpi_fast_read_is_quad_everywhere_with_six_dummies() {
        let word =
            FlashCommand::fast_read(Protocol::Qpi, 0x000F_0000).ccr(ccr::fmode::INDIRECT_READ);
        let d = DecodedCcr::decode(word);
        assert_eq!(d.instruction, 0x0B);
        assert_eq!(d.instruction_lines, LineMode::Quad);
        assert_eq!(d.address_lines, LineMode::Quad);
        assert_eq!(d.address_size, ccr::size::BITS_32);
        assert_eq!(d.dummy_cycles, 6);
        assert_eq!(d.data_lines, LineMode::Quad);
        assert_eq!(d.fmode, ccr::fmode::INDIRECT_READ);
    }

    #[test]
    fn spi_fast_read_uses_eight_dummies() {
        let d = DecodedCcr::decode(
            FlashCommand::fast_read(Protocol::Spi, 0).ccr(ccr::fmode::INDIRECT_READ),
        );
        assert_eq!(d.instruction_lines, LineMode::Single);
        assert_eq!(d.dummy_cycles, 8);
    }

    #[test]
    fn control_commands_mark_unused_phases_none() {
        let d = DecodedCcr::decode(
            FlashCommand::write_enable(Protocol::Spi).ccr(ccr::fmode::INDIRECT_WRITE),
        );
        assert_eq!(d.instruction, 0x06);
        assert_eq!(d.instruction_lines, LineMode::Single);
        assert_eq!(d.address_lines, LineMode::None);
        assert_eq!(d.data_lines, LineMode::None);
        assert_eq!(d.dummy_cycles, 0);

        let enter = FlashCommand::enter_qpi();
        assert_eq!(enter.instruction, 0x35);
        assert_eq!(enter.instruction_lines, LineMode::Single);
    }

    #[test]
    fn memory_mapped_read_keeps_address_phase() {
        let word = FlashCommand::memory_mapped_read(Protocol::Qpi).ccr(ccr::fmode::MEMORY_MAPPED);
        let d = DecodedCcr::decode(word);
        assert_eq!(d.address_lines, LineMode::Quad);
        assert_eq!(d.fmode, ccr::fmode::MEMORY_MAPPED);
    }
}
