//! Serial NOR device model: ISSI IS25LP128F (128 Mbit, 16 MiB).
//!
//! Only the commands the staging pipeline issues are listed. Dummy-cycle
//! counts are the power-on defaults from the datasheet (§8.7 fast read,
//! §8.21 QPI mode): the read-parameter register is never reprogrammed here.
//!
//! ```text
//! Command          Opcode  SPI (1-1-1)        QPI (4-4-4)
//! ──────────────── ─────── ────────────────── ──────────────────
//! Write enable     0x06    1-line, no data    4-line, no data
//! Enter QPI        0x35    1-line, no data    (already in QPI)
//! Exit QPI         0xF5    (not in QPI)       4-line, no data
//! Fast read        0x0B    8 dummy cycles     6 dummy cycles
//! ```

/// Set the write-enable latch (WEL).
pub const CMD_WRITE_ENABLE: u8 = 0x06;
/// Switch the device to QPI protocol (every phase on four lines).
pub const CMD_ENTER_QPI: u8 = 0x35;
/// Return the device to SPI protocol.
pub const CMD_EXIT_QPI: u8 = 0xF5;
/// Fast read with dummy cycles.
pub const CMD_FAST_READ: u8 = 0x0B;

/// Fast-read dummy cycles while the device speaks SPI.
pub const FAST_READ_DUMMY_SPI: u8 = 8;
/// Fast-read dummy cycles while the device speaks QPI.
pub const FAST_READ_DUMMY_QPI: u8 = 6;

/// Device capacity in bytes (16 MiB).
pub const CAPACITY_BYTES: usize = 16 * 1024 * 1024;

/// `DCR.FSIZE` value that addresses the whole device: 2^(23 + 1) = 16 MiB.
pub const FSIZE_EXPONENT: u8 = 23;

/// Value of erased (never programmed) flash bytes.
pub const ERASED_BYTE: u8 = 0xFF;

/// Page program granularity.
pub const PAGE_SIZE: usize = 256;

/// Protocol the device currently decodes instructions in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Standard SPI: instructions on one line.
    Spi,
    /// Quad peripheral interface: instruction, address and data on four lines.
    Qpi,
}

impl Protocol {
    /// Dummy cycles the device inserts before fast-read data in this protocol.
    #[must_use]
    pub const fn fast_read_dummy_cycles(self) -> u8 {
        match self {
            Self::Spi => FAST_READ_DUMMY_SPI,
            Self::Qpi => FAST_READ_DUMMY_QPI,
        }
    }
}

/// Addressable bytes for a `DCR.FSIZE` exponent: 2^(exponent + 1).
///
/// Exponents above 31 saturate to the 32-bit address space.
#[must_use]
pub const fn addressable_bytes(fsize_exponent: u8) -> u64 {
    if fsize_exponent >= 31 {
        1u64 << 32
    } else {
        1u64 << (fsize_exponent as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsize_exponent_matches_capacity() {
        assert_eq!(addressable_bytes(FSIZE_EXPONENT), CAPACITY_BYTES as u64);
        assert_eq!(addressable_bytes(0), 2);
        assert_eq!(addressable_bytes(31), 1 << 32);
    }

    #[test]
    fn qpi_fast_read_uses_fewer_dummy_cycles() {
        assert_eq!(Protocol::Qpi.fast_read_dummy_cycles(), 6);
        assert_eq!(Protocol::Spi.fast_read_dummy_cycles(), 8);
    }
}
