//! QUADSPI register map.
//!
//! Offsets and field positions follow the STM32 QUADSPI block (RM0351 §17,
//! RM0433 §23). The same block is present on STM32L4/F7/H7 parts and on the
//! Linux-hosted STM32MP1.
//!
//! ```text
//! 0x00 CR     control: enable, abort, FIFO threshold, flash select, prescaler
//! 0x04 DCR    device config: clock mode, CS high time, flash size
//! 0x08 SR     status: TEF, TCF, FTF, SMF, TOF, BUSY, FLEVEL
//! 0x0C FCR    flag clear
//! 0x10 DLR    data length - 1
//! 0x14 CCR    communication config (one command descriptor)
//! 0x18 AR     address (writing it starts an indirect transfer)
//! 0x1C ABR    alternate bytes
//! 0x20 DR     data FIFO
//! ```

// ── Register offsets ─────────────────────────────────────────────────────────

/// Control register.
pub const CR: usize = 0x00;
/// Device configuration register.
pub const DCR: usize = 0x04;
/// Status register.
pub const SR: usize = 0x08;
/// Flag clear register.
pub const FCR: usize = 0x0C;
/// Data length register (number of bytes minus one).
pub const DLR: usize = 0x10;
/// Communication configuration register.
pub const CCR: usize = 0x14;
/// Address register.
pub const AR: usize = 0x18;
/// Alternate bytes register.
pub const ABR: usize = 0x1C;
/// Data register (FIFO window, byte or word access).
pub const DR: usize = 0x20;
/// Low-power timeout register.
pub const LPTR: usize = 0x30;

/// Size of the register block in bytes.
pub const BLOCK_SIZE: usize = 0x400;

/// Depth of the controller data FIFO in bytes.
pub const FIFO_DEPTH: usize = 16;

// ── CR bit fields ────────────────────────────────────────────────────────────

/// Control register fields.
pub mod cr {
    /// Peripheral enable.
    pub const EN: u32 = 1 << 0;
    /// Abort request; hardware clears it once the abort completes.
    pub const ABORT: u32 = 1 << 1;
    /// Flash memory selection (0 = FLASH1, 1 = FLASH2).
    pub const FSEL: u32 = 1 << 7;
    /// FIFO threshold level field position.
    pub const FTHRES_SHIFT: u32 = 8;
    /// FIFO threshold level field mask (after shifting).
    pub const FTHRES_MASK: u32 = 0x0F;
    /// Clock prescaler field position.
    pub const PRESCALER_SHIFT: u32 = 24;
    /// Clock prescaler field mask (after shifting).
    pub const PRESCALER_MASK: u32 = 0xFF;
}

// ── DCR bit fields ───────────────────────────────────────────────────────────

/// Device configuration register fields.
pub mod dcr {
    /// Clock mode 3 when set, mode 0 when clear.
    pub const CKMODE: u32 = 1 << 0;
    /// Chip-select high time field position.
    pub const CSHT_SHIFT: u32 = 8;
    /// Chip-select high time field mask (after shifting).
    pub const CSHT_MASK: u32 = 0x07;
    /// Flash size field position. Addressable bytes = 2^(FSIZE + 1).
    pub const FSIZE_SHIFT: u32 = 16;
    /// Flash size field mask (after shifting).
    pub const FSIZE_MASK: u32 = 0x1F;
}

// ── SR bit fields ────────────────────────────────────────────────────────────

/// Status register fields.
pub mod sr {
    /// Transfer error flag.
    pub const TEF: u32 = 1 << 0;
    /// Transfer complete flag.
    pub const TCF: u32 = 1 << 1;
    /// FIFO threshold flag.
    pub const FTF: u32 = 1 << 2;
    /// Status match flag.
    pub const SMF: u32 = 1 << 3;
    /// Timeout flag.
    pub const TOF: u32 = 1 << 4;
    /// Busy: an operation is in progress (stays set in memory-mapped mode).
    pub const BUSY: u32 = 1 << 5;
    /// FIFO level field position.
    pub const FLEVEL_SHIFT: u32 = 8;
    /// FIFO level field mask (after shifting).
    pub const FLEVEL_MASK: u32 = 0x1F;
}

// ── FCR bit fields ───────────────────────────────────────────────────────────

/// Flag clear register fields.
pub mod fcr {
    /// Clear transfer error flag.
    pub const CTEF: u32 = 1 << 0;
    /// Clear transfer complete flag.
    pub const CTCF: u32 = 1 << 1;
    /// Clear status match flag.
    pub const CSMF: u32 = 1 << 3;
    /// Clear timeout flag.
    pub const CTOF: u32 = 1 << 4;
    /// All clearable flags.
    pub const ALL: u32 = CTEF | CTCF | CSMF | CTOF;
}

// ── CCR bit fields ───────────────────────────────────────────────────────────

/// Communication configuration register fields.
pub mod ccr {
    /// Instruction opcode field mask (bits 7:0).
    pub const INSTRUCTION_MASK: u32 = 0xFF;
    /// Instruction line mode field position.
    pub const IMODE_SHIFT: u32 = 8;
    /// Address line mode field position.
    pub const ADMODE_SHIFT: u32 = 10;
    /// Address size field position.
    pub const ADSIZE_SHIFT: u32 = 12;
    /// Alternate bytes line mode field position.
    pub const ABMODE_SHIFT: u32 = 14;
    /// Alternate bytes size field position.
    pub const ABSIZE_SHIFT: u32 = 16;
    /// Dummy cycle count field position.
    pub const DCYC_SHIFT: u32 = 18;
    /// Dummy cycle count field mask (after shifting).
    pub const DCYC_MASK: u32 = 0x1F;
    /// Data line mode field position.
    pub const DMODE_SHIFT: u32 = 24;
    /// Functional mode field position.
    pub const FMODE_SHIFT: u32 = 26;
    /// Mask for every two-bit mode/size field (after shifting).
    pub const FIELD2_MASK: u32 = 0x03;

    /// Line mode field values (IMODE, ADMODE, ABMODE, DMODE).
    pub mod mode {
        /// Phase skipped.
        pub const NONE: u32 = 0b00;
        /// Single line.
        pub const SINGLE: u32 = 0b01;
        /// Two lines.
        pub const DUAL: u32 = 0b10;
        /// Four lines.
        pub const QUAD: u32 = 0b11;
    }

    /// Address size field values (ADSIZE).
    pub mod size {
        /// 8-bit address.
        pub const BITS_8: u32 = 0b00;
        /// 16-bit address.
        pub const BITS_16: u32 = 0b01;
        /// 24-bit address.
        pub const BITS_24: u32 = 0b10;
        /// 32-bit address.
        pub const BITS_32: u32 = 0b11;
    }

    /// Functional mode field values (FMODE).
    pub mod fmode {
        /// Indirect write.
        pub const INDIRECT_WRITE: u32 = 0b00;
        /// Indirect read.
        pub const INDIRECT_READ: u32 = 0b01;
        /// Automatic status polling.
        pub const AUTO_POLLING: u32 = 0b10;
        /// Memory-mapped.
        pub const MEMORY_MAPPED: u32 = 0b11;
    }
}

/// Extract a field from a register value.
#[must_use]
pub const fn field(value: u32, shift: u32, mask: u32) -> u32 {
    (value >> shift) & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_are_word_aligned_and_distinct() {
        let offsets = [CR, DCR, SR, FCR, DLR, CCR, AR, ABR, DR, LPTR];
        for (i, a) in offsets.iter().enumerate() {
            assert_eq!(a % 4, 0);
            for b in &offsets[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(LPTR < BLOCK_SIZE);
    }

    #[test]
    fn field_extracts_ccr_fmode() {
        let ccr_word = (ccr::fmode::MEMORY_MAPPED << ccr::FMODE_SHIFT) | 0x0B;
        assert_eq!(
            field(ccr_word, ccr::FMODE_SHIFT, ccr::FIELD2_MASK),
            ccr::fmode::MEMORY_MAPPED
        );
        assert_eq!(ccr_word & ccr::INSTRUCTION_MASK, 0x0B);
    }
}
