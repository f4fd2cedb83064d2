//! Asset header reader
//!
//! The header is a bare 4-byte big-endian length with no magic or checksum,
//! so the only defence against a corrupted or erased header is a bound on
//! the length it declares. Erased flash (`FF FF FF FF`) decodes to
//! 4 294 967 295 and is rejected by that bound.

use crate::command::FlashCommand;
use crate::controller::FlashController;
use crate::error::{Result, StageError};
use crate::port::QspiPort;
use flashstage_chip::layout;
use tracing::info;

/// Decoded length header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetHeader {
    /// Flash offset the header was read from
    pub offset: u32,
    /// Declared blob length in bytes
    pub length: u32,
}

impl AssetHeader {
    /// Decode raw header bytes read at `offset`
    pub const fn decode(offset: u32, bytes: [u8; layout::HEADER_LEN]) -> Self {
        Self {
            offset,
            length: layout::decode_header(bytes),
        }
    }

    /// Offset of the blob the header describes
    ///
    /// # Errors
    ///
    /// Returns `AddressOutOfRange` if the blob would start past the 32-bit
    /// address space.
    pub const fn blob_offset(&self) -> Result<u32> {
        match layout::model_offset(self.offset) {
            Some(offset) => Ok(offset),
            None => Err(StageError::header_past_address_space(self.offset)),
        }
    }

    /// Declared length as a buffer size
    pub const fn len(&self) -> usize {
        self.length as usize
    }

    /// True when the header declares an empty blob
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Check the declared length is plausible for a destination of `capacity` bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeader` if the length is zero or exceeds `capacity`,
    /// and `AddressOutOfRange` if the blob has no 32-bit start offset.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        if self.is_empty() || self.len() > capacity {
            return Err(StageError::InvalidHeader {
                offset: self.offset,
                length: self.length,
                capacity,
            });
        }
        self.blob_offset()?;
        Ok(())
    }
}

/// Read and validate the header at `offset`
///
/// One 4-byte fast read in indirect mode; the controller must already be in
/// that mode.
///
/// # Errors
///
/// Returns `InvalidHeader` for an implausible length, `AddressOutOfRange`
/// when the blob cannot follow the header, plus any bus error from the read.
pub fn read_header<P: QspiPort>(
    controller: &mut FlashController<P>,
    offset: u32,
    capacity: usize,
) -> Result<AssetHeader> {
    let mut raw = [0u8; layout::HEADER_LEN];
    let command = FlashCommand::fast_read(controller.protocol(), offset);
    controller.read(&command, &mut raw, layout::HEADER_LEN)?;

    let header = AssetHeader::decode(offset, raw);
    header.validate(capacity)?;
    info!(
        "Header @ {offset:#010x}: {} byte blob at {:#010x}",
        header.length,
        header.blob_offset()?
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_big_endian_length() {
        let header = AssetHeader::decode(0xF0000, [0x00, 0x00, 0x01, 0x00]);
        assert_eq!(header.length, 256);
        assert_eq!(header.blob_offset().unwrap(), 0xF0004);
        assert!(header.validate(256).is_ok());
    }

    #[test]
    fn zero_and_oversized_lengths_are_invalid() {
        let zero = AssetHeader::decode(0, [0; 4]);
        assert!(matches!(
            zero.validate(1024),
            Err(StageError::InvalidHeader { length: 0, .. })
        ));

        let erased = AssetHeader::decode(0, [0xFF; 4]);
        assert!(matches!(
            erased.validate(262_144),
            Err(StageError::InvalidHeader { length: u32::MAX, capacity: 262_144, .. })
        ));

        let one_over = AssetHeader::decode(0, 1025u32.to_be_bytes());
        assert!(one_over.validate(1024).is_err());
    }

    #[test]
    fn header_in_last_word_has_no_blob() {
        let header = AssetHeader::decode(0xFFFF_FFFC, [0x00, 0x00, 0x01, 0x00]);
        let err = header.blob_offset().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AddressOutOfRange);
        assert!(matches!(
            err,
            StageError::AddressOutOfRange {
                address: 0xFFFF_FFFC,
                length: 4,
                limit: 0x1_0000_0000,
            }
        ));
        assert!(matches!(
            header.validate(262_144),
            Err(StageError::AddressOutOfRange { .. })
        ));

        let last = AssetHeader::decode(0xFFFF_FFFB, [0x00, 0x00, 0x00, 0x01]);
        assert_eq!(last.blob_offset().unwrap(), 0xFFFF_FFFF);
    }
}
