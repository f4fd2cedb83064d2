//! Asset layout written into flash.
//!
//! ```text
//! Offset              Size     Contents
//! ─────────────────── ──────── ─────────────────────────────────────
//! SAMPLE_OFFSET       1024 B   Raw input sample (32×32 grayscale)
//! HEADER_OFFSET       4 B      Model length, big-endian u32
//! HEADER_OFFSET + 4   length   Model blob
//! ```
//!
//! The header carries no magic number or checksum: its only job is to say
//! how many bytes follow.

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Default offset of the model length header.
pub const HEADER_OFFSET: u32 = 0x000F_0000;

/// Default offset of the raw input sample.
pub const SAMPLE_OFFSET: u32 = 0x0000_0004;

/// Side of the square input image.
pub const SAMPLE_SIDE: usize = 32;

/// Raw input sample size in bytes (one byte per pixel).
pub const SAMPLE_BYTES: usize = SAMPLE_SIDE * SAMPLE_SIDE;

/// Number of class scores the model produces.
pub const OUTPUT_LEN: usize = 10;

/// Size of the LeNet-5 model the layout was sized for.
pub const REFERENCE_MODEL_BYTES: usize = 251_388;

/// Worst-case model size the staging buffer is dimensioned for.
pub const MAX_MODEL_BYTES: usize = 256 * 1024;

/// Offset of the model blob that follows a header at `header_offset`.
///
/// `None` when the header sits in the last four bytes of a 32-bit address
/// space and the blob would start past it.
#[must_use]
pub const fn model_offset(header_offset: u32) -> Option<u32> {
    header_offset.checked_add(HEADER_LEN as u32)
}

/// Encode a model length as the on-flash header.
#[must_use]
pub const fn encode_header(length: u32) -> [u8; HEADER_LEN] {
    length.to_be_bytes()
}

/// Decode the on-flash header into a model length.
#[must_use]
pub const fn decode_header(bytes: [u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(bytes)
}
