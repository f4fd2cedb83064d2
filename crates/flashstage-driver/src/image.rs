//! In-memory image of the serial NOR device
//!
//! Used to build the flash contents the pipeline expects (header, model,
//! sample) and to back the emulated port. Unwritten bytes keep the erased
//! value `0xFF`.

use crate::config::FlashLayout;
use crate::error::{Result, StageError};
use crate::header::AssetHeader;
use bytes::{Bytes, BytesMut};
use flashstage_chip::{layout, nor};
use std::path::Path;
use tracing::{debug, info};

/// Flash image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    data: BytesMut,
    /// Byte ranges already written by a builder, for overlap checks
    written: Vec<(usize, usize)>,
}

impl FlashImage {
    /// Erased image sized for a `DCR.FSIZE` exponent
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the size does not fit host memory.
    pub fn erased(flash_size_exponent: u8) -> Result<Self> {
        let size = usize::try_from(nor::addressable_bytes(flash_size_exponent)).map_err(|_| {
            StageError::invalid_state(format!(
                "flash size exponent {flash_size_exponent} too large for host"
            ))
        })?;
        Ok(Self::with_len(size))
    }

    /// Erased image of exactly `len` bytes
    pub fn with_len(len: usize) -> Self {
        let mut data = BytesMut::with_capacity(len);
        data.resize(len, nor::ERASED_BYTE);
        Self {
            data,
            written: Vec::new(),
        }
    }

    /// Wrap raw device contents
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            written: Vec::new(),
        }
    }

    /// Write the length header and the model blob
    ///
    /// # Errors
    ///
    /// Returns error if the model is empty, does not fit, or overlaps data
    /// already placed in the image.
    pub fn with_model(mut self, layout: &FlashLayout, model: &[u8]) -> Result<Self> {
        let length = u32::try_from(model.len())
            .ok()
            .filter(|&l| l > 0)
            .ok_or(StageError::InvalidHeader {
                offset: layout.header_offset,
                length: 0,
                capacity: self.len(),
            })?;
        let model_offset = layout.model_offset()?;
        self.place(layout.header_offset, &layout::encode_header(length))?;
        self.place(model_offset, model)?;
        info!("Placed {} byte model at {model_offset:#010x}", model.len());
        Ok(self)
    }

    /// Write the raw input sample
    ///
    /// # Errors
    ///
    /// Returns error if the sample does not fit or overlaps data already
    /// placed in the image.
    pub fn with_sample(mut self, layout: &FlashLayout, sample: &[u8]) -> Result<Self> {
        self.place(layout.sample_offset, sample)?;
        info!(
            "Placed {} byte sample at {:#010x}",
            sample.len(),
            layout.sample_offset
        );
        Ok(self)
    }

    /// Write raw bytes at `offset`, bypassing overlap tracking
    ///
    /// # Errors
    ///
    /// Returns `AddressOutOfRange` if the bytes do not fit.
    pub fn write_at(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = self.checked_end(offset, bytes.len())?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn place(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = self.checked_end(offset, bytes.len())?;
        if let Some(&(s, e)) = self
            .written
            .iter()
            .find(|&&(s, e)| start < e && s < end)
        {
            return Err(StageError::invalid_state(format!(
                "range {start:#x}..{end:#x} overlaps {s:#x}..{e:#x}"
            )));
        }
        self.data[start..end].copy_from_slice(bytes);
        self.written.push((start, end));
        debug!("Image write {start:#x}..{end:#x}");
        Ok(())
    }

    fn checked_end(&self, offset: u32, len: usize) -> Result<usize> {
        (offset as usize)
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(StageError::AddressOutOfRange {
                address: offset,
                length: len,
                limit: self.data.len() as u64,
            })
    }

    /// Decode the length header at the layout's header offset
    ///
    /// # Errors
    ///
    /// Returns `AddressOutOfRange` if the header lies outside the image.
    pub fn decode_header(&self, layout: &FlashLayout) -> Result<AssetHeader> {
        let bytes = self.slice(layout.header_offset, layout::HEADER_LEN)?;
        let mut raw = [0u8; layout::HEADER_LEN];
        raw.copy_from_slice(bytes);
        Ok(AssetHeader::decode(layout.header_offset, raw))
    }

    /// Borrow `len` bytes at `offset`
    ///
    /// # Errors
    ///
    /// Returns `AddressOutOfRange` if the range lies outside the image.
    pub fn slice(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&self.data[offset as usize..end])
    }

    /// Load an image from a file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        debug!("Loaded {} byte image from {}", bytes.len(), path.display());
        Ok(Self::from_bytes(&bytes))
    }

    /// Save the image to a file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    /// Image size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length image
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Image contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Freeze into shared immutable bytes
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> FlashLayout {
        FlashLayout::new(0x1000, 0x0004)
    }

    #[test]
    fn erased_image_reads_ff() {
        let image = FlashImage::erased(11).unwrap();
        assert_eq!(image.len(), 4096);
        assert!(image.as_bytes().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn with_model_writes_big_endian_header_then_blob() {
        let layout = small_layout();
        let model = vec![0xAB; 256];
        let image = FlashImage::with_len(0x2000)
            .with_model(&layout, &model)
            .unwrap();
        assert_eq!(image.slice(0x1000, 4).unwrap(), &[0x00, 0x00, 0x01, 0x00]);
        assert_eq!(image.slice(0x1004, 256).unwrap(), model.as_slice());
        assert_eq!(image.decode_header(&layout).unwrap().length, 256);
    }

    #[test]
    fn overlapping_placements_are_rejected() {
        let layout = FlashLayout::new(0x0100, 0x0104);
        let result = FlashImage::with_len(0x1000)
            .with_model(&layout, &[1, 2, 3, 4])
            .and_then(|img| img.with_sample(&layout, &[0; 16]));
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_placement_is_rejected() {
        let layout = FlashLayout::new(0x0FFE, 0x0004);
        let err = FlashImage::with_len(0x1000)
            .with_model(&layout, &[1, 2, 3])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AddressOutOfRange);
    }

    #[test]
    fn empty_model_is_rejected() {
        let err = FlashImage::with_len(0x2000)
            .with_model(&small_layout(), &[])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidHeader);
    }

    #[test]
    fn save_and_load_preserve_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.bin");
        let image = FlashImage::with_len(0x2000)
            .with_sample(&small_layout(), &[7; 32])
            .unwrap();
        image.save(&path).unwrap();
        let loaded = FlashImage::load(&path).unwrap();
        assert_eq!(loaded.as_bytes(), image.as_bytes());
    }
}
