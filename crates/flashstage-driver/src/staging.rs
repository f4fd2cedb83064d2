//! Model and sample staging
//!
//! The model is staged with one of two strategies, fixed per run:
//!
//! - **Owned copy**: one bulk indirect read into a buffer the [`Stager`]
//!   owns, dimensioned once for the worst-case model.
//! - **Memory-mapped**: the controller enters memory-mapped mode and the
//!   blob is a view into the window. The view borrows the controller, so it
//!   cannot outlive a mode switch; the [`MappedRegion`] token it carries is
//!   also checked against the mapping epoch.
//!
//! The sample is always read in indirect mode into a fixed-size array.

use crate::command::FlashCommand;
use crate::config::StagingStrategy;
use crate::controller::{BusMode, FlashController, MappedRegion};
use crate::error::{Result, StageError};
use crate::header::AssetHeader;
use crate::port::QspiPort;
use flashstage_chip::layout;
use tracing::{debug, info};

/// Raw input bytes, `N` fixed at compile time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSample<const N: usize = { layout::SAMPLE_BYTES }>([u8; N]);

impl<const N: usize> InputSample<N> {
    /// Wrap raw bytes
    pub const fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Sample bytes
    pub const fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

/// Widened input handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor<const N: usize = { layout::SAMPLE_BYTES }>([f32; N]);

impl<const N: usize> InputTensor<N> {
    /// Tensor elements
    pub const fn as_slice(&self) -> &[f32; N] {
        &self.0
    }
}

/// Widen every byte to `f32` with identity scaling
///
/// Pure and order-preserving: `tensor[i] == f32::from(sample[i])`. Every
/// `u8` is exactly representable, so no clamping is needed.
pub fn convert_to_tensor<const N: usize>(sample: &InputSample<N>) -> InputTensor<N> {
    InputTensor(std::array::from_fn(|i| f32::from(sample.0[i])))
}

/// Where a staged model's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSource {
    /// Copied into the stager's buffer
    Owned,
    /// View into the memory-mapped window
    Mapped(MappedRegion),
}

/// Staged model bytes
///
/// Borrowed either from the stager or from the controller's window; the
/// borrow keeps the bytes valid for as long as the blob exists.
#[derive(Debug, Clone, Copy)]
pub struct ModelBlob<'a> {
    bytes: &'a [u8],
    source: BlobSource,
}

impl<'a> ModelBlob<'a> {
    /// Wrap model bytes that already live in host memory
    pub const fn owned(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            source: BlobSource::Owned,
        }
    }

    /// Model bytes
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Length in bytes
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for an empty blob (never produced by [`Stager`])
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Where the bytes live
    pub const fn source(&self) -> BlobSource {
        self.source
    }
}

/// Owns the model staging buffer and stages assets from flash
#[derive(Debug)]
pub struct Stager {
    capacity: usize,
    model_buffer: Box<[u8]>,
    strategy: StagingStrategy,
}

impl Stager {
    /// Create a stager that accepts models of up to `max_model_bytes`
    ///
    /// Only [`StagingStrategy::OwnedCopy`] holds a RAM buffer. It is
    /// allocated once here and never resized; a memory-mapped stager
    /// allocates nothing.
    pub fn new(max_model_bytes: usize, strategy: StagingStrategy) -> Self {
        let model_buffer = match strategy {
            StagingStrategy::OwnedCopy => vec![0u8; max_model_bytes].into_boxed_slice(),
            StagingStrategy::MemoryMapped => Box::default(),
        };
        Self {
            capacity: max_model_bytes,
            model_buffer,
            strategy,
        }
    }

    /// Largest model the stager accepts
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of RAM held for owned copies
    pub fn buffered_bytes(&self) -> usize {
        self.model_buffer.len()
    }

    /// Configured strategy
    pub const fn strategy(&self) -> StagingStrategy {
        self.strategy
    }

    /// Stage `length` model bytes at `offset`
    ///
    /// The length is checked against the capacity before any bus activity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeader` if `length` is zero or exceeds the capacity,
    /// plus any controller error.
    pub fn stage_model<'a, P: QspiPort>(
        &'a mut self,
        controller: &'a mut FlashController<P>,
        offset: u32,
        length: u32,
    ) -> Result<ModelBlob<'a>> {
        let len = length as usize;
        if length == 0 || len > self.capacity() {
            return Err(StageError::InvalidHeader {
                offset,
                length,
                capacity: self.capacity(),
            });
        }

        match self.strategy {
            StagingStrategy::OwnedCopy => {
                controller.enter_mode(BusMode::Indirect)?;
                let command = FlashCommand::fast_read(controller.protocol(), offset);
                controller.read(&command, &mut self.model_buffer, len)?;
                info!("Model staged: {len} bytes copied from {offset:#010x}");
                Ok(ModelBlob {
                    bytes: &self.model_buffer[..len],
                    source: BlobSource::Owned,
                })
            }
            StagingStrategy::MemoryMapped => {
                controller.enter_mode(BusMode::MemoryMapped)?;
                let controller: &'a FlashController<P> = controller;
                let region = controller.map_region(offset, len)?;
                let bytes = controller.mapped_bytes(&region)?;
                info!(
                    "Model staged: {len} bytes mapped at {offset:#010x} (epoch {})",
                    region.epoch()
                );
                Ok(ModelBlob {
                    bytes,
                    source: BlobSource::Mapped(region),
                })
            }
        }
    }

    /// Stage the model a header describes
    ///
    /// # Errors
    ///
    /// See [`stage_model`](Self::stage_model).
    pub fn stage_from_header<'a, P: QspiPort>(
        &'a mut self,
        controller: &'a mut FlashController<P>,
        header: &AssetHeader,
    ) -> Result<ModelBlob<'a>> {
        self.stage_model(controller, header.blob_offset()?, header.length)
    }

    /// Read an `N`-byte sample at `offset` in indirect mode
    ///
    /// Switching to indirect mode ends any memory-mapped session.
    ///
    /// # Errors
    ///
    /// Returns any controller error.
    pub fn stage_sample<P: QspiPort, const N: usize>(
        controller: &mut FlashController<P>,
        offset: u32,
    ) -> Result<InputSample<N>> {
        controller.enter_mode(BusMode::Indirect)?;
        let mut bytes = [0u8; N];
        let command = FlashCommand::fast_read(controller.protocol(), offset);
        controller.read(&command, &mut bytes, N)?;
        debug!("Sample staged: {N} bytes from {offset:#010x}");
        Ok(InputSample(bytes))
    }
}

/// Copy a tensor into an engine-provided buffer of exactly matching length
///
/// # Errors
///
/// Returns `SizeMismatch` if the lengths differ.
pub(crate) fn copy_tensor<const N: usize>(tensor: &InputTensor<N>, dest: &mut [f32]) -> Result<()> {
    if dest.len() != N {
        return Err(StageError::size_mismatch(N, dest.len()));
    }
    dest.copy_from_slice(&tensor.0);
    Ok(())
}
