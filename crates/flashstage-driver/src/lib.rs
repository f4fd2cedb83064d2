//! Flash-to-inference staging pipeline for QUADSPI-attached serial NOR.
//!
//! Brings a QUADSPI controller up, unlocks the NOR device into quad mode,
//! reads a length-prefixed model blob and a fixed-size input sample out of
//! flash, hands both to an inference engine and writes the output vector
//! to a byte transport.
//!
//! # Port hierarchy
//!
//! ```text
//! Hardware:
//!   MmioQspi     : QUADSPI registers + memory-mapped window via /dev/mem
//!
//! Host:
//!   EmulatedQspi : register-level controller + NOR device over a FlashImage
//! ```
//!
//! Everything above [`QspiPort`] (controller, stager, driver, reporter) is
//! identical for both.
//!
//! # Quick start
//!
//! ```no_run
//! use flashstage_driver::prelude::*;
//! use flashstage_driver::{pack_dense_model, Activation, DenseEngine, EmulatedQspi};
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default().with_output_len(1);
//! let model = pack_dense_model(1024, 1, Activation::Identity, &[1.0; 1024], &[0.0]);
//! let image = FlashImage::erased(config.bus.flash_size_exponent)?
//!     .with_model(&config.layout, &model)?
//!     .with_sample(&config.layout, &[0u8; 1024])?;
//!
//! let mut out = Vec::new();
//! let port = EmulatedQspi::new(image);
//! let mut pipeline = Pipeline::new(config, port, DenseEngine::new(), &mut out);
//! pipeline.run()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod command;
mod config;
mod controller;
mod engine;
pub mod engines;
mod error;
mod header;
mod image;
mod inference;
mod pipeline;
mod port;
pub mod ports;
mod report;
mod staging;

/// Silicon constants (re-exported from flashstage-chip).
pub mod chip {
    pub use flashstage_chip::{layout, memmap, nor, regs};
}

pub use command::{AddressSize, DataDirection, DecodedCcr, FlashCommand, LineMode};
pub use config::{
    BusConfig, BusWidth, FlashLayout, FlashSelect, PipelineConfig, ReportFormat, StagingStrategy,
};
pub use controller::{BusMode, FlashController, MappedRegion};
pub use engine::{EngineFault, InferenceEngine};
pub use engines::{pack_dense_model, Activation, DenseEngine, DENSE_MAGIC};
pub use error::{ErrorKind, Result, StageError};
pub use header::{read_header, AssetHeader};
pub use image::FlashImage;
pub use inference::{DriverState, InferenceDriver, OutputVector};
pub use pipeline::Pipeline;
pub use port::{open_port, PortSelection, PortType, QspiPort};
pub use ports::{CommandRecord, EmulatedQspi};
#[cfg(unix)]
pub use ports::MmioQspi;
pub use report::{write_sample_grid, ResultReporter};
pub use staging::{convert_to_tensor, BlobSource, InputSample, InputTensor, ModelBlob, Stager};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AssetHeader, BusConfig, BusMode, BusWidth, ErrorKind, FlashController, FlashImage,
        FlashLayout, InferenceEngine, Pipeline, PipelineConfig, QspiPort, ReportFormat, Result,
        StageError, StagingStrategy,
    };
}
