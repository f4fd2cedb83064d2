//! Staging pipeline
//!
//! One context object owns the bus, the staging buffer, the engine and the
//! transport. Steps run in strict order, each depending on the bus mode or
//! buffer contents the previous one left:
//!
//! ```text
//! boot():     configure → enter Indirect (unlock) → read header → stage model → engine init
//! run_once(): stage sample (Indirect) → convert → bind → invoke → read output → report
//! ```
//!
//! The engine is initialized while the staged model is still borrowed, so a
//! memory-mapped model is consumed before the sample read ends the mapping.
//! Any error is terminal: [`Pipeline::run`] reports its kind over the
//! transport and stops. Bus faults are never retried.

use crate::config::PipelineConfig;
use crate::controller::{BusMode, FlashController};
use crate::engine::InferenceEngine;
use crate::error::{Result, StageError};
use crate::header::{read_header, AssetHeader};
use crate::inference::InferenceDriver;
use crate::port::QspiPort;
use crate::report::ResultReporter;
use crate::staging::{convert_to_tensor, InputSample, Stager};
use flashstage_chip::layout;
use std::io::Write;
use tracing::{info, warn};

/// Owned pipeline context
#[derive(Debug)]
pub struct Pipeline<P: QspiPort, E: InferenceEngine, W: Write> {
    config: PipelineConfig,
    controller: FlashController<P>,
    stager: Stager,
    driver: InferenceDriver<E>,
    reporter: ResultReporter<W>,
    header: Option<AssetHeader>,
}

impl<P: QspiPort, E: InferenceEngine, W: Write> Pipeline<P, E, W> {
    /// Assemble a pipeline; nothing touches the bus until [`boot`](Self::boot)
    pub fn new(config: PipelineConfig, port: P, engine: E, transport: W) -> Self {
        Self {
            controller: FlashController::new(port),
            stager: Stager::new(config.max_model_bytes, config.strategy),
            driver: InferenceDriver::new(engine).with_invoke_retry(config.retry_idempotent_invoke),
            reporter: ResultReporter::new(transport, config.report_format),
            header: None,
            config,
        }
    }

    /// Bring up the bus, stage the model and initialize the engine
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error; nothing after it runs.
    pub fn boot(&mut self) -> Result<AssetHeader> {
        if self.header.is_some() {
            return Err(StageError::invalid_state("pipeline already booted"));
        }
        self.controller.configure(self.config.bus)?;
        self.controller.enter_mode(BusMode::Indirect)?;

        let header = read_header(
            &mut self.controller,
            self.config.layout.header_offset,
            self.stager.capacity(),
        )?;

        let blob = self.stager.stage_from_header(&mut self.controller, &header)?;
        self.driver.initialize(&blob)?;

        self.header = Some(header);
        info!("✅ Boot complete: {} byte model", header.length);
        Ok(header)
    }

    /// Stage one sample, run inference and report the output
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before [`boot`](Self::boot), otherwise the
    /// first failing step's error.
    pub fn run_once(&mut self) -> Result<()> {
        if self.header.is_none() {
            return Err(StageError::invalid_state("pipeline not booted"));
        }
        let sample: InputSample = Stager::stage_sample::<P, { layout::SAMPLE_BYTES }>(
            &mut self.controller,
            self.config.layout.sample_offset,
        )?;
        let tensor = convert_to_tensor(&sample);
        self.driver.bind_input(&tensor)?;
        self.driver.invoke()?;

        let output = self.driver.read_output()?;
        let expected = self.config.output_len;
        if output.len() < expected {
            return Err(StageError::size_mismatch(expected, output.len()));
        }
        self.reporter.report(&output.as_slice()[..expected])?;
        if let Some(class) = output.argmax() {
            info!("Inference done, top class {class}");
        }
        Ok(())
    }

    /// [`boot`](Self::boot) then [`run_once`](Self::run_once), reporting
    /// the error kind over the transport on failure
    ///
    /// # Errors
    ///
    /// Returns the error that halted the run.
    pub fn run(&mut self) -> Result<()> {
        let outcome = self.boot().and_then(|_| self.run_once());
        if let Err(err) = &outcome {
            if let Err(report_err) = self.reporter.report_error(err.kind()) {
                warn!("Could not report {}: {report_err}", err.kind());
            }
        }
        outcome
    }

    /// Header decoded at boot
    pub const fn header(&self) -> Option<AssetHeader> {
        self.header
    }

    /// Borrow the controller
    pub const fn controller(&self) -> &FlashController<P> {
        &self.controller
    }

    /// Borrow the controller mutably
    pub fn controller_mut(&mut self) -> &mut FlashController<P> {
        &mut self.controller
    }

    /// Borrow the inference driver
    pub const fn driver(&self) -> &InferenceDriver<E> {
        &self.driver
    }

    /// Borrow the reporter
    pub const fn reporter(&self) -> &ResultReporter<W> {
        &self.reporter
    }

    /// Take the pipeline apart
    pub fn into_parts(self) -> (FlashController<P>, InferenceDriver<E>, W) {
        (self.controller, self.driver, self.reporter.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::engines::{pack_dense_model, Activation, DenseEngine};
    use crate::error::ErrorKind;
    use crate::image::FlashImage;
    use crate::ports::EmulatedQspi;

    const FSIZE: u8 = 20;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_bus(BusConfig::default().with_flash_size_exponent(FSIZE))
            .with_output_len(2)
    }

    fn port(sample: &[u8]) -> EmulatedQspi {
        let mut weights = vec![0.0; 2 * layout::SAMPLE_BYTES];
        weights[..layout::SAMPLE_BYTES].fill(1.0);
        let model = pack_dense_model(
            layout::SAMPLE_BYTES,
            2,
            Activation::Identity,
            &weights,
            &[0.0, 0.5],
        );
        let layout = config().layout;
        let image = FlashImage::erased(FSIZE)
            .unwrap()
            .with_model(&layout, &model)
            .unwrap()
            .with_sample(&layout, sample)
            .unwrap();
        EmulatedQspi::new(image)
    }

    #[test]
    fn run_reports_engine_output() {
        let mut pipeline =
            Pipeline::new(config(), port(&[1u8; 1024]), DenseEngine::new(), Vec::new());
        pipeline.run().unwrap();
        let (_, driver, out) = pipeline.into_parts();
        assert_eq!(driver.invocations(), 1);
        assert_eq!(String::from_utf8(out).unwrap(), "1024.000000\n0.500000\n");
    }

    #[test]
    fn run_once_needs_boot() {
        let mut pipeline =
            Pipeline::new(config(), port(&[0u8; 1024]), DenseEngine::new(), Vec::new());
        let err = pipeline.run_once().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(pipeline.controller().port().commands().is_empty());
    }

    #[test]
    fn boot_runs_once() {
        let mut pipeline =
            Pipeline::new(config(), port(&[0u8; 1024]), DenseEngine::new(), Vec::new());
        let header = pipeline.boot().unwrap();
        assert_eq!(pipeline.header(), Some(header));
        assert_eq!(pipeline.boot().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn run_once_repeats_after_boot() {
        let mut pipeline =
            Pipeline::new(config(), port(&[2u8; 1024]), DenseEngine::new(), Vec::new());
        pipeline.boot().unwrap();
        pipeline.run_once().unwrap();
        pipeline.run_once().unwrap();
        assert_eq!(pipeline.driver().invocations(), 2);
    }

    #[test]
    fn short_output_is_a_size_mismatch() {
        let config = config().with_output_len(3);
        let mut pipeline =
            Pipeline::new(config, port(&[0u8; 1024]), DenseEngine::new(), Vec::new());
        let err = pipeline.run().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeMismatch);
        assert_eq!(pipeline.reporter().transport().as_slice(), b"error: SizeMismatch\n");
    }
}
