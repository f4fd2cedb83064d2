//! End-to-end staging tests against the emulated port
//!
//! Every test builds a flash image, runs the pipeline (or the controller
//! directly) over `EmulatedQspi` and inspects the command log.

use flashstage_driver::chip::{layout, nor};
use flashstage_driver::prelude::*;
use flashstage_driver::{
    pack_dense_model, Activation, DenseEngine, EmulatedQspi, EngineFault, MappedRegion,
};

/// 2 MiB device: large enough for the default header offset
const FSIZE: u8 = 20;

/// Keeps everything it is given so tests can compare against flash contents
#[derive(Debug, Default)]
struct RecordingEngine {
    model: Vec<u8>,
    input: Vec<f32>,
    output: Vec<f32>,
    reject: bool,
    invokes: u32,
}

impl RecordingEngine {
    fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }
}

impl InferenceEngine for RecordingEngine {
    fn init(&mut self, model: &[u8]) -> std::result::Result<(), EngineFault> {
        if self.reject {
            return Err(EngineFault::new("unsupported model format"));
        }
        self.model = model.to_vec();
        self.input = vec![0.0; layout::SAMPLE_BYTES];
        self.output = vec![0.0; layout::OUTPUT_LEN];
        Ok(())
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [f32]> {
        (index == 0 && !self.input.is_empty()).then_some(self.input.as_mut_slice())
    }

    fn output_buffer(&self, index: usize) -> Option<&[f32]> {
        (index == 0 && !self.output.is_empty()).then_some(self.output.as_slice())
    }

    fn invoke(&mut self) -> std::result::Result<(), EngineFault> {
        self.invokes += 1;
        self.output[0] = self.input.iter().sum();
        Ok(())
    }
}

/// Route library logs to the test harness; `RUST_LOG` overrides the default
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flashstage_driver=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn config() -> PipelineConfig {
    PipelineConfig::default().with_bus(BusConfig::default().with_flash_size_exponent(FSIZE))
}

fn image(model: &[u8], sample: &[u8]) -> FlashImage {
    let layout = FlashLayout::default();
    FlashImage::erased(FSIZE)
        .unwrap()
        .with_model(&layout, model)
        .unwrap()
        .with_sample(&layout, sample)
        .unwrap()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn model_offset() -> u32 {
    FlashLayout::default().model_offset().unwrap()
}

fn reads_at(port: &EmulatedQspi, address: u32) -> Vec<usize> {
    port.accepted(nor::CMD_FAST_READ)
        .filter(|r| r.address == Some(address))
        .map(|r| r.length)
        .collect()
}

#[test]
fn owned_copy_stages_model_byte_for_byte() {
    init_tracing();
    let model = patterned(layout::REFERENCE_MODEL_BYTES);
    let port = EmulatedQspi::new(image(&model, &[0u8; 1024]));
    let mut pipeline = Pipeline::new(config(), port, RecordingEngine::default(), Vec::new());

    pipeline.run().unwrap();

    let (controller, driver, _) = pipeline.into_parts();
    assert_eq!(driver.engine().model, model);
    assert_eq!(
        reads_at(controller.port(), model_offset()),
        vec![model.len()]
    );
}

#[test]
fn memory_mapped_stages_model_byte_for_byte() {
    init_tracing();
    let model = patterned(4096);
    let port = EmulatedQspi::new(image(&model, &[9u8; 1024]));
    let config = config().with_strategy(StagingStrategy::MemoryMapped);
    let mut pipeline = Pipeline::new(config, port, RecordingEngine::default(), Vec::new());

    pipeline.run().unwrap();

    let (controller, driver, _) = pipeline.into_parts();
    assert_eq!(driver.engine().model, model);
    // Model came through the window, not an indirect read
    assert!(reads_at(controller.port(), model_offset()).is_empty());
    // The sample read ended the mapping
    assert_eq!(controller.mode(), Some(BusMode::Indirect));
    assert_eq!(controller.epoch(), 1);
    assert!(driver.engine().input.iter().all(|&v| v == 9.0));
}

#[test]
fn header_of_256_stages_256_bytes() {
    let layout = FlashLayout::default();
    let mut flash = FlashImage::erased(FSIZE).unwrap();
    flash.write_at(layout.header_offset, &[0x00, 0x00, 0x01, 0x00]).unwrap();
    flash.write_at(layout.model_offset().unwrap(), &patterned(256)).unwrap();
    flash.write_at(layout.sample_offset, &[0u8; 1024]).unwrap();

    let mut pipeline = Pipeline::new(
        config(),
        EmulatedQspi::new(flash),
        RecordingEngine::default(),
        Vec::new(),
    );
    let header = pipeline.boot().unwrap();
    assert_eq!(header.length, 256);

    let port = pipeline.controller().port();
    assert_eq!(reads_at(port, layout.header_offset), vec![layout::HEADER_LEN]);
    assert_eq!(reads_at(port, layout.model_offset().unwrap()), vec![256]);
    assert_eq!(pipeline.driver().engine().model, patterned(256));
}

#[test]
fn zero_length_header_stops_before_model_read() {
    let layout = FlashLayout::default();
    let mut flash = FlashImage::erased(FSIZE).unwrap();
    flash.write_at(layout.header_offset, &[0, 0, 0, 0]).unwrap();

    let mut pipeline = Pipeline::new(
        config(),
        EmulatedQspi::new(flash),
        RecordingEngine::default(),
        Vec::new(),
    );
    let err = pipeline.run().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidHeader);
    assert!(reads_at(pipeline.controller().port(), layout.model_offset().unwrap()).is_empty());
    assert_eq!(pipeline.driver().engine().invokes, 0);
    assert_eq!(
        pipeline.reporter().transport().as_slice(),
        b"error: InvalidHeader\n"
    );
}

#[test]
fn oversized_header_stops_before_model_read() {
    let layout = FlashLayout::default();
    let max = 4096;
    let mut flash = FlashImage::erased(FSIZE).unwrap();
    flash
        .write_at(layout.header_offset, &layout::encode_header(max as u32 + 1))
        .unwrap();

    let config = config().with_max_model_bytes(max);
    let mut pipeline = Pipeline::new(
        config,
        EmulatedQspi::new(flash),
        RecordingEngine::default(),
        Vec::new(),
    );
    let err = pipeline.boot().unwrap_err();

    assert!(matches!(
        err,
        StageError::InvalidHeader { length: 4097, capacity: 4096, .. }
    ));
    assert!(reads_at(pipeline.controller().port(), layout.model_offset().unwrap()).is_empty());
}

#[test]
fn erased_header_is_rejected() {
    let flash = FlashImage::erased(FSIZE).unwrap();
    let mut pipeline = Pipeline::new(
        config(),
        EmulatedQspi::new(flash),
        RecordingEngine::default(),
        Vec::new(),
    );
    assert_eq!(pipeline.boot().unwrap_err().kind(), ErrorKind::InvalidHeader);
}

#[test]
fn all_zero_sample_through_summing_model_reports_zero() {
    let model = pack_dense_model(
        layout::SAMPLE_BYTES,
        layout::OUTPUT_LEN,
        Activation::Identity,
        &vec![1.0; layout::SAMPLE_BYTES * layout::OUTPUT_LEN],
        &[0.0; layout::OUTPUT_LEN],
    );
    let port = EmulatedQspi::new(image(&model, &[0u8; 1024]));
    let mut pipeline = Pipeline::new(config(), port, DenseEngine::new(), Vec::new());

    pipeline.run().unwrap();

    let (_, _, out) = pipeline.into_parts();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), layout::OUTPUT_LEN);
    assert_eq!(lines[0].parse::<f32>().unwrap(), 0.0);
}

#[test]
fn rejected_model_reports_engine_init_failure() {
    let port = EmulatedQspi::new(image(&patterned(512), &[1u8; 1024]));
    let mut pipeline = Pipeline::new(config(), port, RecordingEngine::rejecting(), Vec::new());

    let err = pipeline.run().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::EngineInitFailed);
    let (controller, driver, out) = pipeline.into_parts();
    assert_eq!(driver.engine().invokes, 0);
    assert_eq!(out, b"error: EngineInitFailed\n");
    // No sample read after the failure
    assert!(reads_at(controller.port(), layout::SAMPLE_OFFSET).is_empty());
}

#[test]
fn sample_bytes_are_widened_in_order() {
    let sample: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
    let port = EmulatedQspi::new(image(&patterned(64), &sample));
    let mut pipeline = Pipeline::new(config(), port, RecordingEngine::default(), Vec::new());

    pipeline.run().unwrap();

    let input = &pipeline.driver().engine().input;
    for (i, &v) in input.iter().enumerate() {
        assert_eq!(v, f32::from(sample[i]));
    }
}

#[test]
fn write_enable_immediately_precedes_enter_qpi() {
    let port = EmulatedQspi::new(image(&patterned(64), &[0u8; 1024]));
    let mut pipeline = Pipeline::new(config(), port, RecordingEngine::default(), Vec::new());
    pipeline.run().unwrap();

    let log = pipeline.controller().port().commands();
    let enter = log
        .iter()
        .position(|r| r.instruction == nor::CMD_ENTER_QPI)
        .expect("unlock issued");
    assert!(enter > 0);
    assert_eq!(log[enter - 1].instruction, nor::CMD_WRITE_ENABLE);
    assert!(log[enter - 1].accepted && log[enter].accepted);
    // Exactly one unlock per run
    assert_eq!(pipeline.controller().port().accepted(nor::CMD_ENTER_QPI).count(), 1);
}

#[test]
fn single_line_bus_stays_in_spi() {
    let config = config().with_bus(
        BusConfig::default()
            .with_flash_size_exponent(FSIZE)
            .with_bus_width(BusWidth::Single),
    );
    let port = EmulatedQspi::new(image(&patterned(64), &[0u8; 1024]));
    let mut pipeline = Pipeline::new(config, port, RecordingEngine::default(), Vec::new());
    pipeline.run().unwrap();

    let port = pipeline.controller().port();
    assert_eq!(port.accepted(nor::CMD_ENTER_QPI).count(), 0);
    assert_eq!(port.protocol(), nor::Protocol::Spi);
}

#[test]
fn stuck_bus_times_out_within_budget() {
    let budget = 500;
    let bus = BusConfig::default()
        .with_flash_size_exponent(FSIZE)
        .with_poll_budget(budget);
    let mut controller = FlashController::new(EmulatedQspi::new(image(&[1u8; 16], &[0u8; 1024])));
    controller.configure(bus).unwrap();
    controller.enter_mode(BusMode::Indirect).unwrap();

    controller.port_mut().set_stuck_busy(true);
    let before = controller.port().status_reads();
    let err = flashstage_driver::read_header(&mut controller, layout::HEADER_OFFSET, 1024)
        .unwrap_err();

    assert!(matches!(err, StageError::BusTimeout { polls, .. } if polls == budget));
    assert!(controller.port().status_reads() - before <= u64::from(budget));
}

#[test]
fn re_entering_memory_mapped_keeps_views_valid() {
    let model = patterned(1000);
    let mut controller = FlashController::new(EmulatedQspi::new(image(&model, &[0u8; 1024])));
    controller
        .configure(BusConfig::default().with_flash_size_exponent(FSIZE))
        .unwrap();
    controller.enter_mode(BusMode::MemoryMapped).unwrap();

    let offset = model_offset();
    let region: MappedRegion = controller.map_region(offset, model.len()).unwrap();
    controller.enter_mode(BusMode::MemoryMapped).unwrap();

    assert_eq!(controller.epoch(), region.epoch());
    assert_eq!(controller.mapped_bytes(&region).unwrap(), model.as_slice());
}

#[test]
fn leaving_memory_mapped_invalidates_views() {
    let port = EmulatedQspi::new(image(&patterned(32), &[0u8; 1024]));
    let mut controller = FlashController::new(port);
    controller
        .configure(BusConfig::default().with_flash_size_exponent(FSIZE))
        .unwrap();
    controller.enter_mode(BusMode::MemoryMapped).unwrap();
    let region = controller.map_region(0, 16).unwrap();

    controller.enter_mode(BusMode::Indirect).unwrap();
    assert!(!controller.port().is_memory_mapped());

    let err = controller.mapped_bytes(&region).unwrap_err();
    assert!(matches!(
        err,
        StageError::StaleMapping { view_epoch: 0, current_epoch: 1 }
    ));

    // A fresh mapping works again under the new epoch
    controller.enter_mode(BusMode::MemoryMapped).unwrap();
    let fresh = controller.map_region(0, 16).unwrap();
    assert_eq!(fresh.epoch(), 1);
    assert!(controller.mapped_bytes(&fresh).is_ok());
}

#[test]
fn raw_byte_format_writes_one_byte_records() {
    let model = pack_dense_model(
        layout::SAMPLE_BYTES,
        2,
        Activation::Identity,
        &vec![0.0; layout::SAMPLE_BYTES * 2],
        &[7.0, 300.0],
    );
    let port = EmulatedQspi::new(image(&model, &[0u8; 1024]));
    let config = config()
        .with_output_len(2)
        .with_report_format(ReportFormat::RawByte);
    let mut pipeline = Pipeline::new(config, port, DenseEngine::new(), Vec::new());
    pipeline.run().unwrap();

    let (_, _, out) = pipeline.into_parts();
    assert_eq!(out, vec![7, b'\n', 255, b'\n']);
}
