//! `flashstage`: command-line interface for the flash staging pipeline.
//!
//! ```text
//! USAGE:
//!   flashstage pack <out> [--model f | --dense-demo] [--sample f]   Build a flash image
//!   flashstage inspect <image>                                      Show header, model, sample
//!   flashstage run [--image f | --mmio]                             Boot, stage, infer, report
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flashstage_chip::{layout, memmap, nor};
use flashstage_driver::{
    open_port, pack_dense_model, write_sample_grid, Activation, BusConfig, BusWidth, FlashImage,
    FlashLayout, Pipeline, PipelineConfig, PortSelection, ReportFormat, StagingStrategy,
    DENSE_MAGIC,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flashstage", about = "QUADSPI flash staging pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

/// Flash geometry and asset offsets shared by every subcommand.
#[derive(clap::Args, Clone, Copy)]
struct LayoutArgs {
    /// DCR.FSIZE exponent; the device holds 2^(FSIZE+1) bytes.
    #[arg(long, default_value_t = nor::FSIZE_EXPONENT)]
    fsize: u8,
    /// Flash offset of the model length header.
    #[arg(long, value_parser = parse_u32, default_value = "0xF0000")]
    header_offset: u32,
    /// Flash offset of the input sample.
    #[arg(long, value_parser = parse_u32, default_value = "0x4")]
    sample_offset: u32,
}

impl LayoutArgs {
    fn layout(self) -> FlashLayout {
        FlashLayout::new(self.header_offset, self.sample_offset)
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Build a flash image holding a model and an input sample.
    Pack {
        /// Image file to write.
        out: PathBuf,
        /// Model blob to place after the header.
        #[arg(long, conflicts_with = "dense_demo", required_unless_present = "dense_demo")]
        model: Option<PathBuf>,
        /// Generate a dense row-band model instead of reading one.
        #[arg(long)]
        dense_demo: bool,
        /// Raw 32×32 sample (1024 bytes); all zero if omitted.
        #[arg(long)]
        sample: Option<PathBuf>,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Show what a flash image contains.
    Inspect {
        /// Image file to read.
        image: PathBuf,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Run the staging pipeline once and report the output vector.
    Run {
        /// Emulate the controller over this image file.
        #[arg(long, conflicts_with = "mmio", required_unless_present = "mmio")]
        image: Option<PathBuf>,
        /// Drive the QUADSPI hardware through /dev/mem.
        #[arg(long)]
        mmio: bool,
        /// Register/window placement for --mmio.
        #[arg(long, value_enum, default_value_t = Platform::Mp1)]
        platform: Platform,
        /// How the model is staged.
        #[arg(long, value_enum, default_value_t = Strategy::Copy)]
        strategy: Strategy,
        /// Output record format.
        #[arg(long, value_enum, default_value_t = Format::Decimal)]
        format: Format,
        /// Decimal places for --format decimal.
        #[arg(long, default_value_t = 6)]
        precision: usize,
        /// Number of output elements to report.
        #[arg(long, default_value_t = layout::OUTPUT_LEN)]
        output_len: usize,
        /// Retry one failed invoke if the engine allows it.
        #[arg(long)]
        retry: bool,
        /// Drive the bus on a single line (no QPI unlock).
        #[arg(long)]
        single_line: bool,
        /// Write results here (e.g. a UART device) instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        layout: LayoutArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Platform {
    /// STM32MP1 (Linux-hosted).
    Mp1,
    /// STM32L4/F7/H7.
    Mcu,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    /// Bulk indirect read into an owned buffer.
    Copy,
    /// View into the memory-mapped window.
    Mapped,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// Decimal text, one element per line.
    Decimal,
    /// One saturated byte per element, newline-terminated.
    Raw,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Pack {
            out,
            model,
            dense_demo,
            sample,
            layout,
        } => cmd_pack(&out, model.as_deref(), dense_demo, sample.as_deref(), layout)?,
        Cmd::Inspect { image, layout } => cmd_inspect(&image, layout)?,
        Cmd::Run {
            image,
            mmio,
            platform,
            strategy,
            format,
            precision,
            output_len,
            retry,
            single_line,
            output,
            layout,
        } => {
            let selection = if mmio {
                let placement = match platform {
                    Platform::Mp1 => memmap::Placement::MP1,
                    Platform::Mcu => memmap::Placement::MCU,
                };
                PortSelection::Mmio {
                    regs_base: placement.regs_base,
                    window_base: placement.window_base,
                    window_len: mmio_window_len(layout.fsize)?,
                }
            } else {
                let path = image.context("--image or --mmio is required")?;
                PortSelection::Emulated(FlashImage::load(&path)?)
            };

            let bus = BusConfig::default()
                .with_flash_size_exponent(layout.fsize)
                .with_bus_width(if single_line { BusWidth::Single } else { BusWidth::Quad });
            let config = PipelineConfig::default()
                .with_bus(bus)
                .with_layout(layout.layout())
                .with_strategy(match strategy {
                    Strategy::Copy => StagingStrategy::OwnedCopy,
                    Strategy::Mapped => StagingStrategy::MemoryMapped,
                })
                .with_report_format(match format {
                    Format::Decimal => ReportFormat::Decimal { precision },
                    Format::Raw => ReportFormat::RawByte,
                })
                .with_output_len(output_len)
                .with_invoke_retry(retry);
            cmd_run(selection, config, output.as_deref())?;
        }
    }

    Ok(())
}

/// Bytes of the decode window to map for a device of 2^(FSIZE+1) bytes.
fn mmio_window_len(fsize: u8) -> Result<usize> {
    let len = nor::addressable_bytes(fsize).min(memmap::WINDOW_SIZE);
    Ok(usize::try_from(len)?)
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid offset {s:?}: {e}"))
}

/// Dense model that reports the mean brightness of ten horizontal bands.
fn band_mean_model() -> Vec<u8> {
    let side = layout::SAMPLE_SIDE;
    let bands = layout::OUTPUT_LEN;
    let mut weights = vec![0.0f32; bands * layout::SAMPLE_BYTES];
    let mut counts = vec![0usize; bands];
    for pixel in 0..layout::SAMPLE_BYTES {
        let band = (pixel / side) * bands / side;
        weights[band * layout::SAMPLE_BYTES + pixel] = 1.0;
        counts[band] += 1;
    }
    for (band, count) in counts.iter().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / *count as f32;
        weights[band * layout::SAMPLE_BYTES..(band + 1) * layout::SAMPLE_BYTES]
            .iter_mut()
            .for_each(|w| *w *= scale);
    }
    pack_dense_model(
        layout::SAMPLE_BYTES,
        bands,
        Activation::Identity,
        &weights,
        &[0.0; layout::OUTPUT_LEN],
    )
}

fn cmd_pack(
    out: &Path,
    model: Option<&Path>,
    dense_demo: bool,
    sample: Option<&Path>,
    args: LayoutArgs,
) -> Result<()> {
    let model = match model {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None if dense_demo => band_mean_model(),
        None => bail!("--model or --dense-demo is required"),
    };
    let sample = match sample {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => vec![0u8; layout::SAMPLE_BYTES],
    };
    if sample.len() != layout::SAMPLE_BYTES {
        bail!(
            "sample is {} bytes, expected {}",
            sample.len(),
            layout::SAMPLE_BYTES
        );
    }
    if model.len() > layout::MAX_MODEL_BYTES {
        bail!(
            "model is {} bytes, the pipeline accepts at most {}",
            model.len(),
            layout::MAX_MODEL_BYTES
        );
    }

    let layout = args.layout();
    FlashImage::erased(args.fsize)?
        .with_model(&layout, &model)?
        .with_sample(&layout, &sample)?
        .save(out)?;

    println!("Wrote {}", out.display());
    println!("  Header  @ {:#010x}: {} byte model", layout.header_offset, model.len());
    println!("  Model   @ {:#010x}", layout.model_offset()?);
    println!("  Sample  @ {:#010x}: {} bytes", layout.sample_offset, sample.len());
    Ok(())
}

fn cmd_inspect(path: &Path, args: LayoutArgs) -> Result<()> {
    let image = FlashImage::load(path)?;
    let layout = args.layout();

    println!("Image        : {} ({} bytes)", path.display(), image.len());
    let header = image.decode_header(&layout)?;
    println!("Header       : {:#010x} → {} bytes", header.offset, header.length);
    if header.is_empty() || header.len() > layout::MAX_MODEL_BYTES {
        println!("Model        : (invalid header)");
    } else {
        let blob_offset = header.blob_offset()?;
        let model = image.slice(blob_offset, header.len())?;
        println!("Model        : {blob_offset:#010x}, {} bytes", model.len());
        if model.len() >= 16 && model[..4] == DENSE_MAGIC {
            let dim = |at: usize| {
                u32::from_le_bytes([model[at], model[at + 1], model[at + 2], model[at + 3]])
            };
            println!("Dense model  : {} → {}", dim(4), dim(8));
        }
    }

    let sample = image.slice(layout.sample_offset, layout::SAMPLE_BYTES)?;
    println!("Sample       : {:#010x}, {} bytes", layout.sample_offset, sample.len());
    let mut stdout = std::io::stdout().lock();
    write_sample_grid(&mut stdout, sample, layout::SAMPLE_SIDE)?;
    Ok(())
}

fn cmd_run(selection: PortSelection, config: PipelineConfig, output: Option<&Path>) -> Result<()> {
    let port = open_port(selection)?;
    let transport: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };

    let engine = flashstage_driver::DenseEngine::new();
    let mut pipeline = Pipeline::new(config, port, engine, transport);
    pipeline.run()?;
    info!(
        "Run complete: {} model bytes staged",
        pipeline.header().map_or(0, |h| h.length)
    );
    Ok(())
}
