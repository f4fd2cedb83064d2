//! Bus, layout and pipeline configuration
//!
//! Defaults are the datasheet values for an IS25LP128F behind an STM32
//! QUADSPI controller with the standard asset layout.

use crate::error::{Result, StageError};
use flashstage_chip::{layout, nor};

/// Bus width the pipeline runs the device at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusWidth {
    /// Stay in SPI: every phase on one line
    Single,
    /// Unlock QPI: every phase on four lines
    #[default]
    Quad,
}

/// Which flash bank the controller drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashSelect {
    /// FLASH1 (BK1 pins)
    Flash1,
    /// FLASH2 (BK2 pins)
    #[default]
    Flash2,
}

/// Controller-wide bus parameters, applied once by `configure`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Bus width (decides whether the QPI unlock sequence runs)
    pub bus_width: BusWidth,
    /// Minimum chip-select high time in cycles (1..=8)
    pub chip_select_high_time: u8,
    /// Kernel clock prescaler; bus clock = kernel / (prescaler + 1)
    pub clock_prescaler: u8,
    /// `DCR.FSIZE`; addressable bytes = 2^(exponent + 1)
    pub flash_size_exponent: u8,
    /// FIFO threshold in bytes (1..=16)
    pub fifo_threshold: u8,
    /// Flash bank
    pub flash_select: FlashSelect,
    /// Status polls allowed per wait before giving up with `BusTimeout`
    pub poll_budget: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_width: BusWidth::Quad,
            chip_select_high_time: 6,
            clock_prescaler: 2,
            flash_size_exponent: nor::FSIZE_EXPONENT,
            fifo_threshold: 7,
            flash_select: FlashSelect::Flash2,
            poll_budget: 100_000,
        }
    }
}

impl BusConfig {
    /// Set the bus width
    #[must_use]
    pub const fn with_bus_width(mut self, bus_width: BusWidth) -> Self {
        self.bus_width = bus_width;
        self
    }

    /// Set the flash size exponent
    #[must_use]
    pub const fn with_flash_size_exponent(mut self, exponent: u8) -> Self {
        self.flash_size_exponent = exponent;
        self
    }

    /// Set the clock prescaler
    #[must_use]
    pub const fn with_clock_prescaler(mut self, prescaler: u8) -> Self {
        self.clock_prescaler = prescaler;
        self
    }

    /// Set the poll budget
    #[must_use]
    pub const fn with_poll_budget(mut self, polls: u32) -> Self {
        self.poll_budget = polls;
        self
    }

    /// Addressable flash bytes for this configuration
    pub const fn flash_size(&self) -> u64 {
        nor::addressable_bytes(self.flash_size_exponent)
    }

    /// Check every field fits its register field
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` naming the first out-of-range field.
    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.chip_select_high_time) {
            return Err(StageError::invalid_state(format!(
                "chip-select high time {} outside 1..=8 cycles",
                self.chip_select_high_time
            )));
        }
        if self.flash_size_exponent > 31 {
            return Err(StageError::invalid_state(format!(
                "flash size exponent {} above 31",
                self.flash_size_exponent
            )));
        }
        if !(1..=16).contains(&self.fifo_threshold) {
            return Err(StageError::invalid_state(format!(
                "FIFO threshold {} outside 1..=16 bytes",
                self.fifo_threshold
            )));
        }
        if self.poll_budget == 0 {
            return Err(StageError::invalid_state("poll budget must be non-zero"));
        }
        Ok(())
    }
}

/// Where the assets live in flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    /// Offset of the 4-byte big-endian model length header
    pub header_offset: u32,
    /// Offset of the raw input sample
    pub sample_offset: u32,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            header_offset: layout::HEADER_OFFSET,
            sample_offset: layout::SAMPLE_OFFSET,
        }
    }
}

impl FlashLayout {
    /// Create a layout with explicit offsets
    pub const fn new(header_offset: u32, sample_offset: u32) -> Self {
        Self {
            header_offset,
            sample_offset,
        }
    }

    /// Offset of the model blob (immediately after the header)
    ///
    /// # Errors
    ///
    /// Returns `AddressOutOfRange` if the header leaves no room for a blob
    /// below 4 GiB.
    pub const fn model_offset(&self) -> Result<u32> {
        match layout::model_offset(self.header_offset) {
            Some(offset) => Ok(offset),
            None => Err(StageError::header_past_address_space(self.header_offset)),
        }
    }
}

/// How the model blob is made available to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagingStrategy {
    /// One bulk indirect read into an owned buffer
    #[default]
    OwnedCopy,
    /// Switch to memory-mapped mode and hand out a view into the window
    MemoryMapped,
}

/// How output elements are written to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Fixed-point decimal text, one element per line
    Decimal {
        /// Digits after the decimal point
        precision: usize,
    },
    /// Each element truncated to one byte, followed by a newline
    RawByte,
}

impl Default for ReportFormat {
    fn default() -> Self {
        Self::Decimal { precision: 6 }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bus parameters
    pub bus: BusConfig,
    /// Asset offsets
    pub layout: FlashLayout,
    /// Model staging strategy
    pub strategy: StagingStrategy,
    /// Capacity of the owned model buffer; larger headers are rejected
    pub max_model_bytes: usize,
    /// Number of output elements reported
    pub output_len: usize,
    /// Output format
    pub report_format: ReportFormat,
    /// Allow one retry of a failed invoke when the engine declares it idempotent
    pub retry_idempotent_invoke: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            layout: FlashLayout::default(),
            strategy: StagingStrategy::default(),
            max_model_bytes: layout::MAX_MODEL_BYTES,
            output_len: layout::OUTPUT_LEN,
            report_format: ReportFormat::default(),
            retry_idempotent_invoke: false,
        }
    }
}

impl PipelineConfig {
    /// Set the bus parameters
    #[must_use]
    pub const fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Set the asset layout
    #[must_use]
    pub const fn with_layout(mut self, layout: FlashLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the staging strategy
    #[must_use]
    pub const fn with_strategy(mut self, strategy: StagingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the model buffer capacity
    #[must_use]
    pub const fn with_max_model_bytes(mut self, bytes: usize) -> Self {
        self.max_model_bytes = bytes;
        self
    }

    /// Set the number of output elements
    #[must_use]
    pub const fn with_output_len(mut self, len: usize) -> Self {
        self.output_len = len;
        self
    }

    /// Set the report format
    #[must_use]
    pub const fn with_report_format(mut self, format: ReportFormat) -> Self {
        self.report_format = format;
        self
    }

    /// Enable or disable the single idempotent invoke retry
    #[must_use]
    pub const fn with_invoke_retry(mut self, enabled: bool) -> Self {
        self.retry_idempotent_invoke = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_datasheet_values() {
        let bus = BusConfig::default();
        assert_eq!(bus.flash_size(), 16 * 1024 * 1024);
        assert_eq!(bus.chip_select_high_time, 6);
        assert_eq!(bus.clock_prescaler, 2);
        assert!(bus.validate().is_ok());

        let layout = FlashLayout::default();
        assert_eq!(layout.model_offset().unwrap(), 0x000F_0004);

        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_model_bytes, 262_144);
        assert_eq!(cfg.output_len, 10);
        assert_eq!(cfg.strategy, StagingStrategy::OwnedCopy);
        assert!(!cfg.retry_idempotent_invoke);
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let mut bus = BusConfig::default();
        bus.chip_select_high_time = 0;
        assert!(bus.validate().is_err());

        let bus = BusConfig::default().with_poll_budget(0);
        assert!(bus.validate().is_err());

        let bus = BusConfig::default().with_flash_size_exponent(32);
        assert!(bus.validate().is_err());
    }

    #[test]
    fn header_at_end_of_address_space_has_no_model_offset() {
        assert!(BusConfig::default().with_flash_size_exponent(31).validate().is_ok());

        let layout = FlashLayout::new(0xFFFF_FFFE, 4);
        assert!(matches!(
            layout.model_offset(),
            Err(StageError::AddressOutOfRange { address: 0xFFFF_FFFE, .. })
        ));
        assert_eq!(FlashLayout::new(0xFFFF_FFF0, 4).model_offset().unwrap(), 0xFFFF_FFF4);
    }
}
