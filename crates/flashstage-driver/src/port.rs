//! Port abstraction for the QUADSPI controller
//!
//! A port is the exclusively owned handle to one controller instance: its
//! register block and its memory-mapped window. Two implementations exist:
//!
//! ```text
//! EmulatedQspi : registers and NOR device modelled in software (tests, CI, host runs)
//! MmioQspi     : real registers and window mapped from /dev/mem (Linux-hosted parts)
//! ```

use crate::error::Result;
use crate::image::FlashImage;
use std::fmt::Debug;

/// Register-level access to one QUADSPI controller
///
/// Every method takes the port by unique reference where it can have side
/// effects on hardware: reading `SR` or `DR` is not idempotent.
pub trait QspiPort: Debug + Send {
    /// Read a 32-bit register at `offset` in the register block
    ///
    /// # Errors
    ///
    /// Returns error if the offset is outside the register block.
    fn read32(&mut self, offset: usize) -> Result<u32>;

    /// Write a 32-bit register at `offset` in the register block
    ///
    /// # Errors
    ///
    /// Returns error if the offset is outside the register block.
    fn write32(&mut self, offset: usize, value: u32) -> Result<()>;

    /// Read one byte from a register (byte access drains one FIFO entry from `DR`)
    ///
    /// # Errors
    ///
    /// Returns error if the offset is outside the register block or the FIFO is empty.
    fn read8(&mut self, offset: usize) -> Result<u8>;

    /// Bytes visible through the memory-mapped window
    ///
    /// Only meaningful while the controller is in memory-mapped mode. Ports
    /// that can tell return an empty slice otherwise.
    fn window(&self) -> &[u8];

    /// Port type for logging
    fn port_type(&self) -> PortType;
}

impl<P: QspiPort + ?Sized> QspiPort for Box<P> {
    fn read32(&mut self, offset: usize) -> Result<u32> {
        (**self).read32(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<()> {
        (**self).write32(offset, value)
    }

    fn read8(&mut self, offset: usize) -> Result<u8> {
        (**self).read8(offset)
    }

    fn window(&self) -> &[u8] {
        (**self).window()
    }

    fn port_type(&self) -> PortType {
        (**self).port_type()
    }
}

/// Port type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    /// Software model of controller and device
    Emulated,
    /// Memory-mapped hardware registers
    Mmio,
}

impl std::fmt::Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emulated => write!(f, "Emulated"),
            Self::Mmio => write!(f, "MMIO"),
        }
    }
}

/// Port selection
#[derive(Debug, Clone)]
pub enum PortSelection {
    /// Emulated controller backed by a flash image
    Emulated(FlashImage),

    /// Hardware controller reached through `/dev/mem`
    Mmio {
        /// Physical base of the register block
        regs_base: u64,
        /// Physical base of the mapped window
        window_base: u64,
        /// Bytes of the window to map
        window_len: usize,
    },
}

/// Open the selected port
///
/// # Errors
///
/// Returns error if the hardware registers cannot be mapped, or if MMIO is
/// requested on a platform without it.
pub fn open_port(selection: PortSelection) -> Result<Box<dyn QspiPort>> {
    use crate::ports::emulated::EmulatedQspi;

    match selection {
        PortSelection::Emulated(image) => {
            tracing::info!("Using emulated QUADSPI port ({} byte image)", image.len());
            Ok(Box::new(EmulatedQspi::new(image)))
        }

        #[cfg(unix)]
        PortSelection::Mmio {
            regs_base,
            window_base,
            window_len,
        } => {
            use crate::ports::mmio::MmioQspi;
            tracing::info!("Using MMIO QUADSPI port at {regs_base:#x}");
            MmioQspi::open(regs_base, window_base, window_len)
                .map(|p| Box::new(p) as Box<dyn QspiPort>)
        }

        #[cfg(not(unix))]
        PortSelection::Mmio { .. } => Err(crate::error::StageError::invalid_state(
            "MMIO port requires a unix host",
        )),
    }
}
