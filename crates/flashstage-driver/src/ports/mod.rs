//! QUADSPI port implementations
//!
//! - **Emulated**: controller registers and IS25LP128F device in software
//! - **MMIO**: real registers and mapped window through `/dev/mem` (unix only)

pub mod emulated;
#[cfg(unix)]
pub mod mmio;

pub use emulated::{CommandRecord, EmulatedQspi};
#[cfg(unix)]
pub use mmio::MmioQspi;
