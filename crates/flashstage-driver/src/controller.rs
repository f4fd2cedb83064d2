//! Flash mode controller
//!
//! Owns the QUADSPI port and drives it through its regimes:
//!
//! ```text
//!             configure()
//! Unconfigured ──────────▶ Idle ──enter_mode(Indirect)──▶ Indirect
//!                            │                              │  ▲
//!                            │ enter_mode(MemoryMapped)     │  │ abort, epoch += 1
//!                            ▼                              ▼  │
//!                      MemoryMapped ◀────enter_mode(MemoryMapped)
//! ```
//!
//! Entering either mode first runs the unlock sequence (write-enable, then
//! enter-QPI) while the device still speaks SPI and the bus is configured
//! for four lines. Leaving memory-mapped mode aborts the controller and
//! bumps the mapping epoch, which invalidates every [`MappedRegion`] handed
//! out before.
//!
//! Every wait on the status register is bounded by
//! [`BusConfig::poll_budget`] and fails with `BusTimeout` once it is spent.

use crate::command::{DataDirection, FlashCommand};
use crate::config::{BusConfig, BusWidth, FlashSelect};
use crate::error::{Result, StageError};
use crate::port::QspiPort;
use flashstage_chip::nor::{self, Protocol};
use flashstage_chip::regs::{self, ccr, cr, dcr, fcr, sr};
use tracing::{debug, info};

/// Yield to the scheduler every this many status polls
const YIELD_INTERVAL: u32 = 1024;

/// Operating regime of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    /// Explicit command/address/data transactions
    Indirect,
    /// Flash contents readable through the mapped window
    MemoryMapped,
}

/// Validated view into the memory-mapped window
///
/// Only a token: the bytes are obtained through
/// [`FlashController::mapped_bytes`], which refuses views from an earlier
/// mapping epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    offset: u32,
    len: usize,
    epoch: u64,
}

impl MappedRegion {
    /// Flash offset of the first byte
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for an empty view
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mapping epoch the view belongs to
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Parameters for polling a status register.
#[derive(Clone, Copy)]
struct PollConfig<'a> {
    reg: usize,
    /// Done once any of these bits is set (ignored when zero)
    any_set: u32,
    /// Done only while all of these bits are clear
    all_clear: u32,
    /// Fail with `TransferError` if any of these bits is set
    error_mask: u32,
    waiting_for: &'a str,
}

/// QUADSPI controller driver
#[derive(Debug)]
pub struct FlashController<P: QspiPort> {
    port: P,
    config: BusConfig,
    configured: bool,
    mode: Option<BusMode>,
    protocol: Protocol,
    epoch: u64,
}

impl<P: QspiPort> FlashController<P> {
    /// Take ownership of a port; the device is assumed to be in SPI protocol
    /// as after power-on
    pub fn new(port: P) -> Self {
        Self {
            port,
            config: BusConfig::default(),
            configured: false,
            mode: None,
            protocol: Protocol::Spi,
            epoch: 0,
        }
    }

    /// Apply controller-wide bus parameters
    ///
    /// Disables the controller (aborting any memory-mapped session), writes
    /// `DCR` and `CR`, clears flags, re-enables and waits for the bus to
    /// report idle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for out-of-range parameters and `BusTimeout`
    /// if the controller does not become ready within the poll budget.
    pub fn configure(&mut self, config: BusConfig) -> Result<()> {
        config.validate()?;
        self.config = config;

        let current = self.port.read32(regs::CR)?;
        if current & cr::EN != 0 {
            self.abort()?;
        }
        if self.mode.take() == Some(BusMode::MemoryMapped) {
            self.epoch += 1;
        }
        self.port.write32(regs::CR, current & !cr::EN)?;

        let dcr_value = (u32::from(config.flash_size_exponent) << dcr::FSIZE_SHIFT)
            | (u32::from(config.chip_select_high_time - 1) << dcr::CSHT_SHIFT);
        self.port.write32(regs::DCR, dcr_value)?;

        let mut cr_value = (u32::from(config.clock_prescaler) << cr::PRESCALER_SHIFT)
            | (u32::from(config.fifo_threshold - 1) << cr::FTHRES_SHIFT);
        if config.flash_select == FlashSelect::Flash2 {
            cr_value |= cr::FSEL;
        }
        self.port.write32(regs::CR, cr_value)?;
        self.port.write32(regs::FCR, fcr::ALL)?;
        self.port.write32(regs::CR, cr_value | cr::EN)?;

        let polls = self.wait_idle()?;
        self.configured = true;
        info!(
            "✅ QUADSPI configured: {} bytes, prescaler {}, CSHT {} ({polls} polls)",
            config.flash_size(),
            config.clock_prescaler,
            config.chip_select_high_time
        );
        Ok(())
    }

    /// Switch to `target`, running the unlock sequence first if needed
    ///
    /// Entering `MemoryMapped` while already in it leaves the mapping (and
    /// every view into it) untouched. Any other switch out of
    /// `MemoryMapped` invalidates all views.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before `configure`, `BusTimeout` on a stuck
    /// bus and `TransferError` if the device rejects a command.
    pub fn enter_mode(&mut self, target: BusMode) -> Result<()> {
        if !self.configured {
            return Err(StageError::invalid_state("controller not configured"));
        }
        match (self.mode, target) {
            (Some(BusMode::MemoryMapped), BusMode::MemoryMapped) => {
                debug!("Already memory-mapped (epoch {}), view unchanged", self.epoch);
                return Ok(());
            }
            (Some(BusMode::Indirect), BusMode::Indirect) => return Ok(()),
            (Some(BusMode::MemoryMapped), BusMode::Indirect) => self.leave_memory_mapped()?,
            _ => {}
        }

        self.unlock()?;

        if target == BusMode::MemoryMapped {
            self.wait_idle()?;
            self.port.write32(regs::FCR, fcr::ALL)?;
            let word =
                FlashCommand::memory_mapped_read(self.protocol).ccr(ccr::fmode::MEMORY_MAPPED);
            debug!("Memory-mapped CCR {word:#010x}");
            self.port.write32(regs::CCR, word)?;
            if self.port.read32(regs::SR)? & sr::TEF != 0 {
                self.port.write32(regs::FCR, fcr::CTEF)?;
                return Err(StageError::transfer_error(
                    "device rejected memory-mapped read configuration",
                ));
            }
        }

        self.mode = Some(target);
        info!("Entered {target:?} mode ({:?} protocol)", self.protocol);
        Ok(())
    }

    /// Read exactly `len` bytes at `command.address` into `dest`
    ///
    /// # Errors
    ///
    /// - `SizeMismatch` if `dest` is shorter than `len`
    /// - `AddressOutOfRange` if the range exceeds the configured flash size
    /// - `InvalidState` outside indirect mode or for a non-read command
    /// - `BusTimeout` / `TransferError` from the bus
    pub fn read(&mut self, command: &FlashCommand, dest: &mut [u8], len: usize) -> Result<()> {
        self.require_mode(BusMode::Indirect)?;
        if dest.len() < len {
            return Err(StageError::size_mismatch(len, dest.len()));
        }
        if command.direction != DataDirection::Read {
            return Err(StageError::invalid_state("read issued with a non-read command"));
        }
        let address = command
            .address
            .ok_or_else(|| StageError::invalid_state("read command without address"))?;
        self.check_range(address, len)?;
        if len == 0 {
            return Ok(());
        }
        let dlr = u32::try_from(len - 1)
            .map_err(|_| StageError::size_mismatch(len, u32::MAX as usize))?;

        self.wait_idle()?;
        self.port.write32(regs::FCR, fcr::ALL)?;
        self.port.write32(regs::DLR, dlr)?;
        let word = command.ccr(ccr::fmode::INDIRECT_READ);
        self.port.write32(regs::CCR, word)?;
        self.port.write32(regs::AR, address)?;
        debug!(
            "Read {:#04x} @ {address:#010x} len={len} ccr={word:#010x}",
            command.instruction
        );

        let mut received = 0;
        while received < len {
            let (status, _) = self.poll_register(PollConfig {
                reg: regs::SR,
                any_set: sr::FLEVEL_MASK << sr::FLEVEL_SHIFT,
                all_clear: 0,
                error_mask: sr::TEF,
                waiting_for: "FIFO data",
            })?;
            let level = regs::field(status, sr::FLEVEL_SHIFT, sr::FLEVEL_MASK) as usize;
            for byte in dest[received..len].iter_mut().take(level) {
                *byte = self.port.read8(regs::DR)?;
            }
            received = (received + level).min(len);
        }

        self.finish_transfer()
    }

    /// Issue a zero-payload control command
    ///
    /// Protocol-changing commands (enter/exit QPI) are always sent as a
    /// write-enable immediately followed by the command.
    ///
    /// # Errors
    ///
    /// - `SizeMismatch` if `src` is shorter than `len`
    /// - `InvalidState` outside indirect mode or for a payload write
    /// - `BusTimeout` / `TransferError` from the bus
    pub fn write(&mut self, command: &FlashCommand, src: &[u8], len: usize) -> Result<()> {
        self.require_mode(BusMode::Indirect)?;
        if src.len() < len {
            return Err(StageError::size_mismatch(len, src.len()));
        }
        if len != 0 || command.direction == DataDirection::Read {
            return Err(StageError::invalid_state(
                "only zero-payload control commands can be written",
            ));
        }
        match command.instruction {
            nor::CMD_ENTER_QPI => self.switch_protocol(Protocol::Qpi),
            nor::CMD_EXIT_QPI => self.switch_protocol(Protocol::Spi),
            _ => self.transmit_control(command),
        }
    }

    /// Validate a view of `len` bytes at `offset` in the mapped window
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside memory-mapped mode and
    /// `AddressOutOfRange` if the range exceeds the flash or the window.
    pub fn map_region(&self, offset: u32, len: usize) -> Result<MappedRegion> {
        self.require_mode(BusMode::MemoryMapped)?;
        self.check_range(offset, len)?;
        let window = self.port.window().len();
        if offset as usize + len > window {
            return Err(StageError::AddressOutOfRange {
                address: offset,
                length: len,
                limit: window as u64,
            });
        }
        Ok(MappedRegion {
            offset,
            len,
            epoch: self.epoch,
        })
    }

    /// Bytes behind a mapped view
    ///
    /// # Errors
    ///
    /// Returns `StaleMapping` if the controller left the mapping the view
    /// was created in.
    pub fn mapped_bytes(&self, region: &MappedRegion) -> Result<&[u8]> {
        if self.mode != Some(BusMode::MemoryMapped) || region.epoch != self.epoch {
            return Err(StageError::StaleMapping {
                view_epoch: region.epoch,
                current_epoch: self.epoch,
            });
        }
        let start = region.offset as usize;
        self.port
            .window()
            .get(start..start + region.len)
            .ok_or(StageError::AddressOutOfRange {
                address: region.offset,
                length: region.len,
                limit: self.port.window().len() as u64,
            })
    }

    /// Current mode (`None` until a mode has been entered)
    pub const fn mode(&self) -> Option<BusMode> {
        self.mode
    }

    /// Protocol the device is being driven in
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Current mapping epoch
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Active bus configuration
    pub const fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Borrow the port
    pub const fn port(&self) -> &P {
        &self.port
    }

    /// Borrow the port mutably (instrumentation and fault injection)
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Give the port back
    pub fn into_port(self) -> P {
        self.port
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn require_mode(&self, mode: BusMode) -> Result<()> {
        if self.mode == Some(mode) {
            Ok(())
        } else {
            Err(StageError::invalid_state(format!(
                "operation needs {mode:?} mode, controller is in {:?}",
                self.mode
            )))
        }
    }

    fn check_range(&self, address: u32, len: usize) -> Result<()> {
        let limit = self.config.flash_size();
        if u64::from(address) + len as u64 > limit {
            return Err(StageError::AddressOutOfRange {
                address,
                length: len,
                limit,
            });
        }
        Ok(())
    }

    /// Put the device into the protocol the bus width calls for
    fn unlock(&mut self) -> Result<()> {
        if self.config.bus_width == BusWidth::Quad && self.protocol == Protocol::Spi {
            self.switch_protocol(Protocol::Qpi)?;
        }
        Ok(())
    }

    /// Write-enable immediately followed by the protocol command; never split
    fn switch_protocol(&mut self, target: Protocol) -> Result<()> {
        if self.protocol == target {
            return Ok(());
        }
        let command = match target {
            Protocol::Qpi => FlashCommand::enter_qpi(),
            Protocol::Spi => FlashCommand::exit_qpi(),
        };
        self.transmit_control(&FlashCommand::write_enable(self.protocol))?;
        self.transmit_control(&command)?;
        self.protocol = target;
        info!("Device switched to {target:?} protocol");
        Ok(())
    }

    fn transmit_control(&mut self, command: &FlashCommand) -> Result<()> {
        self.wait_idle()?;
        self.port.write32(regs::FCR, fcr::ALL)?;
        let word = command.ccr(ccr::fmode::INDIRECT_WRITE);
        debug!("Control {:#04x} ccr={word:#010x}", command.instruction);
        self.port.write32(regs::CCR, word)?;
        if let Some(address) = command.address {
            self.port.write32(regs::AR, address)?;
        }
        self.finish_transfer()
    }

    fn finish_transfer(&mut self) -> Result<()> {
        self.poll_register(PollConfig {
            reg: regs::SR,
            any_set: sr::TCF,
            all_clear: 0,
            error_mask: sr::TEF,
            waiting_for: "transfer complete",
        })?;
        self.port.write32(regs::FCR, fcr::CTCF)?;
        self.wait_idle()?;
        Ok(())
    }

    fn leave_memory_mapped(&mut self) -> Result<()> {
        self.abort()?;
        self.mode = None;
        self.epoch += 1;
        info!("Left memory-mapped mode, mapping epoch now {}", self.epoch);
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        let current = self.port.read32(regs::CR)?;
        self.port.write32(regs::CR, current | cr::ABORT)?;
        self.poll_register(PollConfig {
            reg: regs::CR,
            any_set: 0,
            all_clear: cr::ABORT,
            error_mask: 0,
            waiting_for: "abort",
        })?;
        self.wait_idle()?;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<u32> {
        self.poll_register(PollConfig {
            reg: regs::SR,
            any_set: 0,
            all_clear: sr::BUSY,
            error_mask: 0,
            waiting_for: "BUSY clear",
        })
        .map(|(_, polls)| polls)
    }

    /// Poll `cfg.reg` until done, returning the last value and the poll count
    fn poll_register(&mut self, cfg: PollConfig<'_>) -> Result<(u32, u32)> {
        let PollConfig {
            reg,
            any_set,
            all_clear,
            error_mask,
            waiting_for,
        } = cfg;
        let budget = self.config.poll_budget;
        for i in 0..budget {
            let value = self.port.read32(reg)?;
            if value & error_mask != 0 {
                self.port.write32(regs::FCR, fcr::CTEF)?;
                return Err(StageError::transfer_error(format!(
                    "error flag set while waiting for {waiting_for} (status {value:#010x})"
                )));
            }
            if (any_set == 0 || value & any_set != 0) && value & all_clear == 0 {
                return Ok((value, i + 1));
            }
            if i % YIELD_INTERVAL == YIELD_INTERVAL - 1 {
                std::thread::yield_now();
            }
        }
        Err(StageError::bus_timeout(waiting_for, budget))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FlashImage;
    use crate::ports::EmulatedQspi;

    fn controller(image: FlashImage, bus: BusConfig) -> FlashController<EmulatedQspi> {
        let mut ctrl = FlashController::new(EmulatedQspi::new(image));
        ctrl.configure(bus).unwrap();
        ctrl
    }

    fn small_bus() -> BusConfig {
        BusConfig::default()
            .with_flash_size_exponent(15)
            .with_poll_budget(64)
    }

    #[test]
    fn configure_times_out_on_stuck_bus() {
        let mut port = EmulatedQspi::new(FlashImage::with_len(4096));
        port.set_stuck_busy(true);
        let mut ctrl = FlashController::new(port);
        let err = ctrl.configure(small_bus()).unwrap_err();
        assert!(matches!(err, StageError::BusTimeout { polls: 64, .. }));
        assert_eq!(ctrl.port().status_reads(), 64);
    }

    #[test]
    fn enter_mode_before_configure_is_rejected() {
        let mut ctrl = FlashController::new(EmulatedQspi::new(FlashImage::with_len(4096)));
        let err = ctrl.enter_mode(BusMode::Indirect).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[test]
    fn unlock_sends_write_enable_immediately_before_enter_qpi() {
        let mut ctrl = controller(FlashImage::with_len(65536), small_bus());
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        let log = ctrl.port().commands();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].instruction, nor::CMD_WRITE_ENABLE);
        assert_eq!(log[1].instruction, nor::CMD_ENTER_QPI);
        assert!(log.iter().all(|r| r.accepted));
        assert_eq!(ctrl.protocol(), Protocol::Qpi);
        assert_eq!(ctrl.port().protocol(), Protocol::Qpi);
    }

    #[test]
    fn single_bus_width_skips_unlock() {
        let bus = small_bus().with_bus_width(BusWidth::Single);
        let mut ctrl = controller(FlashImage::with_len(65536), bus);
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        assert!(ctrl.port().commands().is_empty());
        assert_eq!(ctrl.protocol(), Protocol::Spi);
    }

    #[test]
    fn read_checks_destination_capacity_before_bus_access() {
        let mut ctrl = controller(FlashImage::with_len(65536), small_bus());
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        let before = ctrl.port().commands().len();
        let mut dest = [0u8; 8];
        let cmd = FlashCommand::fast_read(ctrl.protocol(), 0);
        let err = ctrl.read(&cmd, &mut dest, 16).unwrap_err();
        assert!(matches!(err, StageError::SizeMismatch { needed: 16, available: 8 }));
        assert_eq!(ctrl.port().commands().len(), before);
    }

    #[test]
    fn read_rejects_range_past_flash_size() {
        let mut ctrl = controller(FlashImage::with_len(65536), small_bus());
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        let mut dest = [0u8; 32];
        let cmd = FlashCommand::fast_read(ctrl.protocol(), 65_530);
        let err = ctrl.read(&cmd, &mut dest, 32).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AddressOutOfRange);
    }

    #[test]
    fn read_returns_flash_bytes_larger_than_fifo() {
        let mut image = FlashImage::with_len(65536);
        let pattern: Vec<u8> = (0..100u8).collect();
        image.write_at(0x200, &pattern).unwrap();
        let mut ctrl = controller(image, small_bus());
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        let mut dest = vec![0u8; 100];
        let cmd = FlashCommand::fast_read(ctrl.protocol(), 0x200);
        ctrl.read(&cmd, &mut dest, 100).unwrap();
        assert_eq!(dest, pattern);
    }

    #[test]
    fn write_rejects_payload() {
        let mut ctrl = controller(FlashImage::with_len(65536), small_bus());
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        let cmd = FlashCommand::write_enable(ctrl.protocol());
        let err = ctrl.write(&cmd, &[1, 2], 2).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[test]
    fn exit_qpi_through_write_is_preceded_by_write_enable() {
        let mut ctrl = controller(FlashImage::with_len(65536), small_bus());
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        ctrl.write(&FlashCommand::exit_qpi(), &[], 0).unwrap();
        let log = ctrl.port().commands();
        let n = log.len();
        assert_eq!(log[n - 2].instruction, nor::CMD_WRITE_ENABLE);
        assert_eq!(log[n - 1].instruction, nor::CMD_EXIT_QPI);
        assert_eq!(ctrl.port().protocol(), Protocol::Spi);
    }

    #[test]
    fn memory_mapped_reentry_keeps_view() {
        let mut ctrl = controller(FlashImage::with_len(65536), small_bus());
        ctrl.enter_mode(BusMode::MemoryMapped).unwrap();
        let first = ctrl.map_region(0x100, 64).unwrap();
        ctrl.enter_mode(BusMode::MemoryMapped).unwrap();
        let second = ctrl.map_region(0x100, 64).unwrap();
        assert_eq!(first, second);
        assert!(ctrl.mapped_bytes(&first).is_ok());
    }

    #[test]
    fn leaving_memory_mapped_invalidates_views() {
        let mut ctrl = controller(FlashImage::with_len(65536), small_bus());
        ctrl.enter_mode(BusMode::MemoryMapped).unwrap();
        let region = ctrl.map_region(0, 16).unwrap();
        ctrl.enter_mode(BusMode::Indirect).unwrap();
        let err = ctrl.mapped_bytes(&region).unwrap_err();
        assert!(matches!(
            err,
            StageError::StaleMapping { view_epoch: 0, current_epoch: 1 }
        ));

        ctrl.enter_mode(BusMode::MemoryMapped).unwrap();
        assert_eq!(
            ctrl.mapped_bytes(&region).unwrap_err().kind(),
            crate::error::ErrorKind::StaleMapping
        );
    }
}
