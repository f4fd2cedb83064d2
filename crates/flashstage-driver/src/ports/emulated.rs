//! Emulated QUADSPI port
//!
//! Models the controller register block and an IS25LP128F behind it so the
//! full staging sequence runs without hardware. The model is strict where
//! the real device is unforgiving:
//!
//! - an instruction sent on the wrong line count for the device's current
//!   protocol is rejected (the device would decode garbage)
//! - `ENTER_QPI`/`EXIT_QPI` are rejected unless the command immediately
//!   before them was write-enable
//! - fast reads with the wrong dummy-cycle count are rejected (the data
//!   would be shifted by the latency difference)
//! - reads beyond `2^(FSIZE+1)` or the image are rejected
//! - `DCR` writes while the controller is enabled are ignored
//!
//! Every rejection raises `SR.TEF`, as the controller does on an illegal
//! access. Every command issued is kept in an inspectable log.

use crate::command::{DecodedCcr, LineMode};
use crate::error::{Result, StageError};
use crate::image::FlashImage;
use crate::port::{PortType, QspiPort};
use bytes::Bytes;
use flashstage_chip::nor::{self, Protocol};
use flashstage_chip::regs::{self, ccr, cr, dcr, fcr, sr};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// One command seen on the emulated bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    /// Instruction opcode
    pub instruction: u8,
    /// Full CCR word
    pub ccr: u32,
    /// Address phase value, if any
    pub address: Option<u32>,
    /// Data bytes requested (`DLR + 1` for reads, 0 otherwise)
    pub length: usize,
    /// Whether the device accepted it
    pub accepted: bool,
}

/// Emulated controller plus serial NOR device
#[derive(Debug)]
pub struct EmulatedQspi {
    image: Bytes,

    // Controller registers
    cr: u32,
    dcr: u32,
    flags: u32,
    dlr: u32,
    ccr: u32,
    ar: u32,
    abr: u32,
    lptr: u32,

    /// Command waiting for its address write
    pending: Option<DecodedCcr>,
    fifo: VecDeque<u8>,
    memory_mapped: bool,

    // Device state
    protocol: Protocol,
    write_enable_latch: bool,
    last_accepted: Option<u8>,

    // Instrumentation
    log: Vec<CommandRecord>,
    status_reads: u64,
    stuck_busy: bool,
}

impl EmulatedQspi {
    /// Create a port whose device holds `image`, in SPI protocol with the
    /// controller disabled
    pub fn new(image: FlashImage) -> Self {
        Self {
            image: image.into_bytes(),
            cr: 0,
            dcr: 0,
            flags: 0,
            dlr: 0,
            ccr: 0,
            ar: 0,
            abr: 0,
            lptr: 0,
            pending: None,
            fifo: VecDeque::new(),
            memory_mapped: false,
            protocol: Protocol::Spi,
            write_enable_latch: false,
            last_accepted: None,
            log: Vec::new(),
            status_reads: 0,
            stuck_busy: false,
        }
    }

    /// Force `SR.BUSY` to stay set (a device that never answers)
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Commands issued so far, oldest first
    pub fn commands(&self) -> &[CommandRecord] {
        &self.log
    }

    /// Accepted commands with `instruction`, oldest first
    pub fn accepted(&self, instruction: u8) -> impl Iterator<Item = &CommandRecord> + '_ {
        self.log
            .iter()
            .filter(move |r| r.accepted && r.instruction == instruction)
    }

    /// Number of `SR` reads so far
    pub fn status_reads(&self) -> u64 {
        self.status_reads
    }

    /// Protocol the device currently decodes
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Device write-enable latch
    pub fn write_enable_latch(&self) -> bool {
        self.write_enable_latch
    }

    /// Whether the controller is in memory-mapped mode
    pub fn is_memory_mapped(&self) -> bool {
        self.memory_mapped
    }

    fn enabled(&self) -> bool {
        self.cr & cr::EN != 0
    }

    fn flash_size(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let fsize = regs::field(self.dcr, dcr::FSIZE_SHIFT, dcr::FSIZE_MASK) as u8;
        nor::addressable_bytes(fsize)
    }

    fn status(&self) -> u32 {
        let mut value = self.flags;
        if self.stuck_busy || self.memory_mapped || !self.fifo.is_empty() {
            value |= sr::BUSY;
        }
        let threshold = regs::field(self.cr, cr::FTHRES_SHIFT, cr::FTHRES_MASK) as usize + 1;
        if !self.fifo.is_empty() && (self.fifo.len() >= threshold || self.flags & sr::TCF != 0) {
            value |= sr::FTF;
        }
        #[allow(clippy::cast_possible_truncation)]
        let level = self.fifo.len().min(regs::FIFO_DEPTH) as u32;
        value | (level << sr::FLEVEL_SHIFT)
    }

    fn abort(&mut self) {
        debug!("Emulated QUADSPI: abort (fifo {} bytes dropped)", self.fifo.len());
        self.fifo.clear();
        self.pending = None;
        self.memory_mapped = false;
        self.flags &= !sr::TCF;
    }

    fn write_ccr(&mut self, value: u32) {
        self.ccr = value;
        let decoded = DecodedCcr::decode(value);
        match decoded.fmode {
            ccr::fmode::MEMORY_MAPPED => self.enter_memory_mapped(decoded),
            ccr::fmode::INDIRECT_READ | ccr::fmode::INDIRECT_WRITE => {
                if decoded.address_lines == LineMode::None {
                    self.execute(decoded, None);
                } else {
                    self.pending = Some(decoded);
                }
            }
            _ => self.reject(decoded, None, 0, "automatic polling is not modelled"),
        }
    }

    fn write_ar(&mut self, value: u32) {
        self.ar = value;
        if let Some(decoded) = self.pending.take() {
            self.execute(decoded, Some(value));
        }
    }

    fn record(&mut self, d: DecodedCcr, address: Option<u32>, length: usize, accepted: bool) {
        self.log.push(CommandRecord {
            instruction: d.instruction,
            ccr: self.ccr,
            address,
            length,
            accepted,
        });
        if accepted {
            self.last_accepted = Some(d.instruction);
        } else {
            self.last_accepted = None;
        }
    }

    fn reject(&mut self, d: DecodedCcr, address: Option<u32>, length: usize, why: &str) {
        debug!(
            "Emulated QUADSPI: rejected {:#04x} ({why})",
            d.instruction
        );
        self.flags |= sr::TEF;
        self.record(d, address, length, false);
    }

    fn expected_lines(&self) -> LineMode {
        LineMode::for_protocol(self.protocol)
    }

    /// Validate a fast-read configuration against the device's protocol
    fn check_fast_read(&self, d: &DecodedCcr) -> std::result::Result<(), &'static str> {
        let lines = self.expected_lines();
        if d.instruction != nor::CMD_FAST_READ {
            return Err("only fast read is modelled for data transfers");
        }
        if d.instruction_lines != lines || d.address_lines != lines || d.data_lines != lines {
            return Err("line count does not match device protocol");
        }
        if d.dummy_cycles != self.protocol.fast_read_dummy_cycles() {
            return Err("wrong dummy-cycle count");
        }
        if d.address_size != ccr::size::BITS_24 && d.address_size != ccr::size::BITS_32 {
            return Err("address size must be 24 or 32 bits");
        }
        Ok(())
    }

    fn enter_memory_mapped(&mut self, d: DecodedCcr) {
        if !self.enabled() {
            return self.reject(d, None, 0, "controller disabled");
        }
        if let Err(why) = self.check_fast_read(&d) {
            return self.reject(d, None, 0, why);
        }
        self.memory_mapped = true;
        self.record(d, None, 0, true);
        debug!("Emulated QUADSPI: memory-mapped mode active");
    }

    fn execute(&mut self, d: DecodedCcr, address: Option<u32>) {
        let length = if d.data_lines == LineMode::None {
            0
        } else {
            self.dlr as usize + 1
        };
        if !self.enabled() {
            return self.reject(d, address, length, "controller disabled");
        }
        if self.memory_mapped {
            return self.reject(d, address, length, "indirect command while memory-mapped");
        }
        trace!(
            "Emulated QUADSPI: execute {:#04x} addr={address:?} len={length}",
            d.instruction
        );

        if d.fmode == ccr::fmode::INDIRECT_READ {
            return self.execute_read(d, address, length);
        }

        if d.data_lines != LineMode::None || d.address_lines != LineMode::None {
            return self.reject(d, address, length, "payload writes are not modelled");
        }
        if d.instruction_lines != self.expected_lines() {
            return self.reject(d, address, length, "line count does not match device protocol");
        }

        let follows_write_enable = self.last_accepted == Some(nor::CMD_WRITE_ENABLE);
        match (d.instruction, self.protocol) {
            (nor::CMD_WRITE_ENABLE, _) => self.write_enable_latch = true,
            (nor::CMD_ENTER_QPI, Protocol::Spi) if follows_write_enable => {
                self.protocol = Protocol::Qpi;
                self.write_enable_latch = false;
            }
            (nor::CMD_EXIT_QPI, Protocol::Qpi) if follows_write_enable => {
                self.protocol = Protocol::Spi;
                self.write_enable_latch = false;
            }
            (nor::CMD_ENTER_QPI | nor::CMD_EXIT_QPI, _) => {
                return self.reject(d, address, length, "protocol change without write-enable");
            }
            _ => return self.reject(d, address, length, "unsupported instruction"),
        }
        self.flags |= sr::TCF;
        self.record(d, address, length, true);
    }

    fn execute_read(&mut self, d: DecodedCcr, address: Option<u32>, length: usize) {
        if let Err(why) = self.check_fast_read(&d) {
            return self.reject(d, address, length, why);
        }
        let Some(start) = address else {
            return self.reject(d, address, length, "read without address");
        };
        let end = u64::from(start) + length as u64;
        if end > self.flash_size() || end > self.image.len() as u64 {
            return self.reject(d, address, length, "read past end of flash");
        }
        let start = start as usize;
        self.fifo.extend(&self.image[start..start + length]);
        self.flags |= sr::TCF;
        self.record(d, address, length, true);
    }

    fn check_offset(offset: usize) -> Result<()> {
        if offset + 4 > regs::BLOCK_SIZE {
            return Err(StageError::transfer_error(format!(
                "register offset {offset:#x} outside block"
            )));
        }
        Ok(())
    }
}

impl QspiPort for EmulatedQspi {
    fn read32(&mut self, offset: usize) -> Result<u32> {
        Self::check_offset(offset)?;
        let value = match offset {
            regs::CR => self.cr,
            regs::DCR => self.dcr,
            regs::SR => {
                self.status_reads += 1;
                self.status()
            }
            regs::DLR => self.dlr,
            regs::CCR => self.ccr,
            regs::AR => self.ar,
            regs::ABR => self.abr,
            regs::DR => {
                let mut word = [0u8; 4];
                for byte in &mut word {
                    *byte = self.fifo.pop_front().unwrap_or(0);
                }
                u32::from_le_bytes(word)
            }
            regs::LPTR => self.lptr,
            _ => 0,
        };
        Ok(value)
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<()> {
        Self::check_offset(offset)?;
        trace!("Emulated QUADSPI write {offset:#04x} = {value:#010x}");
        match offset {
            regs::CR => {
                if value & cr::ABORT != 0 {
                    self.abort();
                }
                self.cr = value & !cr::ABORT;
            }
            regs::DCR => {
                if self.enabled() {
                    debug!("Emulated QUADSPI: DCR write ignored while enabled");
                    self.flags |= sr::TEF;
                } else {
                    self.dcr = value;
                }
            }
            regs::FCR => self.flags &= !(value & fcr::ALL),
            regs::DLR => self.dlr = value,
            regs::CCR => self.write_ccr(value),
            regs::AR => self.write_ar(value),
            regs::ABR => self.abr = value,
            regs::LPTR => self.lptr = value,
            _ => {}
        }
        Ok(())
    }

    fn read8(&mut self, offset: usize) -> Result<u8> {
        Self::check_offset(offset)?;
        if offset != regs::DR {
            let word = self.read32(offset & !3)?;
            #[allow(clippy::cast_possible_truncation)]
            return Ok((word >> ((offset & 3) * 8)) as u8);
        }
        self.fifo
            .pop_front()
            .ok_or_else(|| StageError::transfer_error("FIFO underrun on DR read"))
    }

    fn window(&self) -> &[u8] {
        if !self.memory_mapped {
            return &[];
        }
        let visible = usize::try_from(self.flash_size())
            .unwrap_or(usize::MAX)
            .min(self.image.len());
        &self.image[..visible]
    }

    fn port_type(&self) -> PortType {
        PortType::Emulated
    }
}
