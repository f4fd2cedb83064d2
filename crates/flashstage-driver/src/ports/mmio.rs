//! Hardware QUADSPI port through `/dev/mem`
//!
//! For Linux-hosted parts carrying the STM32 QUADSPI block (STM32MP1). The
//! register block is mapped read/write, the memory-mapped window read-only.
//! Mappings are page-aligned; offsets handed to the port stay relative to
//! the physical bases the caller supplied.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{Result, StageError};
use crate::port::{PortType, QspiPort};
use flashstage_chip::regs;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

const DEV_MEM: &str = "/dev/mem";

/// One page-aligned physical mapping
#[derive(Debug)]
struct PhysMapping {
    base: NonNull<u8>,
    /// Total mapped bytes (from the aligned-down start)
    mapped_len: usize,
    /// Offset of the requested address inside the mapping
    lead: usize,
    /// Bytes requested
    len: usize,
}

impl PhysMapping {
    fn map(file: &File, phys: u64, len: usize, prot: ProtFlags) -> Result<Self> {
        let page = rustix::param::page_size() as u64;
        let aligned = phys & !(page - 1);
        let lead = (phys - aligned) as usize;
        let mapped_len = lead + len;

        // SAFETY: mmap of /dev/mem maps physical device memory into this process.
        // Invariants: (1) file is an open /dev/mem handle; (2) aligned is page-aligned
        // as mmap requires; (3) mapped_len is non-zero (len checked by caller);
        // (4) MAP_SHARED so loads/stores reach the device, not a private copy.
        // rustix reports failure as Err, so no MAP_FAILED sentinel handling is needed.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                mapped_len,
                prot,
                MapFlags::SHARED,
                file.as_fd(),
                aligned,
            )
            .map_err(|e| {
                StageError::transfer_error(format!("mmap {DEV_MEM} at {phys:#x} failed: {e}"))
            })?
        };
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| StageError::transfer_error("mmap returned null"))?;

        tracing::debug!("Mapped {len:#x} bytes of physical {phys:#x} at {base:p}");
        Ok(Self {
            base,
            mapped_len,
            lead,
            len,
        })
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers bounds-check offset against self.len; lead + len == mapped_len.
        unsafe { self.base.as_ptr().add(self.lead + offset) }
    }

    fn check(&self, offset: usize, width: usize) -> Result<()> {
        if offset + width > self.len {
            return Err(StageError::transfer_error(format!(
                "MMIO access {offset:#x}+{width} outside {:#x} byte mapping",
                self.len
            )));
        }
        Ok(())
    }
}

impl Drop for PhysMapping {
    fn drop(&mut self) {
        // SAFETY: munmap requires the pointer and length returned by/passed to mmap.
        // self.base and self.mapped_len come from the successful mmap in map(); Drop
        // runs once and no borrowed slice outlives self (window() ties it to &self).
        unsafe {
            if let Err(e) = munmap(self.base.as_ptr().cast(), self.mapped_len) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

/// QUADSPI controller reached through `/dev/mem`
#[derive(Debug)]
pub struct MmioQspi {
    regs: PhysMapping,
    window: PhysMapping,
    _file: File,
}

// SAFETY: Send - MmioQspi owns both mappings exclusively; mmap'd memory is
// process-wide, so moving the handle between threads keeps it valid.
unsafe impl Send for MmioQspi {}

impl MmioQspi {
    /// Map the register block at `regs_base` and `window_len` bytes of the
    /// memory-mapped window at `window_base`
    ///
    /// # Errors
    ///
    /// Returns error if `/dev/mem` cannot be opened (needs root or
    /// `CAP_SYS_RAWIO`) or either mapping fails.
    pub fn open(regs_base: u64, window_base: u64, window_len: usize) -> Result<Self> {
        if window_len == 0 {
            return Err(StageError::invalid_state("window length must be non-zero"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEV_MEM)
            .map_err(|e| {
                StageError::transfer_error(format!("Cannot open {DEV_MEM}: {e}. Running as root?"))
            })?;

        let regs = PhysMapping::map(
            &file,
            regs_base,
            regs::BLOCK_SIZE,
            ProtFlags::READ | ProtFlags::WRITE,
        )?;
        let window = PhysMapping::map(&file, window_base, window_len, ProtFlags::READ)?;

        tracing::info!(
            "✅ QUADSPI registers at {regs_base:#x}, window {window_base:#x} ({} KB)",
            window_len / 1024
        );
        Ok(Self {
            regs,
            window,
            _file: file,
        })
    }
}

impl QspiPort for MmioQspi {
    fn read32(&mut self, offset: usize) -> Result<u32> {
        self.regs.check(offset, 4)?;
        // SAFETY: Volatile read from a mapped hardware register.
        // Bounds checked above; register offsets are 4-byte aligned by the block
        // layout; volatile keeps the compiler from merging or dropping SR polls.
        let value = unsafe { self.regs.ptr(offset).cast::<u32>().read_volatile() };
        tracing::trace!("Read u32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.regs.check(offset, 4)?;
        tracing::trace!("Write u32 @ {offset:#x} = {value:#x}");
        // SAFETY: Volatile write to a mapped hardware register (bounds checked,
        // 4-byte aligned). Writes to CCR/AR start bus transactions and must not
        // be reordered or elided.
        unsafe { self.regs.ptr(offset).cast::<u32>().write_volatile(value) };
        Ok(())
    }

    fn read8(&mut self, offset: usize) -> Result<u8> {
        self.regs.check(offset, 1)?;
        // SAFETY: Volatile byte read (bounds checked). A byte access to DR pops
        // exactly one FIFO entry, which is what the controller's read loop needs.
        Ok(unsafe { self.regs.ptr(offset).read_volatile() })
    }

    fn window(&self) -> &[u8] {
        // SAFETY: The window mapping is valid for self.window.len bytes while self
        // lives; the returned slice borrows self so it cannot outlive the mapping.
        // Contents are only meaningful in memory-mapped mode, which the controller
        // checks before handing the slice out.
        unsafe { std::slice::from_raw_parts(self.window.ptr(0), self.window.len) }
    }

    fn port_type(&self) -> PortType {
        PortType::Mmio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_is_rejected_before_touching_dev_mem() {
        let err = MmioQspi::open(0x5800_3000, 0x7000_0000, 0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }
}
