//! Sector-addressed NOR flash devices.
//!
//! NOR flash as the storage engine sees it: a fixed set of independently
//! erasable sectors addressed by `(sector, offset, length)`. Nothing above this
//! layer ever handles a raw address.
//!
//! # Medium rules
//! - **Erase** sets every bit of a sector to 1 (`0xFF` bytes).
//! - **Program** only moves bits from 1 to 0, and only into erased bytes.
//!   Programming a region twice without an erase is rejected with
//!   [`FlashError::NotErased`].
//! - **Clear bits** is the single permitted overwrite: the new bytes may only
//!   clear bits of what is already there. Tally counters and OTP version
//!   fuses are built on it.
//! - **Read** is always safe and side-effect free.

#[cfg(feature = "std")]
pub mod file;
pub mod partition;
pub mod ram;

use core::fmt;

/// Index of a sector inside a [`Flash`] device.
pub type SectorId = u8;

/// Value of an erased byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Errors reported by flash back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Sector id or byte range lies outside the device.
    OutOfBounds,
    /// Program targeted bytes that are not erased, or a bit clear would set bits.
    NotErased,
    /// The physical erase or program operation failed.
    HardwareFault,
    /// Power was cut before the operation ran (emulated devices only).
    PowerLoss,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::OutOfBounds => write!(f, "Flash access out of bounds"),
            FlashError::NotErased => write!(f, "Flash region is not erased"),
            FlashError::HardwareFault => write!(f, "Flash hardware fault"),
            FlashError::PowerLoss => write!(f, "Power lost during flash operation"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FlashError {}

/// Capability over a set of flash sectors.
pub trait Flash {
    /// Number of sectors exposed by this device.
    fn sector_count(&self) -> u8;

    /// Size in bytes of `sector`.
    fn sector_size(&self, sector: SectorId) -> Result<u32, FlashError>;

    /// Resets every byte of `sector` to [`ERASED_BYTE`].
    fn erase_sector(&mut self, sector: SectorId) -> Result<(), FlashError>;

    /// Programs `data` at `offset`. Every target byte must be erased.
    fn program(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Overwrites bytes at `offset` with `data`, which may only clear bits.
    fn clear_bits(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Copies bytes starting at `offset` into `buf`.
    fn read(&self, sector: SectorId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Reads one little-endian word.
    fn read_word(&self, sector: SectorId, offset: u32) -> Result<u32, FlashError> {
        let mut buf = [0u8; 4];
        self.read(sector, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Programs one little-endian word.
    fn program_word(&mut self, sector: SectorId, offset: u32, word: u32) -> Result<(), FlashError> {
        self.program(sector, offset, &word.to_le_bytes())
    }

    /// Returns true if `len` bytes starting at `offset` are all erased.
    fn is_erased(&self, sector: SectorId, offset: u32, len: u32) -> Result<bool, FlashError> {
        let mut chunk = [0u8; 64];
        let mut pos = offset;
        let end = offset.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        while pos < end {
            let n = core::cmp::min(chunk.len() as u32, end - pos) as usize;
            self.read(sector, pos, &mut chunk[..n])?;
            if chunk[..n].iter().any(|&b| b != ERASED_BYTE) {
                return Ok(false);
            }
            pos += n as u32;
        }
        Ok(true)
    }
}

/// Validates `offset..offset + len` against a sector of `size` bytes.
pub(crate) fn check_range(size: u32, offset: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
    let len = u32::try_from(len).map_err(|_| FlashError::OutOfBounds)?;
    let end = offset.checked_add(len).ok_or(FlashError::OutOfBounds)?;
    if end > size {
        return Err(FlashError::OutOfBounds);
    }
    Ok(offset as usize..end as usize)
}

/// Applies program semantics to `cells`: every target byte must be erased.
pub(crate) fn program_cells(cells: &mut [u8], data: &[u8]) -> Result<(), FlashError> {
    if cells.iter().any(|&b| b != ERASED_BYTE) {
        return Err(FlashError::NotErased);
    }
    cells.copy_from_slice(data);
    Ok(())
}

/// Applies bit-clear semantics to `cells`: `data` must be a subset of the current bits.
pub(crate) fn clear_cells(cells: &mut [u8], data: &[u8]) -> Result<(), FlashError> {
    if cells.iter().zip(data).any(|(&old, &new)| old & new != new) {
        return Err(FlashError::NotErased);
    }
    cells.copy_from_slice(data);
    Ok(())
}
