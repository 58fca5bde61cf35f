//! Write-once OTP blocks with per-block lock bytes.
//!
//! A fixed number of write-once blocks for facts that must never change after
//! provisioning. The OTP area is laid out as the data blocks followed by one
//! lock byte per block; a lock byte that is no longer erased means locked.
//!
//! Blocks move `Unwritten -> Written -> Locked` and never back: OTP memory
//! cannot be erased, so there is no unlock and a rejected write is final for
//! the bytes it targeted.
//!
//! # Version gates
//! Anti-downgrade fuses keep a version as the number of cleared bits in a
//! block (see [`crate::counter`]). Raising the version clears more bits;
//! nothing short of replacing the chip can lower it.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::config::OtpLayout;
use crate::counter::{self, CounterError};
use crate::flash::{Flash, FlashError, SectorId, ERASED_BYTE};

/// Sector of the OTP device holding the blocks.
const OTP_SECTOR: SectorId = 0;

/// Lock byte value written by [`Otp::lock`].
const LOCKED_BYTE: u8 = 0x00;

/// Errors related to OTP operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpError {
    /// The block is locked; nothing can be written to it.
    AlreadyLocked,
    /// Block index or byte range lies outside the OTP area.
    OutOfRange,
    /// Target bytes were already programmed.
    AlreadyWritten,
    /// Underlying flash operation failed.
    Flash(FlashError),
}

impl fmt::Display for OtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtpError::AlreadyLocked => write!(f, "OTP block is locked"),
            OtpError::OutOfRange => write!(f, "OTP access out of range"),
            OtpError::AlreadyWritten => write!(f, "OTP bytes already written"),
            OtpError::Flash(e) => write!(f, "OTP flash error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for OtpError {}

impl From<FlashError> for OtpError {
    fn from(err: FlashError) -> Self {
        match err {
            FlashError::OutOfBounds => OtpError::OutOfRange,
            FlashError::NotErased => OtpError::AlreadyWritten,
            other => OtpError::Flash(other),
        }
    }
}

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpBlockState {
    Unwritten,
    Written,
    Locked,
}

/// Manager for the OTP area of a device.
pub struct Otp<F: Flash> {
    flash: F,
    layout: OtpLayout,
}

impl<F: Flash> Otp<F> {
    /// Wraps an OTP device.
    ///
    /// Fails with `OutOfRange` if the device is too small for `layout`.
    pub fn new(flash: F, layout: OtpLayout) -> Result<Self, OtpError> {
        if flash.sector_size(OTP_SECTOR)? < layout.total_size() || layout.block_size % 4 != 0 {
            return Err(OtpError::OutOfRange);
        }
        Ok(Self { flash, layout })
    }

    /// OTP geometry.
    pub fn layout(&self) -> OtpLayout {
        self.layout
    }

    fn block_offset(&self, block: u8) -> Result<u32, OtpError> {
        if block >= self.layout.block_count {
            return Err(OtpError::OutOfRange);
        }
        Ok(block as u32 * self.layout.block_size)
    }

    fn lock_offset(&self, block: u8) -> Result<u32, OtpError> {
        self.block_offset(block)?;
        Ok(self.layout.block_count as u32 * self.layout.block_size + block as u32)
    }

    /// Returns true if `block` is locked.
    ///
    /// A partially programmed lock byte counts as locked.
    pub fn is_locked(&self, block: u8) -> Result<bool, OtpError> {
        let mut byte = [0u8; 1];
        self.flash.read(OTP_SECTOR, self.lock_offset(block)?, &mut byte)?;
        Ok(byte[0] != ERASED_BYTE)
    }

    /// Reads `buf.len()` bytes of `block` starting at `offset`.
    pub fn read(&self, block: u8, offset: u32, buf: &mut [u8]) -> Result<(), OtpError> {
        let base = self.block_offset(block)?;
        self.check_span(offset, buf.len())?;
        self.flash.read(OTP_SECTOR, base + offset, buf)?;
        Ok(())
    }

    /// Reads a whole block.
    pub fn read_block(&self, block: u8) -> Result<Vec<u8>, OtpError> {
        let mut buf = vec![0u8; self.layout.block_size as usize];
        self.read(block, 0, &mut buf)?;
        Ok(buf)
    }

    /// Lifecycle state of `block`.
    pub fn state(&self, block: u8) -> Result<OtpBlockState, OtpError> {
        if self.is_locked(block)? {
            return Ok(OtpBlockState::Locked);
        }
        let data = self.read_block(block)?;
        if data.iter().all(|&b| b == ERASED_BYTE) {
            Ok(OtpBlockState::Unwritten)
        } else {
            Ok(OtpBlockState::Written)
        }
    }

    fn check_span(&self, offset: u32, len: usize) -> Result<(), OtpError> {
        let len = u32::try_from(len).map_err(|_| OtpError::OutOfRange)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.layout.block_size => Ok(()),
            _ => Err(OtpError::OutOfRange),
        }
    }

    /// Writes `data` into `block` at `offset`.
    ///
    /// # Errors
    /// * `AlreadyLocked` if the block is locked.
    /// * `OutOfRange` if `offset + data.len()` exceeds the block.
    /// * `AlreadyWritten` if any target byte is not erased.
    pub fn write(&mut self, block: u8, offset: u32, data: &[u8]) -> Result<(), OtpError> {
        if self.is_locked(block)? {
            return Err(OtpError::AlreadyLocked);
        }
        self.check_span(offset, data.len())?;
        let base = self.block_offset(block)?;
        if !self.flash.is_erased(OTP_SECTOR, base + offset, data.len() as u32)? {
            return Err(OtpError::AlreadyWritten);
        }
        self.flash.program(OTP_SECTOR, base + offset, data)?;
        log::debug!("OTP block {} written at {}: {}", block, offset, hex::encode(data));
        Ok(())
    }

    /// Locks `block`. Locking a locked block succeeds and changes nothing.
    pub fn lock(&mut self, block: u8) -> Result<(), OtpError> {
        let offset = self.lock_offset(block)?;
        if self.is_locked(block)? {
            return Ok(());
        }
        self.flash.program(OTP_SECTOR, offset, &[LOCKED_BYTE])?;
        log::info!("OTP block {} locked", block);
        Ok(())
    }

    fn block_words(&self, block: u8) -> Result<Vec<u32>, OtpError> {
        let data = self.read_block(block)?;
        counter::words_from_le_bytes(&data).map_err(|_| OtpError::OutOfRange)
    }

    /// Version recorded in a version-gate block.
    pub fn min_version(&self, block: u8) -> Result<u32, OtpError> {
        Ok(counter::decode(&self.block_words(block)?))
    }

    /// Returns true if `version` is allowed by the gate in `block`.
    pub fn check_min_version(&self, block: u8, version: u32) -> Result<bool, OtpError> {
        Ok(version >= self.min_version(block)?)
    }

    /// Raises the version gate in `block` to at least `version`.
    ///
    /// Lower versions are ignored. Fails with `OutOfRange` if the block cannot
    /// count that high.
    pub fn raise_min_version(&mut self, block: u8, version: u32) -> Result<(), OtpError> {
        if self.is_locked(block)? {
            return Err(OtpError::AlreadyLocked);
        }
        let mut words = self.block_words(block)?;
        if version > counter::capacity(&words) {
            return Err(OtpError::OutOfRange);
        }
        let base = self.block_offset(block)?;
        let current = counter::decode(&words);
        for _ in current..version {
            let (index, word) = counter::next_step(&words).map_err(|e| match e {
                CounterError::Exhausted => OtpError::OutOfRange,
                _ => OtpError::AlreadyWritten,
            })?;
            self.flash.clear_bits(OTP_SECTOR, base + 4 * index as u32, &word.to_le_bytes())?;
            words[index] = word;
        }
        if version > current {
            log::info!("OTP version gate {} raised from {} to {}", block, current, version);
        }
        Ok(())
    }

    /// Returns the device.
    pub fn into_flash(self) -> F {
        self.flash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::ram::RamFlash;

    fn otp() -> Otp<RamFlash> {
        let layout = OtpLayout::default();
        Otp::new(RamFlash::new(1, layout.total_size()), layout).unwrap()
    }

    #[test]
    fn test_write_lock_write() {
        let mut otp = otp();
        otp.write(0, 0, &[0xFF; 4]).unwrap();
        otp.lock(0).unwrap();
        let before = otp.read_block(0).unwrap();

        assert_eq!(otp.write(0, 0, &[0; 4]), Err(OtpError::AlreadyLocked));
        assert_eq!(otp.read_block(0).unwrap(), before);
        assert_eq!(otp.state(0), Ok(OtpBlockState::Locked));
    }

    #[test]
    fn test_lock_idempotent() {
        let mut otp = otp();
        otp.lock(3).unwrap();
        let once = otp.into_flash();

        let mut otp = Otp::new(once.clone(), OtpLayout::default()).unwrap();
        otp.lock(3).unwrap();
        assert!(otp.is_locked(3).unwrap());
        assert_eq!(otp.into_flash().sector(0), once.sector(0));
    }

    #[test]
    fn test_lifecycle() {
        let mut otp = otp();
        assert_eq!(otp.state(1), Ok(OtpBlockState::Unwritten));
        otp.write(1, 4, b"batch-7").unwrap();
        assert_eq!(otp.state(1), Ok(OtpBlockState::Written));

        let mut buf = [0u8; 7];
        otp.read(1, 4, &mut buf).unwrap();
        assert_eq!(&buf, b"batch-7");

        // Neighbouring erased bytes are still writable.
        otp.write(1, 11, &[0x01]).unwrap();
        otp.lock(1).unwrap();
        assert_eq!(otp.state(1), Ok(OtpBlockState::Locked));
        assert!(!otp.is_locked(2).unwrap());
    }

    #[test]
    fn test_rewrite_rejected() {
        let mut otp = otp();
        otp.write(2, 0, &[0x12, 0x34]).unwrap();
        assert_eq!(otp.write(2, 1, &[0x00]), Err(OtpError::AlreadyWritten));
        assert_eq!(otp.read_block(2).unwrap()[..3], [0x12, 0x34, 0xFF]);
    }

    #[test]
    fn test_out_of_range() {
        let mut otp = otp();
        assert_eq!(otp.write(0, 30, &[0; 4]), Err(OtpError::OutOfRange));
        assert_eq!(otp.write(16, 0, &[0]), Err(OtpError::OutOfRange));
        assert_eq!(otp.lock(16), Err(OtpError::OutOfRange));
        assert_eq!(otp.is_locked(200), Err(OtpError::OutOfRange));
    }

    #[test]
    fn test_device_too_small() {
        let result = Otp::new(RamFlash::new(1, 64), OtpLayout::default());
        assert!(matches!(result, Err(OtpError::OutOfRange)));
    }

    #[test]
    fn test_version_gate() {
        let mut otp = otp();
        assert_eq!(otp.min_version(4), Ok(0));
        otp.raise_min_version(4, 3).unwrap();
        assert_eq!(otp.min_version(4), Ok(3));

        // Lowering is a no-op.
        otp.raise_min_version(4, 1).unwrap();
        assert_eq!(otp.min_version(4), Ok(3));
        assert_eq!(otp.check_min_version(4, 2), Ok(false));
        assert_eq!(otp.check_min_version(4, 3), Ok(true));

        otp.raise_min_version(4, 40).unwrap();
        assert_eq!(otp.min_version(4), Ok(40));
        assert_eq!(otp.raise_min_version(4, 257), Err(OtpError::OutOfRange));
    }
}
