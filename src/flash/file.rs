//! File-backed flash image.
//!
//! Maps an image file into memory so that a host build (emulator, provisioning
//! tool) keeps its storage across runs. A newly created image is filled with
//! erased bytes. Every mutation is flushed before returning.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use super::{check_range, clear_cells, program_cells, Flash, FlashError, SectorId, ERASED_BYTE};

/// Flash image stored in a memory-mapped file.
pub struct FileFlash {
    map: MmapMut,
    sector_count: u8,
    sector_size: u32,
}

impl FileFlash {
    /// Opens the image at `path`, creating an erased one if it does not exist.
    ///
    /// An existing image must have exactly `sector_count * sector_size` bytes.
    pub fn open<P: AsRef<Path>>(path: P, sector_count: u8, sector_size: u32) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let total = sector_count as u64 * sector_size as u64;
        let fresh = !path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|_| FlashError::HardwareFault)?;

        if fresh {
            file.set_len(total).map_err(|_| FlashError::HardwareFault)?;
        } else {
            let len = file.metadata().map_err(|_| FlashError::HardwareFault)?.len();
            if len != total {
                log::error!("Flash image {:?} has {} bytes, expected {}", path, len, total);
                return Err(FlashError::OutOfBounds);
            }
        }

        // SAFETY: the image file is owned by this process for the lifetime of
        // the mapping; nothing else truncates it while mapped.
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|_| FlashError::HardwareFault)?;

        if fresh {
            map.fill(ERASED_BYTE);
            map.flush().map_err(|_| FlashError::HardwareFault)?;
            log::info!("Created erased flash image {:?} ({} x {} bytes)", path, sector_count, sector_size);
        }

        Ok(Self {
            map,
            sector_count,
            sector_size,
        })
    }

    fn span(&self, sector: SectorId, offset: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        if sector >= self.sector_count {
            return Err(FlashError::OutOfBounds);
        }
        let range = check_range(self.sector_size, offset, len)?;
        let base = sector as usize * self.sector_size as usize;
        Ok(base + range.start..base + range.end)
    }

    fn flush(&self, range: core::ops::Range<usize>) -> Result<(), FlashError> {
        self.map
            .flush_range(range.start, range.end - range.start)
            .map_err(|_| FlashError::HardwareFault)
    }
}

impl Flash for FileFlash {
    fn sector_count(&self) -> u8 {
        self.sector_count
    }

    fn sector_size(&self, sector: SectorId) -> Result<u32, FlashError> {
        if sector >= self.sector_count {
            return Err(FlashError::OutOfBounds);
        }
        Ok(self.sector_size)
    }

    fn erase_sector(&mut self, sector: SectorId) -> Result<(), FlashError> {
        let range = self.span(sector, 0, self.sector_size as usize)?;
        self.map[range.clone()].fill(ERASED_BYTE);
        self.flush(range)
    }

    fn program(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.span(sector, offset, data.len())?;
        program_cells(&mut self.map[range.clone()], data)?;
        self.flush(range)
    }

    fn clear_bits(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.span(sector, offset, data.len())?;
        clear_cells(&mut self.map[range.clone()], data)?;
        self.flush(range)
    }

    fn read(&self, sector: SectorId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.span(sector, offset, buf.len())?;
        buf.copy_from_slice(&self.map[range]);
        Ok(())
    }
}
