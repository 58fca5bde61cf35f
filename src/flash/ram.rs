//! In-memory NOR flash emulator.
//!
//! Enforces the medium rules exactly and can simulate a power cut: after a
//! configured number of mutating operations every further erase, program or
//! bit clear fails with [`FlashError::PowerLoss`]. The operation that hits the
//! cut may be torn: with [`RamFlash::cut_power_within`] it reaches its first
//! few bytes before failing, the way a real part loses power mid-write.
//! Clearing the budget with [`RamFlash::restore_power`] models the next boot.

use alloc::vec;
use alloc::vec::Vec;

use super::{check_range, clear_cells, program_cells, Flash, FlashError, SectorId, ERASED_BYTE};

/// Sectors held in RAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamFlash {
    sectors: Vec<Vec<u8>>,
    /// Mutating operations performed so far.
    ops: usize,
    /// Operation count at which power is cut.
    power_budget: Option<usize>,
    /// Leading bytes the cut operation still reaches.
    torn_bytes: Option<usize>,
    /// Sector whose next erase reports a hardware fault.
    faulty_sector: Option<SectorId>,
}

impl RamFlash {
    /// Creates `sector_count` erased sectors of `sector_size` bytes each.
    pub fn new(sector_count: u8, sector_size: u32) -> Self {
        Self {
            sectors: vec![vec![ERASED_BYTE; sector_size as usize]; sector_count as usize],
            ops: 0,
            power_budget: None,
            torn_bytes: None,
            faulty_sector: None,
        }
    }

    /// Number of erase, program and bit-clear operations performed so far.
    pub fn ops(&self) -> usize {
        self.ops
    }

    /// Cuts power once `ops()` reaches `at_op`. The cut operation changes nothing.
    pub fn cut_power_at(&mut self, at_op: usize) {
        self.power_budget = Some(at_op);
        self.torn_bytes = None;
    }

    /// Cuts power once `ops()` reaches `at_op`, after that operation has
    /// written its first `bytes` bytes. An erase resets its first `bytes`
    /// bytes to [`ERASED_BYTE`].
    pub fn cut_power_within(&mut self, at_op: usize, bytes: usize) {
        self.power_budget = Some(at_op);
        self.torn_bytes = Some(bytes);
    }

    /// Removes any pending power cut.
    pub fn restore_power(&mut self) {
        self.power_budget = None;
        self.torn_bytes = None;
    }

    /// Makes the next erase of `sector` fail with a hardware fault.
    pub fn fail_erase(&mut self, sector: SectorId) {
        self.faulty_sector = Some(sector);
    }

    /// Raw view of a sector.
    pub fn sector(&self, sector: SectorId) -> &[u8] {
        &self.sectors[sector as usize]
    }

    /// Corrupts a byte regardless of medium rules, as physical tampering would.
    pub fn tamper(&mut self, sector: SectorId, offset: u32, value: u8) {
        self.sectors[sector as usize][offset as usize] = value;
    }

    /// Accounts for one mutating operation.
    ///
    /// Returns how many leading bytes the operation reaches: all of them
    /// (`None`), or `Some(n)` when it is the torn one.
    fn spend(&mut self) -> Result<Option<usize>, FlashError> {
        match self.power_budget {
            Some(budget) if self.ops >= budget => match self.torn_bytes.take() {
                Some(n) => Ok(Some(n)),
                None => Err(FlashError::PowerLoss),
            },
            _ => {
                self.ops += 1;
                Ok(None)
            }
        }
    }

    /// Checks `rule` against the whole target range, then writes as much of
    /// the result as the power budget allows.
    fn write_cells(
        &mut self,
        sector: SectorId,
        offset: u32,
        data: &[u8],
        rule: fn(&mut [u8], &[u8]) -> Result<(), FlashError>,
    ) -> Result<(), FlashError> {
        let mut staged = self.cells(sector, offset, data.len())?.to_vec();
        rule(&mut staged, data)?;
        let torn = self.spend()?;
        let reach = torn.map_or(staged.len(), |n| n.min(staged.len()));
        self.cells(sector, offset, reach)?.copy_from_slice(&staged[..reach]);
        match torn {
            Some(_) => Err(FlashError::PowerLoss),
            None => Ok(()),
        }
    }

    fn cells(&mut self, sector: SectorId, offset: u32, len: usize) -> Result<&mut [u8], FlashError> {
        let cells = self.sectors.get_mut(sector as usize).ok_or(FlashError::OutOfBounds)?;
        let range = check_range(cells.len() as u32, offset, len)?;
        Ok(&mut cells[range])
    }
}

impl Flash for RamFlash {
    fn sector_count(&self) -> u8 {
        self.sectors.len() as u8
    }

    fn sector_size(&self, sector: SectorId) -> Result<u32, FlashError> {
        self.sectors
            .get(sector as usize)
            .map(|s| s.len() as u32)
            .ok_or(FlashError::OutOfBounds)
    }

    fn erase_sector(&mut self, sector: SectorId) -> Result<(), FlashError> {
        if sector as usize >= self.sectors.len() {
            return Err(FlashError::OutOfBounds);
        }
        let torn = self.spend()?;
        if self.faulty_sector.take() == Some(sector) {
            return Err(FlashError::HardwareFault);
        }
        let cells = &mut self.sectors[sector as usize];
        let reach = torn.map_or(cells.len(), |n| n.min(cells.len()));
        cells[..reach].fill(ERASED_BYTE);
        match torn {
            Some(_) => Err(FlashError::PowerLoss),
            None => Ok(()),
        }
    }

    fn program(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.write_cells(sector, offset, data, program_cells)
    }

    fn clear_bits(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.write_cells(sector, offset, data, clear_cells)
    }

    fn read(&self, sector: SectorId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let cells = self.sectors.get(sector as usize).ok_or(FlashError::OutOfBounds)?;
        let range = check_range(cells.len() as u32, offset, buf.len())?;
        buf.copy_from_slice(&cells[range]);
        Ok(())
    }
}
