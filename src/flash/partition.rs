//! Flash sector map.
//!
//! The device flash is split between the boardloader, the bootloader, the
//! firmware and the storage engine. [`PartitionedFlash`] hands the storage
//! engine exactly its own sectors, renumbered from zero, so that no storage
//! operation can reach a sector owned by another boot stage.

use alloc::vec::Vec;

use super::{Flash, FlashError, SectorId};

/// Owner of a flash region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Boardloader,
    Bootloader,
    Firmware,
    Storage,
}

/// Physical sectors assigned to one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub role: Role,
    pub sectors: &'static [SectorId],
}

/// Fixed partition table of a device.
#[derive(Debug, Clone, Copy)]
pub struct PartitionTable {
    pub regions: &'static [FlashRegion],
}

/// Partition table of a 2 MiB part with 24 sectors.
///
/// Storage uses sectors 4 and 16, the two 64 KiB sectors outside the code areas.
pub const DEFAULT_PARTITION_TABLE: PartitionTable = PartitionTable {
    regions: &[
        FlashRegion { role: Role::Boardloader, sectors: &[0, 1, 2] },
        FlashRegion { role: Role::Storage, sectors: &[4, 16] },
        FlashRegion { role: Role::Bootloader, sectors: &[5] },
        FlashRegion {
            role: Role::Firmware,
            sectors: &[6, 7, 8, 9, 10, 11, 17, 18, 19, 20, 21, 22, 23],
        },
    ],
};

impl PartitionTable {
    /// All physical sectors owned by `role`, in table order.
    pub fn sectors(&self, role: Role) -> Vec<SectorId> {
        self.regions
            .iter()
            .filter(|r| r.role == role)
            .flat_map(|r| r.sectors.iter().copied())
            .collect()
    }

    /// Role owning a physical sector, if any.
    pub fn owner(&self, sector: SectorId) -> Option<Role> {
        self.regions
            .iter()
            .find(|r| r.sectors.contains(&sector))
            .map(|r| r.role)
    }
}

/// View of a device restricted to one role's sectors.
pub struct PartitionedFlash<F: Flash> {
    inner: F,
    map: Vec<SectorId>,
}

impl<F: Flash> PartitionedFlash<F> {
    /// Restricts `inner` to the storage sectors of `table`.
    ///
    /// Fails if the table assigns a sector the device does not have, assigns a
    /// sector to two roles, or gives storage fewer than two sectors.
    pub fn storage(inner: F, table: &PartitionTable) -> Result<Self, FlashError> {
        let map = table.sectors(Role::Storage);
        if map.len() < 2 {
            return Err(FlashError::OutOfBounds);
        }
        for &sector in &map {
            if sector >= inner.sector_count() || table.owner(sector) != Some(Role::Storage) {
                return Err(FlashError::OutOfBounds);
            }
        }
        log::debug!("Storage mapped onto physical sectors {:?}", map);
        Ok(Self { inner, map })
    }

    /// Physical sector behind logical `sector`.
    pub fn physical(&self, sector: SectorId) -> Result<SectorId, FlashError> {
        self.map.get(sector as usize).copied().ok_or(FlashError::OutOfBounds)
    }

    /// Returns the whole device.
    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Flash> Flash for PartitionedFlash<F> {
    fn sector_count(&self) -> u8 {
        self.map.len() as u8
    }

    fn sector_size(&self, sector: SectorId) -> Result<u32, FlashError> {
        self.inner.sector_size(self.physical(sector)?)
    }

    fn erase_sector(&mut self, sector: SectorId) -> Result<(), FlashError> {
        let physical = self.physical(sector)?;
        self.inner.erase_sector(physical)
    }

    fn program(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let physical = self.physical(sector)?;
        self.inner.program(physical, offset, data)
    }

    fn clear_bits(&mut self, sector: SectorId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let physical = self.physical(sector)?;
        self.inner.clear_bits(physical, offset, data)
    }

    fn read(&self, sector: SectorId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.inner.read(self.physical(sector)?, offset, buf)
    }
}
