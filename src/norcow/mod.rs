//! Power-loss safe key-value log over rotating flash sectors.
//!
//! An append-only log of tagged entries in one active sector. Updates append
//! and shadow older entries; when an append would not fit, the live entries
//! are copied in key order into the standby sector, which is then promoted.
//! The entry being written replaces its key's old one during that copy, so an
//! update only needs room for the new value.
//!
//! # Power-loss ordering
//! 1. Every live entry is copied to the standby sector, followed by the new one.
//! 2. The standby gets its generation words, then its magic.
//! 3. Only then is the old active sector erased.
//!
//! An abort before step 2 completes leaves the old sector as the only valid
//! one; an abort during step 3 leaves two valid sectors and the higher
//! generation wins. [`Norcow::open`] finishes whichever step was interrupted.

pub mod entry;
pub mod header;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use crate::counter::{self, CounterError};
use crate::flash::{Flash, FlashError, SectorId};

use entry::{EntryKind, Slot, Step, COUNTER_LEN, ENTRY_OVERHEAD, ERASED_KEY};
use header::HEADER_LEN;

/// Errors related to the sector log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NorcowError {
    ValueTooLarge,
    OutOfSpace,
    InvalidKey,
    InvalidGeometry,
    Corrupted,
    Flash(FlashError),
}

impl fmt::Display for NorcowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NorcowError::ValueTooLarge => write!(f, "Value too large"),
            NorcowError::OutOfSpace => write!(f, "Storage full"),
            NorcowError::InvalidKey => write!(f, "Invalid key"),
            NorcowError::InvalidGeometry => write!(f, "Invalid sector geometry"),
            NorcowError::Corrupted => write!(f, "Storage corrupted"),
            NorcowError::Flash(e) => write!(f, "Flash error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NorcowError {}

impl From<FlashError> for NorcowError {
    fn from(err: FlashError) -> Self {
        NorcowError::Flash(err)
    }
}

impl From<CounterError> for NorcowError {
    fn from(_: CounterError) -> Self {
        NorcowError::Corrupted
    }
}

/// Lifecycle state of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NorcowState {
    Normal,
    Compacting,
    Erasing,
}

/// Key-value log over two or more equally sized sectors.
pub struct Norcow<F: Flash> {
    flash: F,
    sector_size: u32,
    active: SectorId,
    free_offset: u32,
    generation_words: Vec<u32>,
    index: BTreeMap<u16, Slot>,
    state: NorcowState,
    max_value_len: u16,
}

impl<F: Flash> Norcow<F> {
    /// Opens the log, recovering from any interrupted compaction or wipe.
    ///
    /// Blank flash is formatted. A clean store is opened without writes.
    pub fn open(flash: F) -> Result<Self, NorcowError> {
        Self::open_with_limit(flash, None)
    }

    /// Like [`Norcow::open`], additionally capping the value size at `limit`.
    pub fn open_with_limit(mut flash: F, limit: Option<u16>) -> Result<Self, NorcowError> {
        let sector_size = check_geometry(&flash)?;
        let capacity = sector_size - HEADER_LEN - ENTRY_OVERHEAD;
        let mut max_value_len = u16::try_from(capacity).unwrap_or(u16::MAX);
        if let Some(limit) = limit {
            max_value_len = max_value_len.min(limit);
        }

        let active = match recover(&mut flash, sector_size)? {
            Some(active) => active,
            None => {
                log::warn!("No valid storage sector found, formatting");
                format(&mut flash, sector_size, 0, &counter::encode_tally(0, header::GENERATION_TALLY_WORDS))?;
                0
            }
        };

        let generation_words = header::read(&flash, active)?
            .ok_or(NorcowError::Corrupted)?
            .generation_words;
        let mut norcow = Self {
            flash,
            sector_size,
            active,
            free_offset: HEADER_LEN,
            generation_words,
            index: BTreeMap::new(),
            state: NorcowState::Normal,
            max_value_len,
        };
        norcow.scan()?;
        log::info!(
            "Storage opened: sector {}, generation {}, {} entries, {} bytes free",
            norcow.active,
            norcow.generation(),
            norcow.index.len(),
            norcow.free_space()
        );
        Ok(norcow)
    }

    fn scan(&mut self) -> Result<(), NorcowError> {
        let mut offset = HEADER_LEN;
        self.index.clear();
        loop {
            match entry::step(&self.flash, self.active, offset, self.sector_size)? {
                Step::End => break,
                Step::Torn { key, next } => {
                    log::warn!("Skipping torn entry for key {:#06x} at {}", key, offset);
                    offset = next;
                }
                Step::Entry { key, slot, next } => {
                    if slot.kind == EntryKind::Tombstone {
                        self.index.remove(&key);
                    } else {
                        self.index.insert(key, slot);
                    }
                    offset = next;
                }
                Step::Overrun => {
                    log::warn!("Entry at {} runs past the sector end, treating the rest as used", offset);
                    offset = self.sector_size;
                    break;
                }
                Step::BadChecksum { key, slot, next } => {
                    // Indexed anyway: a later entry shadows it, a read reports it.
                    log::warn!("Checksum mismatch for key {:#06x} at {}", key, offset);
                    self.index.insert(key, slot);
                    offset = next;
                }
            }
        }
        self.free_offset = offset;
        Ok(())
    }

    /// Current state; anything other than `Normal` means an operation was cut short.
    pub fn state(&self) -> NorcowState {
        self.state
    }

    pub fn active_sector(&self) -> SectorId {
        self.active
    }

    /// Generation of the active sector.
    pub fn generation(&self) -> u32 {
        counter::decode_tally(&self.generation_words).unwrap_or(u32::MAX)
    }

    pub fn erase_count(&self, sector: SectorId) -> Result<u32, NorcowError> {
        Ok(header::erase_count(&self.flash, sector)?)
    }

    /// Bytes left in the active sector before a compaction is needed.
    pub fn free_space(&self) -> u32 {
        self.sector_size - self.free_offset
    }

    /// Largest payload `set` accepts.
    pub fn max_value_len(&self) -> u16 {
        self.max_value_len
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    fn read_slot(&self, key: u16, slot: &Slot) -> Result<Vec<u8>, NorcowError> {
        if !entry::verify(&self.flash, self.active, key, slot)? {
            log::error!("Checksum mismatch for key {:#06x}", key);
            return Err(NorcowError::Corrupted);
        }
        Ok(entry::read_payload(&self.flash, self.active, slot)?)
    }

    fn counter_words(&self, key: u16, slot: &Slot) -> Result<Vec<u32>, NorcowError> {
        Ok(counter::words_from_le_bytes(&self.read_slot(key, slot)?)?)
    }

    /// Returns the live value of `key`.
    ///
    /// Counters read as their value in little-endian bytes.
    pub fn get(&self, key: u16) -> Result<Option<Vec<u8>>, NorcowError> {
        let slot = match self.index.get(&key) {
            Some(slot) => *slot,
            None => return Ok(None),
        };
        match slot.kind {
            EntryKind::Counter => {
                let value = counter::decode_tally(&self.counter_words(key, &slot)?)?;
                Ok(Some(value.to_le_bytes().to_vec()))
            }
            _ => Ok(Some(self.read_slot(key, &slot)?)),
        }
    }

    pub fn contains(&self, key: u16) -> bool {
        self.index.contains_key(&key)
    }

    /// Live keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        self.index.keys().copied()
    }

    /// All live entries in ascending key order.
    pub fn entries(&self) -> Result<Vec<(u16, Vec<u8>)>, NorcowError> {
        let mut out = Vec::with_capacity(self.index.len());
        for key in self.keys() {
            if let Some(value) = self.get(key)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Stores `value` under `key`.
    ///
    /// Writing the value that is already stored is a no-op.
    pub fn set(&mut self, key: u16, value: &[u8]) -> Result<(), NorcowError> {
        if key == ERASED_KEY {
            return Err(NorcowError::InvalidKey);
        }
        if value.len() > self.max_value_len as usize {
            return Err(NorcowError::ValueTooLarge);
        }
        if let Some(slot) = self.index.get(&key).copied() {
            if slot.kind == EntryKind::Value {
                match self.read_slot(key, &slot) {
                    Ok(current) if current == value => return Ok(()),
                    Ok(_) | Err(NorcowError::Corrupted) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.append(EntryKind::Value, key, value)
    }

    /// Deletes `key`. Returns false if it was not present.
    pub fn delete(&mut self, key: u16) -> Result<bool, NorcowError> {
        if !self.index.contains_key(&key) {
            return Ok(false);
        }
        self.append(EntryKind::Tombstone, key, &[])?;
        Ok(true)
    }

    /// Stores a counter starting at `value`.
    pub fn set_counter(&mut self, key: u16, value: u32) -> Result<(), NorcowError> {
        if key == ERASED_KEY {
            return Err(NorcowError::InvalidKey);
        }
        let words = counter::encode_tally(value, entry::COUNTER_TAIL_WORDS);
        self.append(EntryKind::Counter, key, &counter::words_to_le_bytes(&words))
    }

    /// Current value of the counter under `key`.
    pub fn get_counter(&self, key: u16) -> Result<Option<u32>, NorcowError> {
        match self.index.get(&key) {
            Some(slot) if slot.kind == EntryKind::Counter => {
                Ok(Some(counter::decode_tally(&self.counter_words(key, slot)?)?))
            }
            _ => Ok(None),
        }
    }

    /// Increments the counter under `key` and returns the new value.
    ///
    /// A missing counter is created at zero. The increment clears a single
    /// tally bit in place; an exhausted tally is re-appended with a new base.
    pub fn next_counter(&mut self, key: u16) -> Result<u32, NorcowError> {
        let slot = match self.index.get(&key) {
            Some(slot) if slot.kind == EntryKind::Counter => *slot,
            _ => {
                self.set_counter(key, 0)?;
                return Ok(0);
            }
        };
        let words = self.counter_words(key, &slot)?;
        let value = counter::decode_tally(&words)?;
        let next = value.checked_add(1).ok_or(NorcowError::Corrupted)?;
        if !counter::is_canonical(&words[1..]) {
            log::warn!("Counter {:#06x} has a non-canonical tally", key);
        }
        match counter::next_step(&words[1..]) {
            Ok((index, word)) => {
                let offset = slot.payload_offset() + 4 * (1 + index as u32);
                self.flash.clear_bits(self.active, offset, &word.to_le_bytes())?;
            }
            Err(CounterError::Exhausted) => self.set_counter(key, next)?,
            Err(e) => return Err(e.into()),
        }
        Ok(next)
    }

    /// Bytes the live entries of every key but `key` take.
    fn live_bytes_without(&self, key: u16) -> u32 {
        self.index
            .iter()
            .filter(|(k, _)| **k != key)
            .map(|(_, slot)| slot.size())
            .sum()
    }

    fn append(&mut self, kind: EntryKind, key: u16, payload: &[u8]) -> Result<(), NorcowError> {
        let len = u16::try_from(payload.len()).map_err(|_| NorcowError::ValueTooLarge)?;
        let size = entry::entry_size(len);
        if size <= self.free_space() {
            let offset = self.free_offset;
            entry::write(&mut self.flash, self.active, offset, kind, key, payload)?;
            self.free_offset += size;
            if kind == EntryKind::Tombstone {
                self.index.remove(&key);
            } else {
                self.index.insert(key, Slot { offset, kind, len });
            }
            return Ok(());
        }

        // A compacted sector needs no tombstone; leaving the key out deletes it.
        let pending = match kind {
            EntryKind::Tombstone => None,
            _ => Some((kind, payload)),
        };
        let needed = pending.map_or(0, |_| size);
        if HEADER_LEN + self.live_bytes_without(key) + needed > self.sector_size {
            return Err(NorcowError::OutOfSpace);
        }
        self.compact(key, pending)
    }

    fn set_state(&mut self, state: NorcowState) {
        log::info!("Storage state transition: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Copies the live entries of every key but `key` into the standby
    /// sector, writes `pending` for `key` after them and promotes the standby.
    fn compact(&mut self, key: u16, pending: Option<(EntryKind, &[u8])>) -> Result<(), NorcowError> {
        self.set_state(NorcowState::Compacting);
        let target = ((self.active as usize + 1) % self.flash.sector_count() as usize) as SectorId;
        if !header::is_blank(&self.flash, target, self.sector_size)? {
            header::erase(&mut self.flash, target)?;
        }

        let mut index = BTreeMap::new();
        let mut offset = HEADER_LEN;
        let live: Vec<(u16, Slot)> = self.index.iter().map(|(k, s)| (*k, *s)).collect();
        for (live_key, slot) in live {
            if live_key == key {
                continue;
            }
            let size = if !entry::verify(&self.flash, self.active, live_key, &slot)? {
                // Moved as is so that reads keep reporting it.
                log::warn!("Carrying corrupted entry for key {:#06x} over", live_key);
                entry::copy(&mut self.flash, self.active, slot.offset, target, offset, slot.len)?
            } else if slot.kind == EntryKind::Counter {
                let value = counter::decode_tally(&self.counter_words(live_key, &slot)?)?;
                let words = counter::encode_tally(value, entry::COUNTER_TAIL_WORDS);
                let payload = counter::words_to_le_bytes(&words);
                entry::write(&mut self.flash, target, offset, EntryKind::Counter, live_key, &payload)?
            } else {
                entry::copy(&mut self.flash, self.active, slot.offset, target, offset, slot.len)?
            };
            index.insert(live_key, Slot { offset, kind: slot.kind, len: slot.len });
            offset += size;
        }

        if let Some((kind, payload)) = pending {
            let len = u16::try_from(payload.len()).map_err(|_| NorcowError::ValueTooLarge)?;
            let size = entry::write(&mut self.flash, target, offset, kind, key, payload)?;
            index.insert(key, Slot { offset, kind, len });
            offset += size;
        }

        let generation_words = header::next_generation(&self.generation_words)?;
        header::write_generation(&mut self.flash, target, &generation_words)?;
        header::seal(&mut self.flash, target)?;

        self.set_state(NorcowState::Erasing);
        let old = self.active;
        self.active = target;
        self.free_offset = offset;
        self.index = index;
        self.generation_words = generation_words;
        header::erase(&mut self.flash, old)?;

        self.set_state(NorcowState::Normal);
        log::info!(
            "Compacted into sector {} (generation {}, {} bytes free)",
            self.active,
            self.generation(),
            self.free_space()
        );
        Ok(())
    }

    /// Erases every sector and starts an empty log.
    ///
    /// The active sector goes first since it holds the data.
    pub fn wipe(&mut self) -> Result<(), NorcowError> {
        log::info!("Wiping storage");
        let generation_words = header::next_generation(&self.generation_words)?;
        header::erase(&mut self.flash, self.active)?;
        for sector in 0..self.flash.sector_count() {
            if sector != self.active && !header::is_blank(&self.flash, sector, self.sector_size)? {
                header::erase(&mut self.flash, sector)?;
            }
        }
        header::write_generation(&mut self.flash, self.active, &generation_words)?;
        header::seal(&mut self.flash, self.active)?;
        self.generation_words = generation_words;
        self.index.clear();
        self.free_offset = HEADER_LEN;
        self.state = NorcowState::Normal;
        Ok(())
    }
}

fn check_geometry<F: Flash>(flash: &F) -> Result<u32, NorcowError> {
    let count = flash.sector_count();
    if count < 2 {
        return Err(NorcowError::InvalidGeometry);
    }
    let size = flash.sector_size(0)?;
    for sector in 1..count {
        if flash.sector_size(sector)? != size {
            return Err(NorcowError::InvalidGeometry);
        }
    }
    if size % 4 != 0 || size < HEADER_LEN + ENTRY_OVERHEAD + COUNTER_LEN as u32 {
        return Err(NorcowError::InvalidGeometry);
    }
    Ok(size)
}

/// Picks the active sector and erases leftovers of an interrupted compaction.
fn recover<F: Flash>(flash: &mut F, sector_size: u32) -> Result<Option<SectorId>, NorcowError> {
    let mut valid = Vec::new();
    for sector in 0..flash.sector_count() {
        if let Some(header) = header::read(&*flash, sector)? {
            valid.push((sector, header.generation()?));
        }
    }
    let (active, generation) = match valid.iter().max_by_key(|(_, g)| *g) {
        Some(&best) => best,
        None => return Ok(None),
    };
    if valid.iter().filter(|(_, g)| *g == generation).count() > 1 {
        log::error!("Several storage sectors claim generation {}", generation);
        return Err(NorcowError::Corrupted);
    }

    for sector in 0..flash.sector_count() {
        if sector == active || header::is_blank(&*flash, sector, sector_size)? {
            continue;
        }
        log::warn!("Erasing stale sector {} left by an interrupted operation", sector);
        header::erase(flash, sector)?;
    }
    Ok(Some(active))
}

/// Erases every used sector and seals `active` with `generation_words`.
fn format<F: Flash>(
    flash: &mut F,
    sector_size: u32,
    active: SectorId,
    generation_words: &[u32],
) -> Result<(), NorcowError> {
    for sector in 0..flash.sector_count() {
        if !header::is_blank(&*flash, sector, sector_size)? {
            header::erase(flash, sector)?;
        }
    }
    header::write_generation(flash, active, generation_words)?;
    header::seal(flash, active)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::ram::RamFlash;
    use alloc::vec;

    /// Four 4-byte entries per sector.
    const SMALL: u32 = HEADER_LEN + 4 * 16;

    fn small() -> Norcow<RamFlash> {
        Norcow::open(RamFlash::new(2, SMALL)).unwrap()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_basic_operations() {
        let mut store = Norcow::open(RamFlash::new(2, 1024)).unwrap();
        assert_eq!(store.get(0x0101).unwrap(), None);

        store.set(0x0101, b"alpha").unwrap();
        store.set(0x0102, b"").unwrap();
        assert_eq!(store.get(0x0101).unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(store.get(0x0102).unwrap(), Some(vec![]));

        assert!(store.delete(0x0101).unwrap());
        assert!(!store.delete(0x0101).unwrap());
        assert_eq!(store.get(0x0101).unwrap(), None);
        assert_eq!(store.entries().unwrap(), vec![(0x0102, vec![])]);
    }

    #[test]
    fn test_last_writer_wins_across_reopen() {
        let mut store = Norcow::open(RamFlash::new(2, 256)).unwrap();
        let mut model = BTreeMap::new();
        for i in 0..200u32 {
            let key = (i % 7) as u16 + 1;
            if i % 5 == 3 {
                store.delete(key).unwrap();
                model.remove(&key);
            } else {
                let value = i.to_le_bytes().to_vec();
                store.set(key, &value).unwrap();
                model.insert(key, value);
            }
            for key in 1..=7u16 {
                assert_eq!(store.get(key).unwrap(), model.get(&key).cloned());
            }
        }
        let store = Norcow::open(store.into_flash()).unwrap();
        let expected: Vec<(u16, Vec<u8>)> = model.into_iter().collect();
        assert_eq!(store.entries().unwrap(), expected);
    }

    #[test]
    fn test_compaction_scenario() {
        let mut store = small();
        let (a, b, c) = (0x0A, 0x0B, 0x0C);
        store.set(a, b"x1x1").unwrap();
        store.set(b, b"y1y1").unwrap();
        store.set(a, b"x2x2").unwrap();
        store.set(a, b"x3x3").unwrap();
        assert_eq!(store.free_space(), 0);
        assert_eq!(store.active_sector(), 0);

        store.set(c, b"z1z1").unwrap();
        assert_eq!(store.active_sector(), 1);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.get(a).unwrap(), Some(b"x3x3".to_vec()));
        assert_eq!(store.get(b).unwrap(), Some(b"y1y1".to_vec()));
        assert_eq!(store.get(c).unwrap(), Some(b"z1z1".to_vec()));
        assert_eq!(store.free_space(), 16);

        let sector = store.flash().sector(1).to_vec();
        assert!(!contains(&sector, b"x1x1"));
        assert!(!contains(&sector, b"x2x2"));
        assert!(store.flash().is_erased(0, 8, SMALL - 8).unwrap());
        assert_eq!(store.erase_count(0).unwrap(), 1);
    }

    #[test]
    fn test_tombstones_reclaimed() {
        let mut store = small();
        store.set(1, b"aaaa").unwrap();
        store.set(2, b"bbbb").unwrap();
        store.delete(1).unwrap();
        store.set(3, b"cccc").unwrap();
        // Full; the next write compacts away key 1 and its tombstone.
        store.set(4, b"dddd").unwrap();
        assert_eq!(store.keys().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(store.free_space(), 16);
    }

    #[test]
    fn test_delete_in_full_sector() {
        let mut store = small();
        for key in 1..=4u16 {
            store.set(key, b"full").unwrap();
        }
        assert!(store.delete(2).unwrap());
        assert_eq!(store.keys().collect::<Vec<_>>(), vec![1, 3, 4]);
        let store = Norcow::open(store.into_flash()).unwrap();
        assert_eq!(store.get(2).unwrap(), None);
    }

    #[test]
    fn test_value_too_large() {
        let mut store = small();
        store.set(1, b"keep").unwrap();
        let before = store.flash().clone();
        let limit = store.max_value_len() as usize;
        assert_eq!(limit, SMALL as usize - 32);

        assert_eq!(store.set(2, &vec![0u8; limit + 1]), Err(NorcowError::ValueTooLarge));
        assert_eq!(store.flash(), &before);
        assert_eq!(store.get(1).unwrap(), Some(b"keep".to_vec()));
    }

    #[test]
    fn test_update_largest_value() {
        let mut store = small();
        let limit = store.max_value_len() as usize;
        store.set(1, &vec![0xAA; limit]).unwrap();
        assert_eq!(store.free_space(), 0);

        store.set(1, &vec![0xBB; limit]).unwrap();
        assert_eq!(store.generation(), 1);
        assert_eq!(store.get(1).unwrap(), Some(vec![0xBB; limit]));
        let store = Norcow::open(store.into_flash()).unwrap();
        assert_eq!(store.get(1).unwrap(), Some(vec![0xBB; limit]));
    }

    #[test]
    fn test_update_value_over_half_a_sector() {
        let mut store = Norcow::open(RamFlash::new(2, 4096)).unwrap();
        store.set(7, b"small").unwrap();
        store.set(1, &vec![1u8; 2000]).unwrap();
        store.set(1, &vec![2u8; 2100]).unwrap();
        assert_eq!(store.get(1).unwrap(), Some(vec![2u8; 2100]));
        assert_eq!(store.get(7).unwrap(), Some(b"small".to_vec()));
        assert_eq!(store.free_space(), 4096 - HEADER_LEN - 20 - 2112);
    }

    #[test]
    fn test_configured_limit() {
        let store = Norcow::open_with_limit(RamFlash::new(2, 1024), Some(64)).unwrap();
        assert_eq!(store.max_value_len(), 64);
    }

    #[test]
    fn test_out_of_space() {
        let mut store = small();
        store.set(1, &[1u8; 20]).unwrap();
        store.set(2, &[2u8; 20]).unwrap();
        assert_eq!(store.set(3, &[3u8; 20]), Err(NorcowError::OutOfSpace));
        assert_eq!(store.get(2).unwrap(), Some(vec![2u8; 20]));
    }

    #[test]
    fn test_invalid_key() {
        let mut store = small();
        assert_eq!(store.set(0xFFFF, b"x"), Err(NorcowError::InvalidKey));
        assert_eq!(store.set_counter(0xFFFF, 1), Err(NorcowError::InvalidKey));
    }

    #[test]
    fn test_unchanged_value_not_rewritten() {
        let mut store = Norcow::open(RamFlash::new(2, 256)).unwrap();
        store.set(5, b"same").unwrap();
        let ops = store.flash().ops();
        store.set(5, b"same").unwrap();
        assert_eq!(store.flash().ops(), ops);
    }

    #[test]
    fn test_clean_open_does_not_write() {
        let mut store = Norcow::open(RamFlash::new(2, 256)).unwrap();
        store.set(5, b"v").unwrap();
        let flash = store.into_flash();
        let ops = flash.ops();
        let store = Norcow::open(flash).unwrap();
        assert_eq!(store.flash().ops(), ops);
    }

    #[test]
    fn test_counters() {
        let mut store = Norcow::open(RamFlash::new(2, 512)).unwrap();
        assert_eq!(store.get_counter(9).unwrap(), None);
        assert_eq!(store.next_counter(9).unwrap(), 0);

        let free = store.free_space();
        for expected in 1..=64 {
            assert_eq!(store.next_counter(9).unwrap(), expected);
        }
        // The tally absorbed every increment in place.
        assert_eq!(store.free_space(), free);

        // Exhausted: a fresh entry with a new base.
        assert_eq!(store.next_counter(9).unwrap(), 65);
        assert!(store.free_space() < free);
        assert_eq!(store.get(9).unwrap(), Some(65u32.to_le_bytes().to_vec()));

        let mut store = Norcow::open(store.into_flash()).unwrap();
        assert_eq!(store.get_counter(9).unwrap(), Some(65));
        store.set_counter(9, 1000).unwrap();
        assert_eq!(store.next_counter(9).unwrap(), 1001);
    }

    #[test]
    fn test_counter_survives_compaction() {
        let mut store = Norcow::open(RamFlash::new(2, 128)).unwrap();
        for _ in 0..10 {
            store.next_counter(1).unwrap();
        }
        for i in 0..20u32 {
            store.set(2, &i.to_le_bytes()).unwrap();
        }
        assert!(store.generation() > 0);
        assert_eq!(store.get_counter(1).unwrap(), Some(9));
    }

    #[test]
    fn test_generation_tally_rebase() {
        let mut store = small();
        let mut last = store.generation();
        for i in 0..400u32 {
            store.set(1, &i.to_le_bytes()).unwrap();
            assert!(store.generation() >= last);
            last = store.generation();
        }
        assert!(last > 64);
        let store = Norcow::open(store.into_flash()).unwrap();
        assert_eq!(store.generation(), last);
        assert_eq!(store.get(1).unwrap(), Some(399u32.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_recovers_interrupted_erase() {
        let mut store = small();
        for i in 0..4u32 {
            store.set(i as u16, &i.to_le_bytes()).unwrap();
        }
        let before_old = store.flash().sector(0).to_vec();
        store.set(9, b"next").unwrap();

        // Put the old sector back as if the final erase never happened.
        let mut flash = store.into_flash();
        for (offset, byte) in before_old.iter().enumerate() {
            flash.tamper(0, offset as u32, *byte);
        }
        let store = Norcow::open(flash).unwrap();
        assert_eq!(store.active_sector(), 1);
        assert_eq!(store.get(9).unwrap(), Some(b"next".to_vec()));
        assert!(store.flash().is_erased(0, 8, SMALL - 8).unwrap());
    }

    #[test]
    fn test_equal_generations_rejected() {
        let mut flash = RamFlash::new(2, SMALL);
        for sector in 0..2 {
            header::write_generation(&mut flash, sector, &counter::encode_tally(3, 2)).unwrap();
            header::seal(&mut flash, sector).unwrap();
        }
        assert!(matches!(Norcow::open(flash), Err(NorcowError::Corrupted)));
    }

    #[test]
    fn test_tampered_entry_is_corrupted() {
        let mut store = Norcow::open(RamFlash::new(2, 256)).unwrap();
        store.set(1, b"data").unwrap();
        store.set(2, b"other").unwrap();
        let mut flash = store.into_flash();
        flash.tamper(0, HEADER_LEN + 5, b'X');

        let mut store = Norcow::open(flash).unwrap();
        assert_eq!(store.get(1), Err(NorcowError::Corrupted));
        assert!(store.contains(1));
        assert_eq!(store.get(2).unwrap(), Some(b"other".to_vec()));

        // Writing the key again replaces the damaged entry.
        store.set(1, b"data").unwrap();
        assert_eq!(store.get(1).unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn test_damage_in_shadowed_entry_is_ignored() {
        let mut store = Norcow::open(RamFlash::new(2, 256)).unwrap();
        store.set(1, b"old-value").unwrap();
        store.set(1, b"new-value").unwrap();
        store.set(2, b"other").unwrap();
        let mut flash = store.into_flash();
        let byte = flash.sector(0)[(HEADER_LEN + 4) as usize];
        flash.tamper(0, HEADER_LEN + 4, byte & 0xFE);

        let store = Norcow::open(flash).unwrap();
        assert_eq!(store.get(1).unwrap(), Some(b"new-value".to_vec()));
        assert_eq!(store.get(2).unwrap(), Some(b"other".to_vec()));
    }

    #[test]
    fn test_corrupted_entry_survives_compaction() {
        let mut store = small();
        store.set(1, b"aaaa").unwrap();
        store.set(2, b"bbbb").unwrap();
        let mut flash = store.into_flash();
        flash.tamper(0, HEADER_LEN + 4, b'X');

        let mut store = Norcow::open(flash).unwrap();
        for i in 0..3u32 {
            store.set(2, &i.to_le_bytes()).unwrap();
        }
        assert_eq!(store.active_sector(), 1);
        assert_eq!(store.get(1), Err(NorcowError::Corrupted));
        assert_eq!(store.get(2).unwrap(), Some(2u32.to_le_bytes().to_vec()));

        let mut store = Norcow::open(store.into_flash()).unwrap();
        assert_eq!(store.get(1), Err(NorcowError::Corrupted));
        assert!(store.delete(1).unwrap());
        assert_eq!(store.get(1).unwrap(), None);
    }

    #[test]
    fn test_geometry() {
        assert!(matches!(Norcow::open(RamFlash::new(1, 1024)), Err(NorcowError::InvalidGeometry)));
        assert!(matches!(Norcow::open(RamFlash::new(2, 32)), Err(NorcowError::InvalidGeometry)));
    }

    #[test]
    fn test_wipe() {
        let mut store = small();
        for i in 0..6u32 {
            store.set(1, &i.to_le_bytes()).unwrap();
        }
        store.set(2, b"seed").unwrap();
        let generation = store.generation();
        store.wipe().unwrap();
        assert_eq!(store.keys().count(), 0);
        assert!(store.generation() > generation);

        let flash = store.into_flash();
        assert!(!contains(flash.sector(0), b"seed"));
        assert!(!contains(flash.sector(1), b"seed"));
        let store = Norcow::open(flash).unwrap();
        assert_eq!(store.get(2).unwrap(), None);
    }

    /// Cuts power inside every flash operation of `op`, after every possible
    /// number of written bytes, and checks that each key reads either its old
    /// or its new value afterwards.
    fn crash_everywhere(base: &RamFlash, op: impl Fn(&mut Norcow<RamFlash>), key: u16, old: Option<&[u8]>, new: Option<&[u8]>) {
        let start = base.ops();
        let mut dry_run = Norcow::open(base.clone()).unwrap();
        let others: Vec<(u16, Vec<u8>)> = dry_run.entries().unwrap().into_iter().filter(|(k, _)| *k != key).collect();
        op(&mut dry_run);
        let total = dry_run.flash().ops() - start;
        assert!(total > 0);
        let widest = base.sector(0).len();

        for k in 0..total {
            for torn in 0..=widest {
                let mut flash = base.clone();
                flash.cut_power_within(start + k, torn);
                let mut store = Norcow::open(flash).unwrap();
                op(&mut store);

                let mut flash = store.into_flash();
                flash.restore_power();
                let store = Norcow::open(flash).unwrap();
                let value = store.get(key).unwrap();
                assert!(
                    value.as_deref() == old || value.as_deref() == new,
                    "cut in op {} after {} bytes: unexpected {:?}",
                    k,
                    torn,
                    value
                );
                for (other, expected) in &others {
                    assert_eq!(store.get(*other).unwrap().as_ref(), Some(expected), "cut in op {} after {} bytes", k, torn);
                }
            }
        }
    }

    #[test]
    fn test_power_cut_during_compacting_set() {
        let mut store = small();
        store.set(1, b"old1").unwrap();
        store.set(2, b"keep").unwrap();
        store.set(3, b"tmp3").unwrap();
        store.set(3, b"tmp4").unwrap();
        assert_eq!(store.free_space(), 0);
        let base = store.into_flash();

        crash_everywhere(&base, |s| { let _ = s.set(1, b"new1"); }, 1, Some(&b"old1"[..]), Some(&b"new1"[..]));
    }

    #[test]
    fn test_power_cut_during_largest_update() {
        let mut store = small();
        let limit = store.max_value_len() as usize;
        store.set(1, &vec![0xAA; limit]).unwrap();
        let base = store.into_flash();
        let (old, new) = (vec![0xAA; limit], vec![0xBB; limit]);

        crash_everywhere(&base, |s| { let _ = s.set(1, &vec![0xBB; limit]); }, 1, Some(&old[..]), Some(&new[..]));
    }

    #[test]
    fn test_power_cut_during_plain_set() {
        let mut store = Norcow::open(RamFlash::new(2, 256)).unwrap();
        store.set(1, b"before").unwrap();
        store.set(2, b"other").unwrap();
        let base = store.into_flash();

        crash_everywhere(&base, |s| { let _ = s.set(1, b"after!"); }, 1, Some(&b"before"[..]), Some(&b"after!"[..]));
    }

    #[test]
    fn test_power_cut_during_delete() {
        let mut store = small();
        for key in 1..=4u16 {
            store.set(key, b"full").unwrap();
        }
        let base = store.into_flash();

        crash_everywhere(&base, |s| { let _ = s.delete(3); }, 3, Some(&b"full"[..]), None);
    }

    #[test]
    fn test_power_cut_during_counter_increment() {
        let mut store = Norcow::open(RamFlash::new(2, 128)).unwrap();
        store.set(1, b"keep").unwrap();
        store.set_counter(2, 40).unwrap();
        store.next_counter(2).unwrap();
        let base = store.into_flash();

        let (old, new) = (41u32.to_le_bytes(), 42u32.to_le_bytes());
        crash_everywhere(&base, |s| { let _ = s.next_counter(2); }, 2, Some(&old[..]), Some(&new[..]));
    }

    #[test]
    fn test_power_cut_during_counter_rebase() {
        let mut store = small();
        store.set(1, b"aaaa").unwrap();
        store.set(3, b"bbbb").unwrap();
        for _ in 0..=64 {
            store.next_counter(2).unwrap();
        }
        // Tally exhausted and no room left: the next step compacts.
        assert_eq!(store.get_counter(2).unwrap(), Some(64));
        assert!(store.free_space() < entry::entry_size(COUNTER_LEN));
        let base = store.into_flash();

        let (old, new) = (64u32.to_le_bytes(), 65u32.to_le_bytes());
        crash_everywhere(&base, |s| { let _ = s.next_counter(2); }, 2, Some(&old[..]), Some(&new[..]));
    }

    #[test]
    fn test_power_cut_during_wipe() {
        let mut store = small();
        store.set(1, b"aaaa").unwrap();
        store.set(2, b"bbbb").unwrap();
        let base = store.into_flash();
        let start = base.ops();

        let mut dry_run = Norcow::open(base.clone()).unwrap();
        dry_run.wipe().unwrap();
        let total = dry_run.flash().ops() - start;

        for k in 0..total {
            for torn in 0..=SMALL as usize {
                let mut flash = base.clone();
                flash.cut_power_within(start + k, torn);
                let mut store = Norcow::open(flash).unwrap();
                let _ = store.wipe();

                let mut flash = store.into_flash();
                flash.restore_power();
                let store = Norcow::open(flash).unwrap();
                let keys: Vec<u16> = store.keys().collect();
                // Either nothing happened yet or everything is gone.
                assert!(keys.is_empty() || keys == vec![1, 2], "cut in op {} after {} bytes", k, torn);
            }
        }
    }
}
