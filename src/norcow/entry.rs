//! Entry layout.
//!
//! ```text
//! key: u16 | len: u16 | payload, zero-padded to 4 bytes | checksum: u32 | commit: u32
//! ```
//!
//! An entry is appended in two program steps: prefix and payload, then the
//! trailer. The commit word lands last, so an entry without a known commit
//! word was torn by a power cut and is skipped. The checksum is the first
//! word of a BLAKE3 hash over the commit word, key, length and payload.
//!
//! Counter entries carry `[base, tally..]`; the checksum only covers the
//! base so the tally can be updated in place.

use alloc::vec;
use alloc::vec::Vec;

use crate::flash::{Flash, FlashError, SectorId};

pub const PREFIX_LEN: u32 = 4;
pub const TRAILER_LEN: u32 = 8;

/// Bytes an entry takes besides its padded payload.
pub const ENTRY_OVERHEAD: u32 = PREFIX_LEN + TRAILER_LEN;

/// Tally words of a counter entry.
pub const COUNTER_TAIL_WORDS: usize = 2;

/// Payload length of a counter entry.
pub const COUNTER_LEN: u16 = 4 * (1 + COUNTER_TAIL_WORDS as u16);

/// Key value that can never be stored; an erased prefix reads as it.
pub const ERASED_KEY: u16 = 0xFFFF;

const COMMIT_VALUE: u32 = 0xC35A_69A5;
const COMMIT_TOMBSTONE: u32 = 0x3CA5_965A;
const COMMIT_COUNTER: u32 = 0x5AC3_A569;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Value,
    Tombstone,
    Counter,
}

impl EntryKind {
    pub fn commit_word(self) -> u32 {
        match self {
            EntryKind::Value => COMMIT_VALUE,
            EntryKind::Tombstone => COMMIT_TOMBSTONE,
            EntryKind::Counter => COMMIT_COUNTER,
        }
    }

    pub fn from_commit_word(word: u32) -> Option<Self> {
        match word {
            COMMIT_VALUE => Some(EntryKind::Value),
            COMMIT_TOMBSTONE => Some(EntryKind::Tombstone),
            COMMIT_COUNTER => Some(EntryKind::Counter),
            _ => None,
        }
    }
}

pub fn align4(len: u32) -> u32 {
    (len + 3) & !3
}

/// Total bytes of an entry with a `len`-byte payload.
pub fn entry_size(len: u16) -> u32 {
    ENTRY_OVERHEAD + align4(len as u32)
}

/// Checksum of an entry. Counters pass only their base word as `covered`.
pub fn checksum(kind: EntryKind, key: u16, len: u16, covered: &[u8]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&kind.commit_word().to_le_bytes());
    hasher.update(&key.to_le_bytes());
    hasher.update(&len.to_le_bytes());
    hasher.update(covered);
    let hash = hasher.finalize();
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn covered(kind: EntryKind, payload: &[u8]) -> &[u8] {
    match kind {
        EntryKind::Counter => &payload[..payload.len().min(4)],
        _ => payload,
    }
}

/// Appends an entry at `offset` and returns its size.
pub fn write<F: Flash>(
    flash: &mut F,
    sector: SectorId,
    offset: u32,
    kind: EntryKind,
    key: u16,
    payload: &[u8],
) -> Result<u32, FlashError> {
    let len = u16::try_from(payload.len()).map_err(|_| FlashError::OutOfBounds)?;
    let padded = align4(len as u32) as usize;

    let mut head = vec![0u8; PREFIX_LEN as usize + padded];
    head[..2].copy_from_slice(&key.to_le_bytes());
    head[2..4].copy_from_slice(&len.to_le_bytes());
    head[4..4 + payload.len()].copy_from_slice(payload);
    flash.program(sector, offset, &head)?;

    let mut trailer = [0u8; TRAILER_LEN as usize];
    trailer[..4].copy_from_slice(&checksum(kind, key, len, covered(kind, payload)).to_le_bytes());
    trailer[4..].copy_from_slice(&kind.commit_word().to_le_bytes());
    flash.program(sector, offset + PREFIX_LEN + padded as u32, &trailer)?;

    Ok(entry_size(len))
}

/// Copies a committed entry byte for byte into another sector.
pub fn copy<F: Flash>(
    flash: &mut F,
    from: SectorId,
    from_offset: u32,
    to: SectorId,
    to_offset: u32,
    len: u16,
) -> Result<u32, FlashError> {
    let head_len = (PREFIX_LEN + align4(len as u32)) as usize;
    let mut head = vec![0u8; head_len];
    flash.read(from, from_offset, &mut head)?;
    let mut trailer = [0u8; TRAILER_LEN as usize];
    flash.read(from, from_offset + head_len as u32, &mut trailer)?;

    flash.program(to, to_offset, &head)?;
    flash.program(to, to_offset + head_len as u32, &trailer)?;
    Ok(entry_size(len))
}

/// Location of a committed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u32,
    pub kind: EntryKind,
    pub len: u16,
}

impl Slot {
    pub fn payload_offset(&self) -> u32 {
        self.offset + PREFIX_LEN
    }

    pub fn size(&self) -> u32 {
        entry_size(self.len)
    }
}

/// Outcome of reading the log at one offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Erased space: the log ends here.
    End,
    /// The entry never committed.
    Torn { key: u16, next: u32 },
    /// A committed entry.
    Entry { key: u16, slot: Slot, next: u32 },
    /// The length runs past the sector end.
    Overrun,
    /// A committed entry whose checksum does not match.
    BadChecksum { key: u16, slot: Slot, next: u32 },
}

/// Reads the entry starting at `offset`.
pub fn step<F: Flash>(flash: &F, sector: SectorId, offset: u32, sector_size: u32) -> Result<Step, FlashError> {
    if offset + PREFIX_LEN > sector_size {
        return Ok(Step::End);
    }
    let prefix = flash.read_word(sector, offset)?;
    if prefix == u32::MAX {
        return Ok(Step::End);
    }
    let key = prefix as u16;
    let len = (prefix >> 16) as u16;
    let size = entry_size(len);
    if offset as u64 + size as u64 > sector_size as u64 {
        return Ok(Step::Overrun);
    }
    let next = offset + size;
    let trailer_offset = next - TRAILER_LEN;

    let kind = match EntryKind::from_commit_word(flash.read_word(sector, trailer_offset + 4)?) {
        Some(kind) => kind,
        None => return Ok(Step::Torn { key, next }),
    };
    let slot = Slot { offset, kind, len };
    if !verify(flash, sector, key, &slot)? {
        return Ok(Step::BadChecksum { key, slot, next });
    }
    Ok(Step::Entry { key, slot, next })
}

/// Reads the payload of `slot`.
pub fn read_payload<F: Flash>(flash: &F, sector: SectorId, slot: &Slot) -> Result<Vec<u8>, FlashError> {
    let mut payload = vec![0u8; slot.len as usize];
    flash.read(sector, slot.payload_offset(), &mut payload)?;
    Ok(payload)
}

/// Checks the stored checksum of `slot` against its contents.
pub fn verify<F: Flash>(flash: &F, sector: SectorId, key: u16, slot: &Slot) -> Result<bool, FlashError> {
    let payload = read_payload(flash, sector, slot)?;
    let stored = flash.read_word(sector, slot.offset + slot.size() - TRAILER_LEN)?;
    Ok(stored == checksum(slot.kind, key, slot.len, covered(slot.kind, &payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::ram::RamFlash;

    #[test]
    fn test_sizes() {
        assert_eq!(entry_size(0), 12);
        assert_eq!(entry_size(1), 16);
        assert_eq!(entry_size(4), 16);
        assert_eq!(entry_size(5), 20);
        assert_eq!(entry_size(COUNTER_LEN), 24);
    }

    #[test]
    fn test_write_and_step() {
        let mut flash = RamFlash::new(1, 64);
        let size = write(&mut flash, 0, 0, EntryKind::Value, 0x0102, b"abc").unwrap();
        assert_eq!(size, 16);

        match step(&flash, 0, 0, 64).unwrap() {
            Step::Entry { key, slot, next } => {
                assert_eq!(key, 0x0102);
                assert_eq!(slot.kind, EntryKind::Value);
                assert_eq!(next, 16);
                assert_eq!(read_payload(&flash, 0, &slot).unwrap(), b"abc");
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(step(&flash, 0, 16, 64).unwrap(), Step::End);
    }

    #[test]
    fn test_torn_entry() {
        let mut flash = RamFlash::new(1, 64);
        flash.cut_power_at(1);
        assert!(write(&mut flash, 0, 0, EntryKind::Value, 7, b"xy").is_err());
        assert_eq!(step(&flash, 0, 0, 64).unwrap(), Step::Torn { key: 7, next: 16 });
    }

    #[test]
    fn test_bad_checksum() {
        let mut flash = RamFlash::new(1, 64);
        write(&mut flash, 0, 0, EntryKind::Value, 7, b"xy").unwrap();
        flash.tamper(0, 5, b'z');
        let slot = Slot { offset: 0, kind: EntryKind::Value, len: 2 };
        assert_eq!(step(&flash, 0, 0, 64).unwrap(), Step::BadChecksum { key: 7, slot, next: 16 });
    }

    #[test]
    fn test_overrun() {
        let mut flash = RamFlash::new(1, 64);
        flash.program(0, 0, &[0x01, 0x00, 0x00, 0x10]).unwrap();
        assert_eq!(step(&flash, 0, 0, 64).unwrap(), Step::Overrun);
    }

    #[test]
    fn test_counter_tally_outside_checksum() {
        let mut flash = RamFlash::new(1, 64);
        let payload = crate::counter::words_to_le_bytes(&[5, u32::MAX, u32::MAX]);
        write(&mut flash, 0, 0, EntryKind::Counter, 9, &payload).unwrap();
        flash.clear_bits(0, 8, &0x7FFF_FFFFu32.to_le_bytes()).unwrap();
        assert!(matches!(step(&flash, 0, 0, 64).unwrap(), Step::Entry { .. }));
    }

    #[test]
    fn test_copy_is_verbatim() {
        let mut flash = RamFlash::new(2, 64);
        write(&mut flash, 0, 0, EntryKind::Value, 3, b"hello").unwrap();
        copy(&mut flash, 0, 0, 1, 8, 5).unwrap();
        assert_eq!(flash.sector(0)[..20], flash.sector(1)[8..28]);
    }
}
