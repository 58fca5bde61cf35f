//! Sector header.
//!
//! ```text
//! offset  0: magic            written last, proves the sector is complete
//! offset  4: erase count      written right after every erase
//! offset  8: generation base
//! offset 12: generation tally (2 words)
//! offset 20: first entry
//! ```
//!
//! The generation is a tally counter. A freshly compacted sector carries the
//! words of the previous one with one more tally bit cleared; once the tally
//! runs out the base absorbs it and the tally starts over.

use alloc::vec::Vec;

use crate::counter::{self, CounterError};
use crate::flash::{Flash, FlashError, SectorId};

/// Marks a sector whose header and entries were fully written ("NRC2").
pub const MAGIC: u32 = 0x3243_524E;

pub const MAGIC_OFFSET: u32 = 0;
pub const ERASE_COUNT_OFFSET: u32 = 4;
pub const GENERATION_OFFSET: u32 = 8;

/// Tally words following the generation base.
pub const GENERATION_TALLY_WORDS: usize = 2;

/// Length of the header; entries start here.
pub const HEADER_LEN: u32 = GENERATION_OFFSET + 4 * (1 + GENERATION_TALLY_WORDS as u32);

/// Decoded header of a valid sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorHeader {
    pub erase_count: u32,
    pub generation_words: Vec<u32>,
}

impl SectorHeader {
    pub fn generation(&self) -> Result<u32, CounterError> {
        counter::decode_tally(&self.generation_words)
    }
}

/// Reads the header of `sector`. Returns None if the magic is missing.
pub fn read<F: Flash>(flash: &F, sector: SectorId) -> Result<Option<SectorHeader>, FlashError> {
    if flash.read_word(sector, MAGIC_OFFSET)? != MAGIC {
        return Ok(None);
    }
    let mut buf = [0u8; 4 * (1 + GENERATION_TALLY_WORDS)];
    flash.read(sector, GENERATION_OFFSET, &mut buf)?;
    let generation_words = buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();
    if !counter::is_canonical(&generation_words[1..]) {
        log::warn!("Sector {} has a non-canonical generation tally", sector);
    }
    Ok(Some(SectorHeader {
        erase_count: erase_count(flash, sector)?,
        generation_words,
    }))
}

/// Number of times `sector` has been erased by this engine.
///
/// An erase interrupted before the count was rewritten reads as zero.
pub fn erase_count<F: Flash>(flash: &F, sector: SectorId) -> Result<u32, FlashError> {
    let word = flash.read_word(sector, ERASE_COUNT_OFFSET)?;
    Ok(if word == counter::ERASED_WORD { 0 } else { word })
}

/// Returns true if nothing but the erase count has been written to `sector`.
pub fn is_blank<F: Flash>(flash: &F, sector: SectorId, sector_size: u32) -> Result<bool, FlashError> {
    Ok(flash.is_erased(sector, MAGIC_OFFSET, 4)?
        && flash.is_erased(sector, GENERATION_OFFSET, sector_size - GENERATION_OFFSET)?)
}

/// Erases `sector` and carries its erase count over, incremented.
pub fn erase<F: Flash>(flash: &mut F, sector: SectorId) -> Result<u32, FlashError> {
    let count = erase_count(&*flash, sector)?.saturating_add(1);
    flash.erase_sector(sector)?;
    flash.program_word(sector, ERASE_COUNT_OFFSET, count)?;
    Ok(count)
}

/// Generation words of the sector that follows one holding `words`.
pub fn next_generation(words: &[u32]) -> Result<Vec<u32>, CounterError> {
    let (&base, tally) = words.split_first().ok_or(CounterError::Malformed)?;
    match counter::encode_increment(tally) {
        Ok(next) => {
            let mut out = Vec::with_capacity(words.len());
            out.push(base);
            out.extend(next);
            Ok(out)
        }
        Err(CounterError::Exhausted) => {
            let value = counter::decode_tally(words)?;
            let value = value.checked_add(1).ok_or(CounterError::Overflow)?;
            log::debug!("Generation tally exhausted, rebasing at {}", value);
            Ok(counter::encode_tally(value, GENERATION_TALLY_WORDS))
        }
        Err(e) => Err(e),
    }
}

/// Programs the generation words. The magic is left for [`seal`].
pub fn write_generation<F: Flash>(flash: &mut F, sector: SectorId, words: &[u32]) -> Result<(), FlashError> {
    flash.program(sector, GENERATION_OFFSET, &counter::words_to_le_bytes(words))
}

/// Marks `sector` valid.
pub fn seal<F: Flash>(flash: &mut F, sector: SectorId) -> Result<(), FlashError> {
    flash.program_word(sector, MAGIC_OFFSET, MAGIC)
}
