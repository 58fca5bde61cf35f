//! Monotonic counters kept as runs of flash words with a shrinking bit population.
//!
//! A counter is a run of 32-bit flash words. Counting up clears exactly one
//! more bit, so the only way to make the value smaller is to erase, and
//! erasing is a sector-lifecycle event the sector log can see.
//!
//! # Encoding order
//! Bits are cleared word by word, starting at the first word, and within a
//! word from the most significant bit down (`w -> w >> 1`). A run in strict
//! order therefore looks like `0x0000_0000 .. 0x0000_0000, 0x0000_FFFF >> k,
//! 0xFFFF_FFFF ..`.
//!
//! # Decoding
//! The value is the number of zero bits in the run, for any bit pattern. An
//! interrupted program leaves fewer cleared bits and decodes to a smaller but
//! valid value. A run with holes is still decoded as its zero count (the safe
//! direction is to under-count); [`is_canonical`] lets callers detect it.
//!
//! # Tally counters
//! Counters that must outlive one run use a base word followed by tally words
//! (`[base, tally..]`), decoding to `base + decode(tally)`. When the tally is
//! exhausted the owner writes a fresh run whose base is the next value.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Bits in one counter word.
pub const WORD_BITS: u32 = 32;

/// Value of an erased word.
pub const ERASED_WORD: u32 = u32::MAX;

/// Counter codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    /// Every bit of the run is already cleared.
    Exhausted,
    /// The decoded value does not fit in 32 bits.
    Overflow,
    /// The run has no words or its byte length is not a multiple of 4.
    Malformed,
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterError::Exhausted => write!(f, "Counter run exhausted"),
            CounterError::Overflow => write!(f, "Counter value overflow"),
            CounterError::Malformed => write!(f, "Malformed counter run"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CounterError {}

/// Population count of `value` (branch-free SWAR).
pub fn hamming_weight(value: u32) -> u32 {
    let mut v = value;
    v = v - ((v >> 1) & 0x5555_5555);
    v = (v & 0x3333_3333) + ((v >> 2) & 0x3333_3333);
    v = (v + (v >> 4)) & 0x0F0F_0F0F;
    v = v + (v >> 8);
    v = v + (v >> 16);
    v & 0x3F
}

/// Number of bits a run of `words` can count.
pub fn capacity(words: &[u32]) -> u32 {
    words.len() as u32 * WORD_BITS
}

/// Decodes a run: the number of zero bits across all words.
pub fn decode(words: &[u32]) -> u32 {
    words.iter().map(|&w| hamming_weight(!w)).sum()
}

/// Position and new contents of the word the next increment changes.
///
/// Only that one word differs between a run and its successor, so it is the
/// only word that has to be re-programmed.
pub fn next_step(words: &[u32]) -> Result<(usize, u32), CounterError> {
    let index = words.iter().position(|&w| w != 0).ok_or(CounterError::Exhausted)?;
    let word = words[index];
    // Clearing the highest set bit is `word >> 1` for canonical words and
    // still removes exactly one bit from a word with holes.
    let next = word & !(1u32 << (31 - word.leading_zeros()));
    Ok((index, next))
}

/// Returns the run with exactly one more bit cleared.
pub fn encode_increment(words: &[u32]) -> Result<Vec<u32>, CounterError> {
    let (index, word) = next_step(words)?;
    let mut next = words.to_vec();
    next[index] = word;
    Ok(next)
}

/// A fresh run of `len` words counting from zero.
pub fn fresh(len: usize) -> Vec<u32> {
    vec![ERASED_WORD; len]
}

/// Returns true if `word` has the form `0..01..1`.
fn is_canonical_word(word: u32) -> bool {
    word.checked_add(1).map_or(true, |w| w & word == 0)
}

/// Returns true if the run could have been produced by sequential increments.
pub fn is_canonical(words: &[u32]) -> bool {
    let mut seen_partial = false;
    for &word in words {
        if seen_partial && word != ERASED_WORD {
            return false;
        }
        if !is_canonical_word(word) {
            return false;
        }
        if word != 0 {
            seen_partial = true;
        }
    }
    true
}

/// Encodes `value` as a tally counter with `tally_words` unused tally words.
pub fn encode_tally(value: u32, tally_words: usize) -> Vec<u32> {
    let mut words = Vec::with_capacity(1 + tally_words);
    words.push(value);
    words.extend(fresh(tally_words));
    words
}

/// Decodes a tally counter `[base, tally..]`.
pub fn decode_tally(words: &[u32]) -> Result<u32, CounterError> {
    let (&base, tally) = words.split_first().ok_or(CounterError::Malformed)?;
    base.checked_add(decode(tally)).ok_or(CounterError::Overflow)
}

/// Splits little-endian bytes into words.
pub fn words_from_le_bytes(bytes: &[u8]) -> Result<Vec<u32>, CounterError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(CounterError::Malformed);
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Serializes words as little-endian bytes.
pub fn words_to_le_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
