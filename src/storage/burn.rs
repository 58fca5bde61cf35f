//! Key burning.
//!
//! Cached key material is destroyed when the store is locked or wiped. With
//! the `paranoid` feature the buffer is overwritten several times with
//! volatile writes before the final zeroization.

use zeroize::{Zeroize, Zeroizing};

/// Irreversibly overwrites `slice`.
#[inline(never)]
pub fn burn_slice(slice: &mut [u8]) {
    #[cfg(feature = "paranoid")]
    {
        for pattern in [0xFFu8, 0xAA, 0x55] {
            for byte in slice.iter_mut() {
                // SAFETY: `byte` is a valid, exclusive reference into `slice`.
                unsafe { core::ptr::write_volatile(byte, pattern) };
            }
            core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        }
    }

    slice.zeroize();
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

/// Burns and drops a cached key, if any.
pub fn burn_key<const N: usize>(slot: &mut Option<Zeroizing<[u8; N]>>) {
    if let Some(mut key) = slot.take() {
        burn_slice(&mut key[..]);
    }
}
