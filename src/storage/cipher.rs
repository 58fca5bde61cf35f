//! Value encryption and PIN key derivation.
//!
//! # Scheme
//! 1. **KEK**: Scrypt(PIN, hardware salt || random salt)
//! 2. **DEK**: random, sealed under the KEK and kept in the store
//! 3. **Values**: ChaCha20-Poly1305 under the DEK, `nonce || ciphertext`,
//!    with the storage key as associated data so records cannot be swapped.

use alloc::vec::Vec;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use super::StorageError;
use crate::config::KdfConfig;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 16;

/// Bytes added to a value by [`seal`].
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

const HARDWARE_SALT_CONTEXT: &str = "norcow-storage 2024 hardware salt";

/// Condenses a device-unique salt into a fixed-size key.
pub fn hash_hardware_salt(salt: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(HARDWARE_SALT_CONTEXT);
    hasher.update(salt);
    hasher.finalize().into()
}

/// Derives the key-encryption key from a PIN.
pub fn derive_kek(
    pin: &[u8],
    hardware_salt: &[u8; 32],
    salt: &[u8],
    kdf: &KdfConfig,
) -> Result<Zeroizing<[u8; KEY_LEN]>, StorageError> {
    let params = scrypt::Params::new(kdf.log_n, kdf.r, kdf.p, KEY_LEN).map_err(|_| StorageError::Corrupted)?;

    let mut full_salt = Vec::with_capacity(hardware_salt.len() + salt.len());
    full_salt.extend_from_slice(hardware_salt);
    full_salt.extend_from_slice(salt);

    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(pin, &full_salt, &params, &mut *kek).map_err(|_| StorageError::Corrupted)?;
    Ok(kek)
}

/// Encrypts `plaintext` bound to `key_id`.
pub fn seal<R: RngCore + CryptoRng>(
    key: &[u8; KEY_LEN],
    key_id: u16,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, StorageError> {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let aad = key_id.to_le_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| StorageError::Corrupted)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a record produced by [`seal`]. Any failure is `Corrupted`.
pub fn open(key: &[u8; KEY_LEN], key_id: u16, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(StorageError::Corrupted);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let aad = key_id.to_le_bytes();
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
        .map(Zeroizing::new)
        .map_err(|_| StorageError::Corrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::MockRng;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    #[test]
    fn test_seal_open() {
        let mut rng = MockRng::new();
        let sealed = seal(&KEY, 0x0101, b"seed words", &mut rng).unwrap();
        assert_eq!(sealed.len(), 10 + SEAL_OVERHEAD);
        assert_eq!(open(&KEY, 0x0101, &sealed).unwrap().as_slice(), b"seed words");
    }

    #[test]
    fn test_key_id_is_bound() {
        let mut rng = MockRng::new();
        let sealed = seal(&KEY, 0x0101, b"secret", &mut rng).unwrap();
        assert!(matches!(open(&KEY, 0x0102, &sealed), Err(StorageError::Corrupted)));
        assert!(matches!(open(&[8u8; KEY_LEN], 0x0101, &sealed), Err(StorageError::Corrupted)));
        assert!(matches!(open(&KEY, 0x0101, &sealed[..10]), Err(StorageError::Corrupted)));
    }

    #[test]
    fn test_kek_depends_on_every_input() {
        let kdf = KdfConfig { log_n: 4, r: 8, p: 1 };
        let hw = hash_hardware_salt(b"device");
        let base = derive_kek(b"1234", &hw, b"salt", &kdf).unwrap();
        assert_ne!(*base, *derive_kek(b"1235", &hw, b"salt", &kdf).unwrap());
        assert_ne!(*base, *derive_kek(b"1234", &hash_hardware_salt(b"other"), b"salt", &kdf).unwrap());
        assert_ne!(*base, *derive_kek(b"1234", &hw, b"SALT", &kdf).unwrap());
        assert_eq!(*base, *derive_kek(b"1234", &hw, b"salt", &kdf).unwrap());
    }
}
