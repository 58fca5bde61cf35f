//! PIN verification.
//!
//! Every attempt is recorded in the failure counter before the PIN is checked,
//! so cutting power during verification cannot buy a free guess. A correct PIN
//! resets the counter; reaching the ceiling wipes the store.

use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use super::cipher::{self, KEY_LEN, SALT_LEN};
use super::{burn, Storage, StorageError, EDEK, PIN_FAILS, PIN_NOT_SET};
use crate::flash::Flash;

impl<F: Flash, O: Flash, R: RngCore + CryptoRng> Storage<F, O, R> {
    pub fn is_unlocked(&self) -> bool {
        self.dek.is_some()
    }

    /// Forgets the data-encryption key.
    pub fn lock(&mut self) {
        if self.dek.is_some() {
            log::info!("Storage locked");
        }
        burn::burn_key(&mut self.dek);
    }

    /// Returns true if a non-empty PIN is set.
    pub fn has_pin(&self) -> Result<bool, StorageError> {
        Ok(self.norcow.get(PIN_NOT_SET.raw())?.as_deref() != Some(&[1u8][..]))
    }

    /// Failed attempts since the last successful unlock.
    pub fn pin_failures(&self) -> Result<u32, StorageError> {
        Ok(self.norcow.get_counter(PIN_FAILS.raw())?.unwrap_or(0))
    }

    /// Attempts allowed: the configured limit, lowered by the OTP ceiling if provisioned.
    pub fn pin_ceiling(&self) -> Result<u32, StorageError> {
        let mut ceiling = self.config.pin_max_tries;
        if let Some(block) = self.config.pin_ceiling_block {
            let mut buf = [0u8; 4];
            self.otp.read(block, 0, &mut buf)?;
            let provisioned = u32::from_le_bytes(buf);
            if provisioned != u32::MAX {
                ceiling = ceiling.min(provisioned);
            }
        }
        Ok(ceiling.max(1))
    }

    pub fn pin_remaining(&self) -> Result<u32, StorageError> {
        Ok(self.pin_ceiling()?.saturating_sub(self.pin_failures()?))
    }

    /// Burns a hard PIN ceiling into OTP and locks the block.
    pub fn provision_pin_ceiling(&mut self, tries: u32) -> Result<(), StorageError> {
        let block = self.config.pin_ceiling_block.ok_or(StorageError::AccessDenied)?;
        if tries == 0 || tries == u32::MAX {
            return Err(StorageError::AccessDenied);
        }
        self.otp.write(block, 0, &tries.to_le_bytes())?;
        self.otp.lock(block)?;
        log::info!("PIN ceiling of {} provisioned in OTP block {}", tries, block);
        Ok(())
    }

    /// Unlocks the store with `pin`.
    ///
    /// # Errors
    /// * `InvalidPin` with the attempts left.
    /// * `PinExhausted` once the ceiling is reached; the store is wiped.
    pub fn unlock(&mut self, pin: &[u8]) -> Result<(), StorageError> {
        let ceiling = self.pin_ceiling()?;
        if self.pin_failures()? >= ceiling {
            return self.exhausted();
        }

        let failures = self.count_attempt()?;
        match self.unseal_dek(pin)? {
            Some(dek) => {
                self.norcow.set_counter(PIN_FAILS.raw(), 0)?;
                self.dek = Some(dek);
                log::info!("Storage unlocked");
                Ok(())
            }
            None if failures >= ceiling => self.exhausted(),
            None => {
                let remaining = ceiling - failures;
                log::warn!("Wrong PIN, {} attempts left", remaining);
                Err(StorageError::InvalidPin { remaining })
            }
        }
    }

    /// Replaces `old` with `new`. The stored values are unaffected.
    pub fn change_pin(&mut self, old: &[u8], new: &[u8]) -> Result<(), StorageError> {
        self.unlock(old)?;
        let dek = self.dek.clone().ok_or(StorageError::Locked)?;
        self.store_dek(&dek, new)?;
        log::info!("PIN changed");
        Ok(())
    }

    fn count_attempt(&mut self) -> Result<u32, StorageError> {
        if self.norcow.get_counter(PIN_FAILS.raw())?.is_none() {
            self.norcow.set_counter(PIN_FAILS.raw(), 0)?;
        }
        Ok(self.norcow.next_counter(PIN_FAILS.raw())?)
    }

    fn exhausted(&mut self) -> Result<(), StorageError> {
        log::error!("PIN attempts exhausted, wiping storage");
        self.wipe()?;
        Err(StorageError::PinExhausted)
    }

    /// Seals `dek` under `pin` and records whether a PIN is set.
    pub(super) fn store_dek(&mut self, dek: &[u8; KEY_LEN], pin: &[u8]) -> Result<(), StorageError> {
        let mut salt = [0u8; SALT_LEN];
        self.rng.fill_bytes(&mut salt);
        let kek = cipher::derive_kek(pin, &self.hardware_salt, &salt, &self.config.kdf)?;
        let sealed = cipher::seal(&kek, EDEK.raw(), dek, &mut self.rng)?;

        let mut record = Zeroizing::new(alloc::vec::Vec::with_capacity(SALT_LEN + sealed.len()));
        record.extend_from_slice(&salt);
        record.extend_from_slice(&sealed);
        self.norcow.set(EDEK.raw(), &record)?;
        self.norcow.set(PIN_NOT_SET.raw(), &[pin.is_empty() as u8])?;
        Ok(())
    }

    /// Returns the DEK, or None if `pin` does not open it.
    fn unseal_dek(&self, pin: &[u8]) -> Result<Option<Zeroizing<[u8; KEY_LEN]>>, StorageError> {
        let record = self.norcow.get(EDEK.raw())?.ok_or(StorageError::Corrupted)?;
        if record.len() != SALT_LEN + cipher::SEAL_OVERHEAD + KEY_LEN {
            log::error!("Sealed key record has {} bytes", record.len());
            return Err(StorageError::Corrupted);
        }
        let (salt, sealed) = record.split_at(SALT_LEN);
        let kek = cipher::derive_kek(pin, &self.hardware_salt, salt, &self.config.kdf)?;
        match cipher::open(&kek, EDEK.raw(), sealed) {
            Ok(plain) => {
                let mut dek = Zeroizing::new([0u8; KEY_LEN]);
                dek.copy_from_slice(&plain);
                Ok(Some(dek))
            }
            Err(_) => Ok(None),
        }
    }
}
