//! PIN-protected settings and secrets on top of the sector log.
//!
//! Typed access to the sector log for PIN, seed and settings code.
//!
//! Keys are `(app, id)` pairs stored as `app << 8 | id`. App 0 belongs to the
//! store itself. Apps with [`FLAG_PUBLIC`] are kept in the clear and readable
//! while locked; apps with both [`FLAGS_WRITE`] bits are writable while locked
//! too. Every other value is encrypted under the data-encryption key, which is
//! only available after [`Storage::unlock`].

pub mod burn;
pub mod cipher;
mod pin;

use alloc::vec::Vec;
use core::fmt;

use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::config::StoreConfig;
use crate::flash::Flash;
use crate::norcow::{Norcow, NorcowError};
use crate::otp::{Otp, OtpError};

/// Apps with this bit are stored unencrypted.
pub const FLAG_PUBLIC: u8 = 0x80;
/// Apps with both bits are public and writable while locked.
pub const FLAGS_WRITE: u8 = 0xC0;
/// App reserved for internal records.
pub const APP_STORAGE: u8 = 0x00;

/// On-flash format of the internal records.
pub const STORAGE_VERSION: u32 = 1;

/// Errors related to storage operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// No value under the key.
    NotFound,
    /// Value exceeds the single-entry ceiling.
    ValueTooLarge,
    /// Integrity or authentication check failed.
    Corrupted,
    /// The key needs the store to be unlocked.
    Locked,
    /// The key is reserved or is not valid for this call.
    AccessDenied,
    /// Wrong PIN.
    InvalidPin { remaining: u32 },
    /// The PIN try limit was reached; the store has been wiped.
    PinExhausted,
    /// Live data does not fit in a sector.
    OutOfSpace,
    /// Flash failure. The device must halt.
    HardwareFault,
    /// OTP misuse.
    Otp(OtpError),
}

impl StorageError {
    /// Returns true if the firmware must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::HardwareFault)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "Key not found"),
            StorageError::ValueTooLarge => write!(f, "Value too large"),
            StorageError::Corrupted => write!(f, "Storage corrupted"),
            StorageError::Locked => write!(f, "Storage locked"),
            StorageError::AccessDenied => write!(f, "Access denied"),
            StorageError::InvalidPin { remaining } => write!(f, "Invalid PIN, {} attempts left", remaining),
            StorageError::PinExhausted => write!(f, "PIN attempts exhausted, storage wiped"),
            StorageError::OutOfSpace => write!(f, "Storage full"),
            StorageError::HardwareFault => write!(f, "Flash hardware fault"),
            StorageError::Otp(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StorageError {}

impl From<NorcowError> for StorageError {
    fn from(err: NorcowError) -> Self {
        match err {
            NorcowError::ValueTooLarge => StorageError::ValueTooLarge,
            NorcowError::OutOfSpace => StorageError::OutOfSpace,
            NorcowError::InvalidKey => StorageError::AccessDenied,
            NorcowError::Corrupted => StorageError::Corrupted,
            NorcowError::InvalidGeometry | NorcowError::Flash(_) => {
                log::error!("Storage hardware failure: {}", err);
                StorageError::HardwareFault
            }
        }
    }
}

impl From<OtpError> for StorageError {
    fn from(err: OtpError) -> Self {
        match err {
            OtpError::Flash(_) => StorageError::HardwareFault,
            other => StorageError::Otp(other),
        }
    }
}

/// Address of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey {
    pub app: u8,
    pub id: u8,
}

impl StorageKey {
    pub const fn new(app: u8, id: u8) -> Self {
        Self { app, id }
    }

    /// Key as stored in the sector log.
    pub const fn raw(self) -> u16 {
        (self.app as u16) << 8 | self.id as u16
    }

    pub const fn is_public(self) -> bool {
        self.app & FLAG_PUBLIC != 0
    }

    pub const fn is_writable_locked(self) -> bool {
        self.app & FLAGS_WRITE == FLAGS_WRITE
    }
}

/// Well-known settings.
pub mod keys {
    use super::StorageKey;

    pub const LABEL: StorageKey = StorageKey::new(0x81, 0x01);
    pub const LANGUAGE: StorageKey = StorageKey::new(0x81, 0x02);
    pub const PASSPHRASE_PROTECTION: StorageKey = StorageKey::new(0x81, 0x03);
    pub const MNEMONIC: StorageKey = StorageKey::new(0x01, 0x01);
    pub const U2F_COUNTER: StorageKey = StorageKey::new(0xC1, 0x01);
}

/// PIN attempt counter.
const PIN_FAILS: StorageKey = StorageKey::new(APP_STORAGE, 0x01);
/// Data-encryption key sealed under the PIN.
const EDEK: StorageKey = StorageKey::new(APP_STORAGE, 0x02);
/// `1` while no PIN is set.
const PIN_NOT_SET: StorageKey = StorageKey::new(APP_STORAGE, 0x03);
const VERSION: StorageKey = StorageKey::new(APP_STORAGE, 0x04);

/// Secure key-value store.
pub struct Storage<F: Flash, O: Flash, R: RngCore + CryptoRng> {
    norcow: Norcow<F>,
    otp: Otp<O>,
    rng: R,
    config: StoreConfig,
    hardware_salt: [u8; 32],
    dek: Option<Zeroizing<[u8; cipher::KEY_LEN]>>,
}

impl<F: Flash, O: Flash, R: RngCore + CryptoRng> Storage<F, O, R> {
    /// Opens the store, initializing it on first use.
    ///
    /// `hardware_salt` is a device-unique value mixed into the PIN key.
    /// The store starts locked.
    pub fn open(
        flash: F,
        otp_flash: O,
        rng: R,
        hardware_salt: &[u8],
        config: StoreConfig,
    ) -> Result<Self, StorageError> {
        let norcow = Norcow::open_with_limit(flash, config.max_value_len)?;
        let otp = Otp::new(otp_flash, config.otp)?;
        let mut storage = Self {
            norcow,
            otp,
            rng,
            config,
            hardware_salt: cipher::hash_hardware_salt(hardware_salt),
            dek: None,
        };

        if !storage.norcow.contains(VERSION.raw()) {
            if storage.norcow.keys().next().is_some() {
                log::warn!("Discarding interrupted storage initialization");
                storage.norcow.wipe()?;
            }
            log::info!("Initializing empty storage");
            storage.init()?;
        }
        match storage.norcow.get(VERSION.raw())? {
            Some(v) if v == STORAGE_VERSION.to_le_bytes() => {}
            other => {
                log::error!("Unsupported storage version record {:?}", other);
                return Err(StorageError::Corrupted);
            }
        }
        Ok(storage)
    }

    /// Writes the internal records of an empty store: a fresh DEK under the empty PIN.
    ///
    /// The version record goes last and marks the store as initialized.
    fn init(&mut self) -> Result<(), StorageError> {
        let mut dek = Zeroizing::new([0u8; cipher::KEY_LEN]);
        self.rng.fill_bytes(&mut *dek);
        self.norcow.set_counter(PIN_FAILS.raw(), 0)?;
        self.store_dek(&dek, b"")?;
        self.norcow.set(VERSION.raw(), &STORAGE_VERSION.to_le_bytes())?;
        Ok(())
    }

    fn check_app(key: StorageKey) -> Result<(), StorageError> {
        if key.app == APP_STORAGE {
            return Err(StorageError::AccessDenied);
        }
        Ok(())
    }

    fn check_writable(&self, key: StorageKey) -> Result<(), StorageError> {
        Self::check_app(key)?;
        if !self.is_unlocked() && !key.is_writable_locked() {
            return Err(StorageError::Locked);
        }
        Ok(())
    }

    fn unlocked_dek(&self) -> Result<&[u8; cipher::KEY_LEN], StorageError> {
        self.dek.as_deref().ok_or(StorageError::Locked)
    }

    /// Reads the value under `key`. The buffer is zeroized when dropped.
    pub fn get(&self, key: StorageKey) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        Self::check_app(key)?;
        if !key.is_public() {
            let dek = self.unlocked_dek()?;
            let sealed = self.norcow.get(key.raw())?.ok_or(StorageError::NotFound)?;
            return cipher::open(dek, key.raw(), &sealed);
        }
        let value = self.norcow.get(key.raw())?.ok_or(StorageError::NotFound)?;
        Ok(Zeroizing::new(value))
    }

    /// Returns true if a value is stored under `key`.
    pub fn has(&self, key: StorageKey) -> Result<bool, StorageError> {
        Self::check_app(key)?;
        Ok(self.norcow.contains(key.raw()))
    }

    /// Stores `value` under `key`.
    pub fn set(&mut self, key: StorageKey, value: &[u8]) -> Result<(), StorageError> {
        self.check_writable(key)?;
        if key.is_public() {
            self.norcow.set(key.raw(), value)?;
            return Ok(());
        }
        if value.len() + cipher::SEAL_OVERHEAD > self.norcow.max_value_len() as usize {
            return Err(StorageError::ValueTooLarge);
        }
        let sealed = {
            let dek = self.dek.as_deref().ok_or(StorageError::Locked)?;
            cipher::seal(dek, key.raw(), value, &mut self.rng)?
        };
        self.norcow.set(key.raw(), &sealed)?;
        Ok(())
    }

    /// Deletes `key`. Returns false if nothing was stored.
    pub fn delete(&mut self, key: StorageKey) -> Result<bool, StorageError> {
        self.check_writable(key)?;
        Ok(self.norcow.delete(key.raw())?)
    }

    fn check_counter(&self, key: StorageKey) -> Result<(), StorageError> {
        if !key.is_public() {
            return Err(StorageError::AccessDenied);
        }
        self.check_writable(key)
    }

    /// Sets the public counter under `key`.
    pub fn set_counter(&mut self, key: StorageKey, value: u32) -> Result<(), StorageError> {
        self.check_counter(key)?;
        Ok(self.norcow.set_counter(key.raw(), value)?)
    }

    /// Increments the public counter under `key`, creating it at zero.
    pub fn next_counter(&mut self, key: StorageKey) -> Result<u32, StorageError> {
        self.check_counter(key)?;
        Ok(self.norcow.next_counter(key.raw())?)
    }

    /// Reads the public counter under `key`.
    pub fn get_counter(&self, key: StorageKey) -> Result<u32, StorageError> {
        Self::check_app(key)?;
        if !key.is_public() {
            return Err(StorageError::AccessDenied);
        }
        self.norcow.get_counter(key.raw())?.ok_or(StorageError::NotFound)
    }

    /// Erases everything and starts over with no PIN. The store is left locked.
    pub fn wipe(&mut self) -> Result<(), StorageError> {
        log::warn!("Wiping storage");
        burn::burn_key(&mut self.dek);
        self.norcow.wipe()?;
        self.init()
    }

    /// The OTP area.
    pub fn otp(&self) -> &Otp<O> {
        &self.otp
    }

    pub fn otp_mut(&mut self) -> &mut Otp<O> {
        &mut self.otp
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the storage and OTP devices.
    pub fn into_parts(mut self) -> (F, O) {
        burn::burn_key(&mut self.dek);
        (self.norcow.into_flash(), self.otp.into_flash())
    }

    #[cfg(test)]
    pub(crate) fn norcow_mut(&mut self) -> &mut Norcow<F> {
        &mut self.norcow
    }
}
