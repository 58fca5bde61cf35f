//! Configuration for the storage engine.
//!
//! Build-time geometry is exposed as constants for provisioning tooling; the
//! tunable parts live in [`StoreConfig`], populated by the firmware and passed
//! to [`crate::storage::Storage::open`].

#[cfg(feature = "serde")]
use alloc::string::String;

/// Number of OTP blocks.
pub const OTP_BLOCK_COUNT: u8 = 16;

/// Size of one OTP block in bytes.
pub const OTP_BLOCK_SIZE: u32 = 32;

/// OTP block holding the manufacturing batch string.
pub const OTP_BLOCK_BATCH: u8 = 0;
/// OTP block holding the bootloader anti-downgrade fuses.
pub const OTP_BLOCK_BOOTLOADER_VERSION: u8 = 1;
/// OTP block holding the vendor header lock hash.
pub const OTP_BLOCK_VENDOR_HEADER_LOCK: u8 = 2;
/// OTP block holding the device variant.
pub const OTP_BLOCK_DEVICE_VARIANT: u8 = 3;
/// OTP block holding the firmware anti-downgrade fuses.
pub const OTP_BLOCK_FIRMWARE_VERSION: u8 = 4;
/// OTP block holding the hard ceiling on PIN attempts.
pub const OTP_BLOCK_PIN_CEILING: u8 = 5;

/// Default number of PIN attempts before the storage is wiped.
pub const PIN_MAX_TRIES: u32 = 16;

/// Geometry of the OTP area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OtpLayout {
    pub block_count: u8,
    pub block_size: u32,
}

impl OtpLayout {
    /// Bytes of flash needed: the data blocks followed by one lock byte per block.
    pub fn total_size(&self) -> u32 {
        self.block_count as u32 * (self.block_size + 1)
    }
}

impl Default for OtpLayout {
    fn default() -> Self {
        Self {
            block_count: OTP_BLOCK_COUNT,
            block_size: OTP_BLOCK_SIZE,
        }
    }
}

/// Scrypt parameters for deriving the PIN key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KdfConfig {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self { log_n: 14, r: 8, p: 1 }
    }
}

/// Main configuration of the storage stack.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StoreConfig {
    /// PIN attempts allowed before the store is wiped.
    /// The OTP ceiling, when provisioned, can only lower this.
    pub pin_max_tries: u32,

    /// Key derivation for the PIN.
    pub kdf: KdfConfig,

    /// Largest stored payload. If None, derived from the sector size.
    pub max_value_len: Option<u16>,

    /// OTP geometry.
    pub otp: OtpLayout,

    /// OTP block read as the hard PIN ceiling, if any.
    pub pin_ceiling_block: Option<u8>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pin_max_tries: PIN_MAX_TRIES,
            kdf: KdfConfig::default(),
            max_value_len: None,
            otp: OtpLayout::default(),
            pin_ceiling_block: Some(OTP_BLOCK_PIN_CEILING),
        }
    }
}

#[cfg(feature = "serde")]
impl StoreConfig {
    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| alloc::format!("{}", e))
    }
}
