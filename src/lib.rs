#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(not(feature = "std"))]
use core::panic::PanicInfo;

#[cfg(not(feature = "std"))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! { loop {} }

pub mod bootargs;
pub mod config;
pub mod counter;
pub mod flash;
pub mod norcow;
pub mod otp;
pub mod storage;

pub use flash::{Flash, FlashError, SectorId};
pub use norcow::{Norcow, NorcowError, NorcowState};
pub use otp::{Otp, OtpBlockState, OtpError};
pub use storage::{Storage, StorageError, StorageKey};

#[cfg(not(feature = "std"))]
#[no_mangle]
pub extern "C" fn norcow_storage_version() -> u32 {
    0x000300
}

#[cfg(feature = "std")]
#[no_mangle]
pub extern "C" fn norcow_storage_version_std() -> u32 {
    0x000300
}
