//! Boot-command handoff.
//!
//! Before rebooting into the bootloader the firmware leaves a command and an
//! argument block in a fixed memory area. The bootloader reads it exactly once
//! and picks its startup action from it. The encoding below is shared with the
//! C boot stages through the generated header.

use core::fmt;

/// Size of the argument area after the command word.
pub const BOOT_ARGS_LEN: usize = 252;

/// Size of the whole handoff block.
pub const BOOT_BLOCK_LEN: usize = 4 + BOOT_ARGS_LEN;

/// Command left for the bootloader.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootCommand {
    /// Normal boot.
    #[default]
    None = 0x0000_0000,
    /// Stay in the bootloader and wait for the host.
    StopAndWait = 0x0FC3_5A96,
    /// Install the firmware whose hash is in the arguments without asking.
    InstallUpgrade = 0xFA4A_5C8D,
    /// Plain reboot.
    Reboot = 0x7CD3_E1A4,
    /// Show the post-mortem screen described by the arguments.
    ShowRsod = 0x3E8D_F5C1,
    /// Erase the storage before booting.
    Wipe = 0xB6C9_0E2F,
    /// Power the device off.
    PowerOff = 0x5A1B_C7D3,
}

impl BootCommand {
    /// Decodes a raw command word. Unknown values read as `None`.
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            x if x == BootCommand::StopAndWait as u32 => BootCommand::StopAndWait,
            x if x == BootCommand::InstallUpgrade as u32 => BootCommand::InstallUpgrade,
            x if x == BootCommand::Reboot as u32 => BootCommand::Reboot,
            x if x == BootCommand::ShowRsod as u32 => BootCommand::ShowRsod,
            x if x == BootCommand::Wipe as u32 => BootCommand::Wipe,
            x if x == BootCommand::PowerOff as u32 => BootCommand::PowerOff,
            _ => BootCommand::None,
        }
    }
}

/// Errors related to the handoff block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootArgsError {
    /// Arguments do not fit in the block.
    ArgsTooLong,
}

impl fmt::Display for BootArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootArgsError::ArgsTooLong => write!(f, "Boot arguments exceed {} bytes", BOOT_ARGS_LEN),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BootArgsError {}

/// Contents of the handoff block.
#[derive(Clone, PartialEq, Eq)]
pub struct BootArgs {
    pub command: BootCommand,
    pub args: [u8; BOOT_ARGS_LEN],
}

impl Default for BootArgs {
    fn default() -> Self {
        Self {
            command: BootCommand::None,
            args: [0u8; BOOT_ARGS_LEN],
        }
    }
}

impl fmt::Debug for BootArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootArgs").field("command", &self.command).finish_non_exhaustive()
    }
}

impl BootArgs {
    /// Command with arguments; the rest of the argument area is zeroed.
    pub fn new(command: BootCommand, args: &[u8]) -> Result<Self, BootArgsError> {
        if args.len() > BOOT_ARGS_LEN {
            return Err(BootArgsError::ArgsTooLong);
        }
        let mut out = Self { command, ..Self::default() };
        out.args[..args.len()].copy_from_slice(args);
        Ok(out)
    }

    pub fn encode(&self) -> [u8; BOOT_BLOCK_LEN] {
        let mut block = [0u8; BOOT_BLOCK_LEN];
        block[..4].copy_from_slice(&(self.command as u32).to_le_bytes());
        block[4..].copy_from_slice(&self.args);
        block
    }

    /// Decodes a handoff block. Anything unrecognizable decodes as a normal boot.
    pub fn decode(block: &[u8]) -> Self {
        if block.len() != BOOT_BLOCK_LEN {
            return Self::default();
        }
        let command = BootCommand::from_u32(u32::from_le_bytes([block[0], block[1], block[2], block[3]]));
        let mut args = [0u8; BOOT_ARGS_LEN];
        args.copy_from_slice(&block[4..]);
        Self { command, args }
    }

    /// Returns the contents and clears the block, so a command runs once.
    pub fn take(&mut self) -> Self {
        core::mem::take(self)
    }
}

/// What the bootloader does after reading the handoff block.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupAction {
    ContinueToFirmware = 0,
    StayInBootloader = 1,
    AutoUpgrade = 2,
    WipeStorage = 3,
    ShowRsod = 4,
    PowerOff = 5,
}

/// Chooses the startup action for `args`.
pub fn startup_action(args: &BootArgs, firmware_present: bool) -> StartupAction {
    let action = match args.command {
        BootCommand::ShowRsod => StartupAction::ShowRsod,
        BootCommand::Wipe => StartupAction::WipeStorage,
        BootCommand::PowerOff => StartupAction::PowerOff,
        BootCommand::StopAndWait => StartupAction::StayInBootloader,
        BootCommand::InstallUpgrade if firmware_present => StartupAction::AutoUpgrade,
        _ if firmware_present => StartupAction::ContinueToFirmware,
        _ => StartupAction::StayInBootloader,
    };
    log::info!("Boot command {:?} -> {:?}", args.command, action);
    action
}

/// C entry point for boot stages that only see the raw command word.
#[no_mangle]
pub extern "C" fn norcow_startup_action(command: u32, firmware_present: bool) -> u32 {
    let args = BootArgs {
        command: BootCommand::from_u32(command),
        ..BootArgs::default()
    };
    startup_action(&args, firmware_present) as u32
}
