//! Recovery orchestrator.
//!
//! The device under test can be in any state when a test starts: running
//! firmware, sitting in the bootloader, stuck in mask-ROM mass-storage mode,
//! or wedged. The orchestrator drives it into a known state using only the
//! debug probe, and then confirms the result by watching for a fresh external
//! signal (a USB identity or a mounted volume). It never relies on a
//! remembered notion of where the device is.
//!
//! ## Forcing sequences
//!
//! ```text
//! update mode : fill boot-data 0xFF (best effort) -> RAM magic (best effort)
//!               -> reset (fatal) -> settle
//! BOOTSEL     : zero stage-2 (fatal) -> reset (fatal)
//! UF2 deploy  : BOOTSEL -> enumeration delay -> volume (fatal)
//!               -> copy + sync (fatal) -> reboot settle
//! ```

use crate::command::{CommandResult, SystemRunner};
use crate::device::{SysfsUsbSource, UsbIdentity, UsbLocator};
use crate::error::{Error, Result};
use crate::image::{FirmwareImage, Uf2Block, Uf2Encoder};
use crate::poll::{Clock, SystemClock};
use crate::probe::DebugProbe;
use crate::storage::{MassStorageLocator, SystemStorage};
use crate::target::{TargetProfile, Timings};
use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Where the device was last observed to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceState {
    /// Nothing recognisable is present.
    Unknown,
    /// Mask-ROM USB mass-storage mode (volume present).
    MassStorageProgramming,
    /// crispy bootloader waiting for an upload.
    BootloaderUpdateMode,
    /// Application firmware. The bank is only known once confirmed over the
    /// firmware's own serial session.
    FirmwareRunning {
        /// Bank the firmware was booted from.
        bank: Option<u8>,
    },
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::MassStorageProgramming => write!(f, "mass-storage programming (BOOTSEL)"),
            Self::BootloaderUpdateMode => write!(f, "bootloader update mode"),
            Self::FirmwareRunning { bank: Some(bank) } => write!(f, "firmware running (bank {bank})"),
            Self::FirmwareRunning { bank: None } => write!(f, "firmware running"),
        }
    }
}

/// States a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTarget {
    /// Force BOOTSEL through the debug probe.
    MassStorageProgramming,
    /// Force the bootloader's update mode through the debug probe.
    BootloaderUpdateMode,
    /// Boot a firmware bank. Needs the upload utility, see `bench`.
    FirmwareRunning,
}

/// Which update-mode triggers were armed before the reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateModeEntry {
    /// Boot-data sector overwritten with 0xFF.
    pub descriptor_erased: bool,
    /// RAM magic written.
    pub magic_written: bool,
}

impl UpdateModeEntry {
    /// At least one trigger armed.
    pub fn any_armed(&self) -> bool {
        self.descriptor_erased || self.magic_written
    }
}

/// Drives the target between states with the debug probe.
pub struct Orchestrator {
    profile: TargetProfile,
    timings: Timings,
    probe: DebugProbe,
    usb: UsbLocator,
    storage: MassStorageLocator,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    /// Assemble from parts.
    pub fn new(
        profile: TargetProfile,
        timings: Timings,
        probe: DebugProbe,
        usb: UsbLocator,
        storage: MassStorageLocator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            profile,
            timings,
            probe,
            usb,
            storage,
            clock,
        }
    }

    /// Orchestrator using real processes, sysfs and the wall clock.
    pub fn system(profile: TargetProfile, timings: Timings, probe_program: &str) -> Self {
        let runner = Arc::new(SystemRunner);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let probe = DebugProbe::new(runner.clone(), profile.chip.clone()).with_program(probe_program);
        let usb = UsbLocator::new(Box::new(SysfsUsbSource::default()), clock.clone())
            .with_interval(timings.poll_interval);
        let storage = MassStorageLocator::new(Box::new(SystemStorage::new(runner)), clock.clone())
            .with_interval(timings.poll_interval);
        Self::new(profile, timings, probe, usb, storage, clock)
    }

    /// Target profile in use.
    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    /// Timings in use.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// The debug probe.
    pub fn probe(&self) -> &DebugProbe {
        &self.probe
    }

    /// The USB locator.
    pub fn usb(&self) -> &UsbLocator {
        &self.usb
    }

    /// The mass-storage locator.
    pub fn storage(&self) -> &MassStorageLocator {
        &self.storage
    }

    /// Clock used for settle delays.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn require(&self, result: CommandResult, step: &str) -> Result<CommandResult> {
        if result.success {
            Ok(result)
        } else {
            error!("{step} failed: {}", result.combined_output().trim());
            Err(Error::CommandFailed {
                command: format!("{} {step}", self.probe.program()),
                output: result.combined_output(),
            })
        }
    }

    /// Force the bootloader into update mode.
    ///
    /// Both triggers are armed every time: the boot-data sector is filled with
    /// 0xFF so no firmware descriptor validates, and the RAM magic is written.
    /// Either may fail without aborting. Only the reset is required to
    /// succeed; whether update mode was actually reached is for the caller to
    /// confirm (for example with [`Self::wait_for_bootloader`]).
    pub fn enter_update_mode(&self) -> Result<UpdateModeEntry> {
        info!("Entering update mode via debug probe");
        let p = &self.profile;

        let erase = self
            .probe
            .fill(p.boot_data_addr, p.boot_data_size as usize, 0xFF);
        if !erase.success {
            warn!(
                "Boot data erase failed, relying on RAM magic: {}",
                erase.combined_output().trim()
            );
        }

        let magic = self
            .probe
            .write_word(p.ram_update_flag_addr, p.ram_update_magic);
        if !magic.success {
            warn!("RAM magic write failed: {}", magic.combined_output().trim());
        }

        let entry = UpdateModeEntry {
            descriptor_erased: erase.success,
            magic_written: magic.success,
        };
        if !entry.any_armed() {
            error!("No update-mode trigger armed; resetting anyway");
        }

        self.require(self.probe.reset(), "reset")?;
        self.clock.sleep(self.timings.update_mode_settle);
        Ok(entry)
    }

    /// Force mask-ROM mass-storage mode by invalidating stage 2 and
    /// resetting. The volume is not waited for.
    pub fn force_bootsel(&self) -> Result<()> {
        info!("Forcing BOOTSEL (invalidating stage 2)");
        let p = &self.profile;
        self.require(
            self.probe.fill(p.boot2_addr, p.boot2_size as usize, 0x00),
            "download (stage-2 invalidate)",
        )?;
        self.require(self.probe.reset(), "reset")?;
        Ok(())
    }

    /// Force BOOTSEL and wait for the volume. Returns its mount point.
    pub fn enter_mass_storage(&self) -> Result<PathBuf> {
        self.force_bootsel()?;
        self.clock.sleep(self.timings.bootsel_enumeration);
        self.storage
            .find_volume(&self.profile.volume_label, self.timings.volume_timeout)
    }

    /// Force BOOTSEL, wait for the volume and write a file named `name` to
    /// its root with `write`. Returns the written path.
    fn deploy_with<F>(&self, name: &str, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut BufWriter<&File>) -> Result<()>,
    {
        let volume = self.enter_mass_storage()?;
        let dest = volume.join(name);
        info!("Copying {name} to {}", volume.display());

        let file = File::create(&dest)?;
        {
            let mut writer = BufWriter::new(&file);
            write(&mut writer)?;
            writer.flush()?;
        }
        file.sync_all()?;

        info!("UF2 copied, waiting for device reboot");
        self.clock.sleep(self.timings.uf2_reboot_settle);
        Ok(dest)
    }

    /// Deploy a pre-encoded UF2 file through mass storage.
    pub fn deploy_uf2_file(&self, uf2: &Path) -> Result<PathBuf> {
        let name = uf2
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidImage(format!("{} has no file name", uf2.display())))?;
        let mut source = File::open(uf2)?;
        self.deploy_with(&name, |out| {
            io::copy(&mut source, out)?;
            Ok(())
        })
    }

    /// Deploy already encoded blocks as `name`.
    pub fn deploy_blocks(&self, name: &str, blocks: &[Uf2Block]) -> Result<PathBuf> {
        if blocks.is_empty() {
            return Err(Error::InvalidImage("no UF2 blocks to deploy".to_string()));
        }
        self.deploy_with(name, |out| {
            for block in blocks {
                out.write_all(&block.to_bytes())?;
            }
            Ok(())
        })
    }

    /// Encode `image` for this target and deploy it as `name`.
    pub fn deploy_image(&self, name: &str, image: &FirmwareImage) -> Result<PathBuf> {
        let blocks = Uf2Encoder::new(self.profile.family_id).encode(image);
        self.deploy_blocks(name, &blocks)
    }

    /// Wait for the bootloader's USB identity.
    pub fn wait_for_bootloader(&self, timeout: Duration) -> Result<String> {
        self.usb
            .find_port(&self.profile.bootloader_identity(), timeout)
    }

    /// Wait for firmware enumerating with product id `product`.
    pub fn wait_for_firmware(&self, product: u16, timeout: Duration) -> Result<String> {
        self.usb
            .find_port(&UsbIdentity::from_ids(self.profile.usb_vid, product), timeout)
    }

    /// Drive the device to `target` and confirm it from a fresh signal.
    pub fn reach(&self, target: RecoveryTarget) -> Result<DeviceState> {
        match target {
            RecoveryTarget::BootloaderUpdateMode => {
                self.enter_update_mode()?;
                let port = self.wait_for_bootloader(self.timings.port_timeout)?;
                info!("Bootloader update mode on {port}");
                Ok(DeviceState::BootloaderUpdateMode)
            },
            RecoveryTarget::MassStorageProgramming => {
                let volume = self.enter_mass_storage()?;
                info!("Mass-storage mode at {}", volume.display());
                Ok(DeviceState::MassStorageProgramming)
            },
            RecoveryTarget::FirmwareRunning => Err(Error::Unsupported(
                "firmware is booted through the upload utility, not the debug probe".to_string(),
            )),
        }
    }

    /// Single snapshot of what the host can see right now.
    pub fn observe(&self) -> DeviceState {
        if self
            .storage
            .find_mounted_now(&self.profile.volume_label)
            .is_some()
        {
            DeviceState::MassStorageProgramming
        } else if self
            .usb
            .find_port_now(&self.profile.bootloader_identity())
            .is_some()
        {
            DeviceState::BootloaderUpdateMode
        } else if self
            .usb
            .find_port_now(&self.profile.firmware_identity())
            .is_some()
        {
            DeviceState::FirmwareRunning { bank: None }
        } else {
            DeviceState::Unknown
        }
    }

    /// Flash the bootloader ELF and reset into it.
    pub fn flash_bootloader(&self, elf: &Path) -> Result<()> {
        info!("Flashing {} via debug probe", elf.display());
        self.require(self.probe.download_elf(elf), "download")?;
        self.require(self.probe.reset(), "reset")?;
        Ok(())
    }

    /// Erase the whole flash.
    pub fn erase_all(&self) -> Result<()> {
        info!("Erasing flash");
        self.require(self.probe.erase_chip(), "erase")?;
        Ok(())
    }
}
