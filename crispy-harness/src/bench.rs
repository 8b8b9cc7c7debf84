//! End-to-end bench scenarios.
//!
//! Combines the orchestrator, the upload utility and serial sessions into the
//! steps a deployment test walks through: upload to a bank, boot it, confirm
//! the running firmware, send it back to the bootloader, wipe.

use crate::command::CommandResult;
use crate::error::{Error, Result};
use crate::recovery::Orchestrator;
use crate::serial::{PortOpener, SerialConfig, SerialSession};
use crate::status::{BootloaderStatus, firmware_bank};
use crate::upload::UploadClient;
use log::{debug, info};
use std::path::Path;

/// Firmware serial command reporting the running bank.
pub const FIRMWARE_STATUS_COMMAND: &str = "status";

/// Firmware serial command rebooting into the bootloader.
pub const FIRMWARE_BOOTLOAD_COMMAND: &str = "bootload";

/// A device on the bench with every way of talking to it.
pub struct Bench {
    orchestrator: Orchestrator,
    upload: UploadClient,
    opener: Box<dyn PortOpener>,
}

impl Bench {
    /// Assemble from parts.
    pub fn new(orchestrator: Orchestrator, upload: UploadClient, opener: Box<dyn PortOpener>) -> Self {
        Self {
            orchestrator,
            upload,
            opener,
        }
    }

    /// The underlying orchestrator.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn session(&self, port: &str) -> Result<SerialSession> {
        SerialSession::open(
            self.opener.as_ref(),
            &SerialConfig::new(port),
            self.orchestrator.clock().clone(),
        )
    }

    fn bootloader_port(&self) -> Result<String> {
        self.orchestrator
            .wait_for_bootloader(self.orchestrator.timings().port_timeout)
    }

    fn checked(result: CommandResult, what: &str) -> Result<CommandResult> {
        if result.success {
            Ok(result)
        } else {
            Err(Error::CommandFailed {
                command: what.to_string(),
                output: result.combined_output(),
            })
        }
    }

    /// Force update mode and upload `firmware` into `bank`.
    pub fn upload_to_bank(&self, firmware: &Path, bank: u8, version: u32) -> Result<CommandResult> {
        self.orchestrator.enter_update_mode()?;
        let port = self.bootloader_port()?;
        info!("Uploading {} to bank {bank} on {port}", firmware.display());
        Self::checked(
            self.upload.upload(&port, firmware, bank, version)?,
            "upload",
        )
    }

    /// Select `bank`, reboot, and confirm the firmware reports it. Returns
    /// the firmware's serial port.
    pub fn boot_bank(&self, bank: u8, firmware_product: u16) -> Result<String> {
        let timings = *self.orchestrator.timings();
        let port = self.bootloader_port()?;
        Self::checked(self.upload.set_bank(&port, bank)?, "set-bank")?;
        Self::checked(self.upload.reboot(&port)?, "reboot")?;
        self.orchestrator.clock().sleep(timings.reboot_settle);

        let fw_port = self
            .orchestrator
            .wait_for_firmware(firmware_product, timings.port_timeout)?;
        let reply = self
            .session(&fw_port)?
            .send_command(FIRMWARE_STATUS_COMMAND, timings.serial_settle)?;
        debug!("Firmware status on {fw_port}: {reply:?}");

        match firmware_bank(&reply) {
            Some(reported) if reported == bank => {
                info!("Firmware running from bank {bank} on {fw_port}");
                Ok(fw_port)
            },
            _ => Err(Error::Parse(format!(
                "expected 'Bank: {bank}' from {fw_port}, got {:?}",
                reply.trim()
            ))),
        }
    }

    /// Ask running firmware to reboot into the bootloader and confirm update
    /// mode through the upload utility.
    pub fn return_to_bootloader(&self, firmware_port: &str) -> Result<BootloaderStatus> {
        {
            let mut session = self.session(firmware_port)?;
            session.write_line(FIRMWARE_BOOTLOAD_COMMAND)?;
        }
        self.orchestrator
            .clock()
            .sleep(self.orchestrator.timings().serial_settle);

        let port = self.bootloader_port()?;
        let status = self.query_status(&port)?;
        Self::require_update_mode(status)
    }

    /// Wipe all banks, reboot, and confirm the bootloader comes back in
    /// update mode with nothing left to boot.
    pub fn wipe_and_confirm(&self) -> Result<BootloaderStatus> {
        let port = self.bootloader_port()?;
        Self::checked(self.upload.wipe(&port)?, "wipe")?;
        Self::checked(self.upload.reboot(&port)?, "reboot")?;
        self.orchestrator
            .clock()
            .sleep(self.orchestrator.timings().reboot_settle);

        let port = self.bootloader_port()?;
        let status = self.query_status(&port)?;
        Self::require_update_mode(status)
    }

    /// Run `status` through the upload utility and parse it.
    pub fn query_status(&self, port: &str) -> Result<BootloaderStatus> {
        let result = Self::checked(self.upload.status(port)?, "status")?;
        BootloaderStatus::parse(&result.combined_output())
    }

    fn require_update_mode(status: BootloaderStatus) -> Result<BootloaderStatus> {
        if status.is_update_mode() {
            Ok(status)
        } else {
            Err(Error::Parse(format!(
                "expected UpdateMode, bootloader reports {:?}",
                status.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UsbLocator;
    use crate::probe::DebugProbe;
    use crate::storage::MassStorageLocator;
    use crate::target::{TargetProfile, Timings};
    use crate::testing::{FakeStorage, FakeUsbSource, ManualClock, MockOpener, MockPort, ScriptedRunner};
    use std::sync::Arc;

    const UPDATE_MODE_STATUS: &str = "Bootloader Status:\n  Active bank: 0 (A)\n  State:       UpdateMode\n";

    struct Rig {
        runner: Arc<ScriptedRunner>,
        usb: FakeUsbSource,
        opener: MockOpener,
        clock: Arc<ManualClock>,
        bench: Bench,
    }

    fn rig() -> Rig {
        let runner = Arc::new(ScriptedRunner::new());
        let usb = FakeUsbSource::new();
        let clock = Arc::new(ManualClock::new());
        let opener = MockOpener::new();
        let profile = TargetProfile::rp2040();
        usb.add("/dev/ttyACM0", profile.bootloader_identity());

        let orchestrator = Orchestrator::new(
            profile.clone(),
            Timings::default(),
            DebugProbe::new(runner.clone(), profile.chip),
            UsbLocator::new(Box::new(usb.clone()), clock.clone()),
            MassStorageLocator::new(Box::new(FakeStorage::new()), clock.clone()),
            clock.clone(),
        );
        let upload = UploadClient::new(runner.clone(), vec!["crispy-upload".into()]);
        let bench = Bench::new(orchestrator, upload, Box::new(opener.clone()));
        Rig {
            runner,
            usb,
            opener,
            clock,
            bench,
        }
    }

    #[test]
    fn test_upload_to_bank_forces_update_mode_first() {
        let rig = rig();
        rig.bench
            .upload_to_bank(Path::new("fw_rs.bin"), 0, 1)
            .unwrap();

        let commands = rig.runner.commands();
        assert_eq!(commands.len(), 4);
        assert!(commands[2].ends_with("reset --chip rp2040"));
        assert_eq!(
            commands[3],
            "crispy-upload --port /dev/ttyACM0 upload fw_rs.bin --bank 0 --version 1"
        );
    }

    #[test]
    fn test_upload_failure_carries_output() {
        let rig = rig();
        rig.runner
            .on(" upload ", Ok(CommandResult::failed("Error: bank erase timed out")));

        let err = rig
            .bench
            .upload_to_bank(Path::new("fw_rs.bin"), 0, 1)
            .unwrap_err();
        assert!(err.to_string().contains("bank erase timed out"));
    }

    #[test]
    fn test_boot_bank_confirms_reported_bank() {
        let rig = rig();
        rig.usb.add("/dev/ttyACM1", TargetProfile::rp2040().firmware_identity());
        let fw = MockPort::new("/dev/ttyACM1");
        fw.reply_to("status\r\n", "Crispy Firmware Sample (Rust)\r\nBank: 0\r\n");
        rig.opener.insert(fw.clone());

        let port = rig.bench.boot_bank(0, 0x000B).unwrap();

        assert_eq!(port, "/dev/ttyACM1");
        assert_eq!(
            rig.runner.commands(),
            [
                "crispy-upload --port /dev/ttyACM0 set-bank 0",
                "crispy-upload --port /dev/ttyACM0 reboot",
            ]
        );
        assert_eq!(fw.written(), b"status\r\n");
    }

    #[test]
    fn test_boot_bank_rejects_wrong_bank() {
        let rig = rig();
        rig.usb.add("/dev/ttyACM1", TargetProfile::rp2040().firmware_identity());
        let fw = MockPort::new("/dev/ttyACM1");
        fw.reply_to("status\r\n", "Bank: 1\r\n");
        rig.opener.insert(fw);

        let err = rig.bench.boot_bank(0, 0x000B).unwrap_err();
        assert!(err.to_string().contains("Bank: 0"));
    }

    #[test]
    fn test_return_to_bootloader() {
        let rig = rig();
        let fw = MockPort::new("/dev/ttyACM1");
        rig.opener.insert(fw.clone());
        rig.runner.on(" status", Ok(CommandResult::ok(UPDATE_MODE_STATUS)));

        let status = rig.bench.return_to_bootloader("/dev/ttyACM1").unwrap();

        assert!(status.is_update_mode());
        assert_eq!(fw.written(), b"bootload\r\n");
        assert_eq!(rig.opener.opened(), ["/dev/ttyACM1"]);
    }

    #[test]
    fn test_wipe_requires_update_mode() {
        let rig = rig();
        rig.runner
            .on(" status", Ok(CommandResult::ok("  Active bank: 0 (A)\n  State: Running\n")));

        assert!(rig.bench.wipe_and_confirm().is_err());
        assert_eq!(
            rig.runner.commands(),
            [
                "crispy-upload --port /dev/ttyACM0 wipe",
                "crispy-upload --port /dev/ttyACM0 reboot",
                "crispy-upload --port /dev/ttyACM0 status",
            ]
        );
    }

    #[test]
    fn test_wipe_reboots_before_checking_status() {
        let rig = rig();
        rig.runner.on(" status", Ok(CommandResult::ok(UPDATE_MODE_STATUS)));

        let status = rig.bench.wipe_and_confirm().unwrap();

        assert!(status.is_update_mode());
        let commands = rig.runner.commands();
        assert!(commands[1].ends_with(" reboot"));
        assert!(commands[2].ends_with(" status"));
        assert_eq!(rig.clock.elapsed(), Timings::default().reboot_settle);
    }

    #[test]
    fn test_query_status_parses_output() {
        let rig = rig();
        rig.runner.push(Ok(CommandResult::ok(UPDATE_MODE_STATUS)));

        let status = rig.bench.query_status("/dev/ttyACM0").unwrap();
        assert_eq!(status.active_bank, Some(0));
    }
}
