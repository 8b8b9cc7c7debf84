//! Target chip profile.
//!
//! All hardware addresses, magic values and USB identifiers live in a single
//! [`TargetProfile`] handed to the orchestrator and the UF2 encoder, so a
//! different board can be described without touching any sequencing logic.

use crate::device::UsbIdentity;
use crate::image::uf2::RP2040_FAMILY_ID;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chip constants used by recovery operations and image encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetProfile {
    /// Chip name passed to the debug probe (`--chip`).
    pub chip: String,
    /// UF2 family identifier.
    pub family_id: u32,
    /// XIP flash base address, default UF2 base.
    pub flash_base: u32,
    /// Stage-2 bootloader base address.
    pub boot2_addr: u32,
    /// Stage-2 bootloader size in bytes.
    pub boot2_size: u32,
    /// Boot-data (firmware descriptor) sector base address.
    pub boot_data_addr: u32,
    /// Boot-data sector size in bytes.
    pub boot_data_size: u32,
    /// RAM address the bootloader checks for the update-mode magic.
    pub ram_update_flag_addr: u32,
    /// Magic value requesting update mode.
    pub ram_update_magic: u32,
    /// USB vendor id shared by bootloader and firmware.
    pub usb_vid: u16,
    /// USB product id of the bootloader (and of SDK-default firmware).
    pub bootloader_pid: u16,
    /// USB product id of firmware that uses its own identity.
    pub firmware_pid: u16,
    /// Volume label of the mask-ROM mass-storage mode.
    pub volume_label: String,
}

impl TargetProfile {
    /// Profile for the RP2040 running crispy-bootloader.
    pub fn rp2040() -> Self {
        Self {
            chip: "rp2040".to_string(),
            family_id: RP2040_FAMILY_ID,
            flash_base: 0x1000_0000,
            boot2_addr: 0x1000_0000,
            boot2_size: 256,
            boot_data_addr: 0x1019_0000,
            boot_data_size: 4096,
            ram_update_flag_addr: 0x2003_BFF0,
            ram_update_magic: 0x0FDA_7E00,
            usb_vid: 0x2E8A,
            bootloader_pid: 0x000A,
            firmware_pid: 0x000B,
            volume_label: "RPI-RP2".to_string(),
        }
    }

    /// USB identity of the bootloader in update mode.
    pub fn bootloader_identity(&self) -> UsbIdentity {
        UsbIdentity::from_ids(self.usb_vid, self.bootloader_pid)
    }

    /// USB identity of firmware with its own product id.
    pub fn firmware_identity(&self) -> UsbIdentity {
        UsbIdentity::from_ids(self.usb_vid, self.firmware_pid)
    }
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self::rp2040()
    }
}

/// Delays and default timeouts used by recovery sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Interval between enumeration polls.
    pub poll_interval: Duration,
    /// Wait after a reset into update mode for USB to come up.
    pub update_mode_settle: Duration,
    /// Wait after a BOOTSEL reset before looking for the volume.
    pub bootsel_enumeration: Duration,
    /// Wait after the UF2 copy for the autonomous reboot.
    pub uf2_reboot_settle: Duration,
    /// Wait after a reboot command before looking for the new identity.
    pub reboot_settle: Duration,
    /// Wait between writing a serial command and reading the reply.
    pub serial_settle: Duration,
    /// Default timeout for USB identity lookups.
    pub port_timeout: Duration,
    /// Default timeout for the mass-storage volume.
    pub volume_timeout: Duration,
    /// Timeout for a single upload-utility run.
    pub upload_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            update_mode_settle: Duration::from_secs(3),
            bootsel_enumeration: Duration::from_secs(2),
            uf2_reboot_settle: Duration::from_secs(3),
            reboot_settle: Duration::from_secs(3),
            serial_settle: Duration::from_secs(1),
            port_timeout: Duration::from_secs(15),
            volume_timeout: Duration::from_secs(15),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rp2040_identities() {
        let profile = TargetProfile::rp2040();
        assert_eq!(profile.bootloader_identity().to_string(), "2e8a:000a");
        assert_eq!(profile.firmware_identity().to_string(), "2e8a:000b");
    }

    #[test]
    fn test_partial_profile_from_json_keeps_defaults() {
        let profile: TargetProfile =
            serde_json::from_str(r#"{"volume_label": "MY-BOOT", "boot2_size": 512}"#).unwrap();
        assert_eq!(profile.volume_label, "MY-BOOT");
        assert_eq!(profile.boot2_size, 512);
        assert_eq!(profile.chip, "rp2040");
        assert_eq!(profile.ram_update_magic, 0x0FDA_7E00);
    }
}
