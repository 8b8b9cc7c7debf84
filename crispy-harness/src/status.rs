//! Parsing of textual device responses.
//!
//! The upload utility prints a block like
//!
//! ```text
//! Bootloader Status:
//!   Bootloader:  0.3.1
//!   Active bank: 0 (A)
//!   Version A:   1
//!   Version B:   2
//!   State:       UpdateMode
//! ```
//!
//! and the sample firmwares answer `status` with a line containing
//! `Bank: N`. Matching is deliberately loose about case, spacing and
//! `key=value` versus `key: value`.

use crate::error::{Error, Result};
use serde::Serialize;

/// Bootloader state as reported by the upload utility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootloaderStatus {
    /// Bootloader version string, `None` when reported as unknown.
    pub bootloader_version: Option<String>,
    /// Bank the bootloader will boot next.
    pub active_bank: Option<u8>,
    /// Firmware version stored in bank A.
    pub version_a: Option<u32>,
    /// Firmware version stored in bank B.
    pub version_b: Option<u32>,
    /// State name, e.g. `UpdateMode`.
    pub state: Option<String>,
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn leading_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

impl BootloaderStatus {
    /// Parse upload-utility `status` output (stdout and stderr combined is
    /// fine). Fails when no known field is present.
    pub fn parse(text: &str) -> Result<Self> {
        let mut status = Self::default();
        let mut recognised = false;

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':').or_else(|| line.split_once('=')) else {
                continue;
            };
            let value = value.trim();
            match normalize(key).as_str() {
                "bootloader" => {
                    recognised = true;
                    if !value.is_empty() && !value.eq_ignore_ascii_case("unknown") {
                        status.bootloader_version = Some(value.to_string());
                    }
                },
                "activebank" => {
                    recognised = true;
                    status.active_bank = leading_number(value);
                },
                "versiona" => {
                    recognised = true;
                    status.version_a = leading_number(value);
                },
                "versionb" => {
                    recognised = true;
                    status.version_b = leading_number(value);
                },
                "state" => {
                    recognised = true;
                    status.state = Some(value.to_string());
                },
                _ => {},
            }
        }

        if recognised {
            Ok(status)
        } else {
            Err(Error::Parse("no bootloader status fields in output".to_string()))
        }
    }

    /// Whether the reported state is update mode, in any spelling.
    pub fn is_update_mode(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|s| normalize(s) == "updatemode")
    }
}

/// Whether free text mentions update mode (`UpdateMode`, `update_mode`,
/// `Update Mode`).
pub fn mentions_update_mode(text: &str) -> bool {
    normalize(text).contains("updatemode")
}

/// Bank number from a firmware `status` reply (`Bank: N`).
pub fn firmware_bank(text: &str) -> Option<u8> {
    text.match_indices("Bank:")
        .find_map(|(at, token)| leading_number(&text[at + token.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_OUTPUT: &str = "Bootloader Status:\n  \
        Bootloader:  0.3.1\n  \
        Active bank: 1 (B)\n  \
        Version A:   1\n  \
        Version B:   7\n  \
        State:       UpdateMode\n";

    #[test]
    fn test_parse_status_block() {
        let status = BootloaderStatus::parse(STATUS_OUTPUT).unwrap();
        assert_eq!(status.bootloader_version.as_deref(), Some("0.3.1"));
        assert_eq!(status.active_bank, Some(1));
        assert_eq!(status.version_a, Some(1));
        assert_eq!(status.version_b, Some(7));
        assert!(status.is_update_mode());
    }

    #[test]
    fn test_parse_key_value_form() {
        let status = BootloaderStatus::parse("active_bank=0\nstate=update_mode\n").unwrap();
        assert_eq!(status.active_bank, Some(0));
        assert!(status.is_update_mode());
    }

    #[test]
    fn test_unknown_bootloader_version() {
        let status = BootloaderStatus::parse("  Bootloader:  unknown\n  State: Running\n").unwrap();
        assert_eq!(status.bootloader_version, None);
        assert!(!status.is_update_mode());
    }

    #[test]
    fn test_parse_rejects_unrelated_text() {
        assert!(BootloaderStatus::parse("Error: no response from device").is_err());
    }

    #[test]
    fn test_mentions_update_mode() {
        assert!(mentions_update_mode("State: Update Mode"));
        assert!(mentions_update_mode("state=UPDATE_MODE"));
        assert!(!mentions_update_mode("State: Running"));
    }

    #[test]
    fn test_firmware_bank() {
        assert_eq!(firmware_bank("Crispy Firmware Sample (Rust)\r\nBank: 0\r\n"), Some(0));
        assert_eq!(firmware_bank("Bank:1"), Some(1));
        assert_eq!(firmware_bank("Bank: ?"), None);
        assert_eq!(firmware_bank("no bank here"), None);
    }
}
