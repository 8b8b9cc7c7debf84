//! Configuration file support for crispy-harness.
//!
//! The first file found wins, in this order:
//! 1. `--config PATH`
//! 2. `./crispy-harness.toml`
//! 3. Global config file (`~/.config/crispy-harness/config.toml` on Linux)
//!
//! Command-line flags and `CRISPY_*` environment variables override whatever
//! the file says.
//!
//! ```toml
//! [target]
//! chip = "rp2040"
//! volume_label = "RPI-RP2"
//!
//! [tools]
//! probe = "probe-rs"
//! upload = ["cargo", "run", "--release", "-p", "crispy-upload", "--"]
//! project_root = "/work/crispy-bootloader"
//!
//! [timeouts]
//! port_ms = 15000
//! volume_ms = 15000
//! ```

use crate::CliError;
use crispy_harness::{TargetProfile, Timings};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "crispy-harness.toml";

/// External tool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// `probe-rs` executable.
    pub probe: Option<String>,
    /// Upload utility command prefix, program first.
    pub upload: Option<Vec<String>>,
    /// Working directory for the upload utility.
    pub project_root: Option<PathBuf>,
}

/// Timeout and delay overrides in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Enumeration poll interval.
    pub poll_interval_ms: Option<u64>,
    /// Settle after resetting into update mode.
    pub update_mode_settle_ms: Option<u64>,
    /// Delay before looking for the BOOTSEL volume.
    pub bootsel_enumeration_ms: Option<u64>,
    /// Settle after copying a UF2 file.
    pub uf2_reboot_settle_ms: Option<u64>,
    /// Settle after a reboot command.
    pub reboot_settle_ms: Option<u64>,
    /// Delay between a serial command and reading its reply.
    pub serial_settle_ms: Option<u64>,
    /// USB identity lookup timeout.
    pub port_ms: Option<u64>,
    /// Mass-storage volume timeout.
    pub volume_ms: Option<u64>,
    /// Upload utility run timeout.
    pub upload_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chip profile overrides.
    #[serde(default)]
    pub target: TargetProfile,
    /// Tool locations.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Timing overrides.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl Config {
    /// Load the first configuration file found. Unreadable or malformed
    /// files are reported and skipped.
    pub fn load() -> Self {
        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(local) {
                Ok(config) => {
                    debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
                    return config;
                },
                Err(e) => warn!("{e}, using defaults"),
            }
            return Self::default();
        }

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                match Self::load_from_file(&global_path) {
                    Ok(config) => {
                        debug!("Loaded global config from {}", global_path.display());
                        return config;
                    },
                    Err(e) => warn!("{e}, using defaults"),
                }
            }
        }

        Self::default()
    }

    /// Load configuration from an explicitly requested file (`--config`).
    /// Unlike discovered files, failure here is an error.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let config = Self::load_from_file(path)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("invalid TOML in {}: {e}", path.display()))
        })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "crispy-harness").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Default timings with the `[timeouts]` overrides applied.
    pub fn timings(&self) -> Timings {
        let mut timings = Timings::default();
        let t = &self.timeouts;
        let apply = |slot: &mut Duration, ms: Option<u64>| {
            if let Some(ms) = ms {
                *slot = Duration::from_millis(ms);
            }
        };
        apply(&mut timings.poll_interval, t.poll_interval_ms);
        apply(&mut timings.update_mode_settle, t.update_mode_settle_ms);
        apply(&mut timings.bootsel_enumeration, t.bootsel_enumeration_ms);
        apply(&mut timings.uf2_reboot_settle, t.uf2_reboot_settle_ms);
        apply(&mut timings.reboot_settle, t.reboot_settle_ms);
        apply(&mut timings.serial_settle, t.serial_settle_ms);
        apply(&mut timings.port_timeout, t.port_ms);
        apply(&mut timings.volume_timeout, t.volume_ms);
        apply(&mut timings.upload_timeout, t.upload_ms);
        timings
    }
}
