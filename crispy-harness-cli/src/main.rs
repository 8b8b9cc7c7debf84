//! crispy-harness CLI - hardware test orchestration for crispy-bootloader.
//!
//! ## Features
//!
//! - Convert raw binaries to UF2 and inspect UF2 files
//! - Locate the bootloader, firmware and BOOTSEL volume
//! - Force update mode or BOOTSEL through a debug probe
//! - Deploy UF2 files through mass storage
//! - Talk to firmware over its serial console

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;

use commands::Harness;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if spinners and colors should be used.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors raised by the CLI itself rather than the library.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
}

/// crispy-harness - drive crispy-bootloader test hardware.
///
/// Environment variables:
///   CRISPY_DEVICE   - Serial port for send / wait-banner / bootloader-status
///   CRISPY_PROBE    - probe-rs executable
///   CRISPY_UPLOAD   - Upload utility command line
///   RUST_LOG        - Log filter (overrides -v / -q)
#[derive(Parser)]
#[command(name = "crispy-harness")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// probe-rs executable.
    #[arg(long, global = true, env = "CRISPY_PROBE")]
    probe: Option<String>,

    /// Chip name passed to probe-rs.
    #[arg(long, global = true)]
    chip: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Convert a raw binary file to UF2.
    Bin2uf2 {
        /// Input binary file.
        input: PathBuf,

        /// Output UF2 file.
        output: PathBuf,

        /// Base address in hex (default: target flash base).
        #[arg(short = 'a', long, value_parser = parse_hex_u32)]
        base_address: Option<u32>,

        /// Family id in hex (default: target family).
        #[arg(short, long, value_parser = parse_hex_u32)]
        family: Option<u32>,
    },

    /// Validate and summarize a UF2 file.
    Uf2Info {
        /// UF2 file.
        file: PathBuf,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List serial ports, tagging crispy devices.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Wait for a USB serial device by VID:PID and print its path.
    FindPort {
        /// Vendor id in hex (default: target vendor).
        #[arg(long, value_parser = parse_hex_u16)]
        vid: Option<u16>,

        /// Product id in hex (default: bootloader).
        #[arg(long, value_parser = parse_hex_u16)]
        pid: Option<u16>,

        /// Timeout in seconds.
        #[arg(short, long)]
        timeout: Option<f64>,
    },

    /// Wait for the mass-storage volume and print its mount point.
    FindVolume {
        /// Volume label (default: target label).
        #[arg(short, long)]
        label: Option<String>,

        /// Timeout in seconds.
        #[arg(short, long)]
        timeout: Option<f64>,
    },

    /// Force the bootloader into update mode via the debug probe.
    UpdateMode {
        /// Do not wait for the bootloader to enumerate.
        #[arg(long)]
        no_wait: bool,
    },

    /// Force mask-ROM BOOTSEL mode via the debug probe.
    Bootsel {
        /// Do not wait for the volume to appear.
        #[arg(long)]
        no_wait: bool,
    },

    /// Force BOOTSEL and copy a UF2 file to the volume.
    DeployUf2 {
        /// UF2 file.
        file: PathBuf,
    },

    /// Show which state the device appears to be in.
    State {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Send a text command over serial and print the reply.
    Send {
        /// Serial port.
        #[arg(short, long, env = "CRISPY_DEVICE")]
        port: String,

        /// Command text (CR LF appended).
        command: String,

        /// Wait before reading the reply, in milliseconds.
        #[arg(long)]
        settle_ms: Option<u64>,
    },

    /// Read a serial port until some text appears.
    WaitBanner {
        /// Serial port.
        #[arg(short, long, env = "CRISPY_DEVICE")]
        port: String,

        /// Text to wait for.
        text: String,

        /// Timeout in seconds.
        #[arg(short, long, default_value = "10")]
        timeout: f64,
    },

    /// Query the bootloader through the upload utility.
    BootloaderStatus {
        /// Bootloader port (found by USB identity if omitted).
        #[arg(short, long, env = "CRISPY_DEVICE")]
        port: Option<String>,

        /// Upload utility command line.
        #[arg(long, env = "CRISPY_UPLOAD")]
        upload: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Parse hexadecimal value (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let value = parse_hex_u32(s)?;
    u16::try_from(value).map_err(|_| format!("{s} does not fit in 16 bits"))
}

/// Map an error to a process exit code.
///
/// 2 usage, 3 configuration, 4 device not found, 5 timeout, 1 anything else.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli) = cause.downcast_ref::<CliError>() {
            return match cli {
                CliError::Usage(_) => 2,
                CliError::Config(_) => 3,
            };
        }
        if let Some(lib) = cause.downcast_ref::<crispy_harness::Error>() {
            return match lib {
                crispy_harness::Error::DeviceNotFound(_) => 4,
                crispy_harness::Error::Timeout(_) => 5,
                crispy_harness::Error::Config(_) => 3,
                _ => 1,
            };
        }
    }
    1
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "crispy-harness v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "{} {err:#}",
                console::style("Error:").red().bold()
            );
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match cli.config_path {
        Some(ref path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    let harness = Harness::new(cli.quiet, cli.probe.clone(), cli.chip.clone(), config);

    match &cli.command {
        Commands::Bin2uf2 {
            input,
            output,
            base_address,
            family,
        } => commands::image::cmd_bin2uf2(
            &harness,
            input,
            output,
            base_address.unwrap_or(harness.profile.flash_base),
            family.unwrap_or(harness.profile.family_id),
        ),
        Commands::Uf2Info { file, json } => commands::image::cmd_uf2_info(&harness, file, *json),
        Commands::ListPorts { json } => commands::discover::cmd_list_ports(&harness, *json),
        Commands::FindPort { vid, pid, timeout } => {
            commands::discover::cmd_find_port(&harness, *vid, *pid, *timeout)
        },
        Commands::FindVolume { label, timeout } => {
            commands::discover::cmd_find_volume(&harness, label.as_deref(), *timeout)
        },
        Commands::UpdateMode { no_wait } => commands::recover::cmd_update_mode(&harness, !*no_wait),
        Commands::Bootsel { no_wait } => commands::recover::cmd_bootsel(&harness, !*no_wait),
        Commands::DeployUf2 { file } => commands::recover::cmd_deploy_uf2(&harness, file),
        Commands::State { json } => commands::recover::cmd_state(&harness, *json),
        Commands::Send {
            port,
            command,
            settle_ms,
        } => commands::session::cmd_send(&harness, port, command, *settle_ms),
        Commands::WaitBanner {
            port,
            text,
            timeout,
        } => commands::session::cmd_wait_banner(&harness, port, text, *timeout),
        Commands::BootloaderStatus { port, upload, json } => {
            commands::session::cmd_bootloader_status(
                &harness,
                port.as_deref(),
                upload.as_deref(),
                *json,
            )
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x10000000"), Ok(0x1000_0000));
        assert_eq!(parse_hex_u32("E48BFF56"), Ok(0xE48B_FF56));
        assert_eq!(parse_hex_u32("0x1000_0100"), Ok(0x1000_0100));
        assert!(parse_hex_u32("0xZZ").is_err());
    }

    #[test]
    fn test_parse_hex_u16() {
        assert_eq!(parse_hex_u16("2e8a"), Ok(0x2E8A));
        assert_eq!(parse_hex_u16("0x000A"), Ok(0x000A));
        assert!(parse_hex_u16("0x10000").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let not_found = anyhow::Error::new(crispy_harness::Error::DeviceNotFound("RPI-RP2".into()));
        assert_eq!(exit_code_for(&not_found), 4);

        let timeout = anyhow::Error::new(crispy_harness::Error::Timeout("banner".into()))
            .context("waiting for firmware");
        assert_eq!(exit_code_for(&timeout), 5);

        let config = anyhow::Error::new(CliError::Config("bad".into()));
        assert_eq!(exit_code_for(&config), 3);

        let usage = anyhow::Error::new(CliError::Usage("bad".into()));
        assert_eq!(exit_code_for(&usage), 2);

        let other = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
