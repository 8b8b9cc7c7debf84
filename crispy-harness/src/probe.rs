//! Debug-probe command executor.
//!
//! Thin wrapper over the `probe-rs` command line. Each method maps to a single
//! invocation and reports the outcome as a [`CommandResult`]; nothing here
//! retries or raises on a failed run, so the recovery layer decides whether a
//! failure is tolerable.

use crate::command::{CommandResult, CommandRunner, Invocation};
use log::{debug, trace};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default `probe-rs` executable.
pub const DEFAULT_PROBE_PROGRAM: &str = "probe-rs";

/// Upper bound for a single probe invocation. Full-chip erases of 2 MiB flash
/// finish well inside this.
const PROBE_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs `probe-rs` subcommands against one chip.
#[derive(Clone)]
pub struct DebugProbe {
    runner: Arc<dyn CommandRunner>,
    program: String,
    chip: String,
}

impl DebugProbe {
    /// Probe targeting `chip` through the default `probe-rs` executable.
    pub fn new(runner: Arc<dyn CommandRunner>, chip: impl Into<String>) -> Self {
        Self {
            runner,
            program: DEFAULT_PROBE_PROGRAM.to_string(),
            chip: chip.into(),
        }
    }

    /// Use a different executable (path or name).
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Chip name passed as `--chip`.
    pub fn chip(&self) -> &str {
        &self.chip
    }

    /// Executable being run.
    pub fn program(&self) -> &str {
        &self.program
    }

    fn subcommand(&self, name: &str) -> Invocation {
        Invocation::new(&self.program)
            .args([name, "--chip", self.chip.as_str()])
            .with_timeout(PROBE_TIMEOUT)
    }

    /// Run and fold spawn errors and timeouts into a failed result.
    fn execute(&self, invocation: &Invocation) -> CommandResult {
        trace!("probe: {invocation}");
        match self.runner.run(invocation) {
            Ok(result) => {
                if !result.success {
                    debug!("probe command failed: {invocation}");
                }
                result
            },
            Err(e) => {
                debug!("probe command could not run: {e}");
                CommandResult::failed(e.to_string())
            },
        }
    }

    /// Erase the whole flash.
    pub fn erase_chip(&self) -> CommandResult {
        self.execute(&self.subcommand("erase"))
    }

    /// Flash an ELF image.
    pub fn download_elf(&self, elf: &Path) -> CommandResult {
        let invocation = self.subcommand("download").arg(elf.to_string_lossy());
        self.execute(&invocation)
    }

    /// Program raw bytes at `address`.
    ///
    /// The bytes go through a scratch `.bin` file that is removed when this
    /// returns, whether or not the download succeeded.
    pub fn program_binary(&self, address: u32, data: &[u8]) -> CommandResult {
        let scratch = match write_scratch(data) {
            Ok(file) => file,
            Err(e) => return CommandResult::failed(format!("cannot write scratch file: {e}")),
        };

        let invocation = self
            .subcommand("download")
            .args(["--binary-format", "bin", "--base-address"])
            .arg(format!("{address:#x}"))
            .arg(scratch.path().to_string_lossy());
        self.execute(&invocation)
    }

    /// Program `len` copies of `byte` at `address`.
    pub fn fill(&self, address: u32, len: usize, byte: u8) -> CommandResult {
        self.program_binary(address, &vec![byte; len])
    }

    /// Reset the target and let it run.
    pub fn reset(&self) -> CommandResult {
        self.execute(&self.subcommand("reset"))
    }

    /// Write a 32-bit word to target memory.
    pub fn write_word(&self, address: u32, value: u32) -> CommandResult {
        let invocation = self
            .subcommand("write")
            .arg("b32")
            .arg(format!("{address:#x}"))
            .arg(format!("{value:#x}"));
        self.execute(&invocation)
    }

    /// Read a 32-bit word from target memory.
    ///
    /// The value is `None` when the command failed or its output held no
    /// hexadecimal word.
    pub fn read_word(&self, address: u32) -> (CommandResult, Option<u32>) {
        let invocation = self
            .subcommand("read")
            .arg("b32")
            .arg(format!("{address:#x}"))
            .arg("1");
        let result = self.execute(&invocation);
        let value = if result.success {
            parse_first_word(&result.stdout)
        } else {
            None
        };
        (result, value)
    }
}

fn write_scratch(data: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("crispy-probe-")
        .suffix(".bin")
        .tempfile()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

/// First whitespace-separated token that parses as a hex word, with or
/// without `0x`.
fn parse_first_word(text: &str) -> Option<u32> {
    text.split_whitespace().find_map(|token| {
        let token = token.trim_end_matches(',');
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if digits.is_empty() || digits.len() > 8 {
            return None;
        }
        u32::from_str_radix(digits, 16).ok()
    })
}
