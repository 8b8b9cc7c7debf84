//! Upload-utility invoker.
//!
//! The bootloader's own host tool (`crispy-upload`) talks the binary update
//! protocol; the harness only runs it as a subprocess and hands its output
//! back for pattern matching.

use crate::command::{CommandResult, CommandRunner, Invocation};
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for one upload-utility run. Bank erase alone can take
/// tens of seconds.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Default command prefix: build and run the utility from the workspace.
pub fn default_argv() -> Vec<String> {
    ["cargo", "run", "--release", "-p", "crispy-upload", "--"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Runs the upload utility against a serial port.
#[derive(Clone)]
pub struct UploadClient {
    runner: Arc<dyn CommandRunner>,
    argv_prefix: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl UploadClient {
    /// Client running `argv_prefix` (program first) with the default timeout.
    pub fn new(runner: Arc<dyn CommandRunner>, argv_prefix: Vec<String>) -> Self {
        Self {
            runner,
            argv_prefix,
            cwd: None,
            timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    /// Run from `dir` (the firmware project root when using `cargo run`).
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Override the per-run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn invocation<I, S>(&self, port: &str, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (program, prefix) = match self.argv_prefix.split_first() {
            Some((program, rest)) => (program.as_str(), rest),
            None => ("crispy-upload", &[][..]),
        };
        let mut invocation = Invocation::new(program)
            .args(prefix.iter().cloned())
            .args(["--port", port])
            .args(args)
            .with_timeout(self.timeout);
        if let Some(ref cwd) = self.cwd {
            invocation = invocation.current_dir(cwd);
        }
        invocation
    }

    /// Run with arbitrary trailing arguments.
    pub fn run<I, S>(&self, port: &str, args: I) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run(&self.invocation(port, args))
    }

    /// `status`
    pub fn status(&self, port: &str) -> Result<CommandResult> {
        self.run(port, ["status"])
    }

    /// `upload <file> --bank <n> --version <v>`
    pub fn upload(&self, port: &str, file: &Path, bank: u8, version: u32) -> Result<CommandResult> {
        self.run(
            port,
            [
                "upload".to_string(),
                file.to_string_lossy().into_owned(),
                "--bank".to_string(),
                bank.to_string(),
                "--version".to_string(),
                version.to_string(),
            ],
        )
    }

    /// `set-bank <n>`
    pub fn set_bank(&self, port: &str, bank: u8) -> Result<CommandResult> {
        self.run(port, ["set-bank".to_string(), bank.to_string()])
    }

    /// `reboot`
    pub fn reboot(&self, port: &str) -> Result<CommandResult> {
        self.run(port, ["reboot"])
    }

    /// `wipe`
    pub fn wipe(&self, port: &str) -> Result<CommandResult> {
        self.run(port, ["wipe"])
    }
}
