//! Command implementations.
//!
//! Each group of subcommands lives in its own module. They share a
//! [`Harness`] holding the resolved profile, timings and tool locations.

pub(crate) mod discover;
pub(crate) mod image;
pub(crate) mod recover;
pub(crate) mod session;

use crate::CliError;
use crate::config::Config;
use crate::use_fancy_output;
use crispy_harness::probe::DEFAULT_PROBE_PROGRAM;
use crispy_harness::upload::default_argv;
use crispy_harness::{Orchestrator, SystemRunner, TargetProfile, Timings, UploadClient};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Settings resolved from flags, environment and configuration file.
pub(crate) struct Harness {
    pub quiet: bool,
    pub profile: TargetProfile,
    pub timings: Timings,
    pub probe_program: String,
    pub upload_argv: Vec<String>,
    pub project_root: Option<PathBuf>,
}

impl Harness {
    /// Resolve settings; flags win over the configuration file.
    pub fn new(quiet: bool, probe: Option<String>, chip: Option<String>, config: Config) -> Self {
        let timings = config.timings();
        let Config { mut target, tools, .. } = config;
        if let Some(chip) = chip {
            target.chip = chip;
        }

        Self {
            quiet,
            profile: target,
            timings,
            probe_program: probe
                .or(tools.probe)
                .unwrap_or_else(|| DEFAULT_PROBE_PROGRAM.to_string()),
            upload_argv: tools.upload.unwrap_or_else(default_argv),
            project_root: tools.project_root,
        }
    }

    /// Orchestrator running real tools.
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::system(self.profile.clone(), self.timings, &self.probe_program)
    }

    /// Upload utility client. `command_line` replaces the configured argv.
    pub fn upload_client(&self, command_line: Option<&str>) -> Result<UploadClient, CliError> {
        let argv = match command_line {
            Some(line) => line.split_whitespace().map(String::from).collect(),
            None => self.upload_argv.clone(),
        };
        if argv.is_empty() {
            return Err(CliError::Usage("upload utility command line is empty".to_string()));
        }

        let mut client =
            UploadClient::new(Arc::new(SystemRunner), argv).with_timeout(self.timings.upload_timeout);
        if let Some(ref root) = self.project_root {
            client = client.current_dir(root);
        }
        Ok(client)
    }

    /// Spinner on stderr, hidden when quiet or not on a terminal.
    pub fn spinner(&self, message: impl Into<String>) -> ProgressBar {
        if self.quiet || !use_fancy_output() {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}") {
            pb.set_style(style);
        }
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.set_message(message.into());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

/// Seconds from the command line, or `default`.
pub(crate) fn seconds_or(value: Option<f64>, default: Duration) -> Result<Duration, CliError> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|_| CliError::Usage(format!("invalid timeout: {secs}"))),
    }
}
