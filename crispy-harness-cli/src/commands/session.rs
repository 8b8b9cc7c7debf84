//! Serial console and upload-utility commands.

use super::Harness;
use anyhow::{Context, Result, bail};
use console::style;
use crispy_harness::{BootloaderStatus, NativeOpener, SerialConfig, SerialSession, SystemClock};
use std::sync::Arc;
use std::time::Duration;

fn open_session(port: &str) -> Result<SerialSession> {
    SerialSession::open(&NativeOpener, &SerialConfig::new(port), Arc::new(SystemClock))
        .with_context(|| format!("Failed to open {port}"))
}

/// Send a line and print whatever comes back.
pub(crate) fn cmd_send(
    harness: &Harness,
    port: &str,
    command: &str,
    settle_ms: Option<u64>,
) -> Result<()> {
    let settle = settle_ms.map_or(harness.timings.serial_settle, Duration::from_millis);
    let mut session = open_session(port)?;
    let reply = session
        .send_command(command, settle)
        .with_context(|| format!("Failed to send '{command}' to {port}"))?;

    print!("{reply}");
    if !reply.ends_with('\n') && !reply.is_empty() {
        println!();
    }
    Ok(())
}

/// Read until `text` shows up, then print everything read.
pub(crate) fn cmd_wait_banner(harness: &Harness, port: &str, text: &str, timeout: f64) -> Result<()> {
    let timeout = super::seconds_or(Some(timeout), harness.timings.port_timeout)?;
    let mut session = open_session(port)?;

    let pb = harness.spinner(format!("Waiting for '{text}' on {port}..."));
    let result = session.wait_for(text, timeout);
    pb.finish_and_clear();

    let output = result?;
    print!("{output}");
    if !output.ends_with('\n') {
        println!();
    }
    Ok(())
}

/// Run the upload utility's `status` and print the parsed result.
pub(crate) fn cmd_bootloader_status(
    harness: &Harness,
    port: Option<&str>,
    upload: Option<&str>,
    json: bool,
) -> Result<()> {
    let client = harness.upload_client(upload)?;
    let port = match port {
        Some(port) => port.to_string(),
        None => {
            let pb = harness.spinner("Waiting for bootloader...");
            let found = harness
                .orchestrator()
                .wait_for_bootloader(harness.timings.port_timeout);
            pb.finish_and_clear();
            found.context("Bootloader port not found")?
        },
    };

    let result = client.status(&port)?;
    if !result.success {
        bail!(
            "Upload utility status failed on {port}:\n{}",
            result.combined_output().trim()
        );
    }
    let status = BootloaderStatus::parse(&result.combined_output())?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "port": port,
                "status": status,
                "update_mode": status.is_update_mode(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let unknown = || style("?").dim().to_string();
    eprintln!("{}", style("Bootloader Status").bold().underlined());
    eprintln!("  Port:        {port}");
    eprintln!(
        "  Version:     {}",
        status.bootloader_version.clone().unwrap_or_else(unknown)
    );
    eprintln!(
        "  Active bank: {}",
        status
            .active_bank
            .map_or_else(unknown, |b| b.to_string())
    );
    eprintln!(
        "  Version A:   {}",
        status.version_a.map_or_else(unknown, |v| v.to_string())
    );
    eprintln!(
        "  Version B:   {}",
        status.version_b.map_or_else(unknown, |v| v.to_string())
    );
    let state = status.state.clone().unwrap_or_else(unknown);
    if status.is_update_mode() {
        eprintln!("  State:       {}", style(state).green());
    } else {
        eprintln!("  State:       {}", style(state).yellow());
    }
    Ok(())
}
