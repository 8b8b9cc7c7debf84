//! Recovery commands driven through the debug probe.

use super::Harness;
use anyhow::{Context, Result};
use console::style;
use crispy_harness::DeviceState;
use log::warn;
use std::path::Path;

/// Force update mode, optionally waiting for the bootloader port.
pub(crate) fn cmd_update_mode(harness: &Harness, wait: bool) -> Result<()> {
    let orchestrator = harness.orchestrator();

    let pb = harness.spinner("Entering update mode via debug probe...");
    let entry = orchestrator.enter_update_mode();
    pb.finish_and_clear();
    let entry = entry.context("Failed to enter update mode")?;

    if !entry.descriptor_erased {
        warn!("Boot data was not erased; update mode relies on the RAM magic");
    }

    if !wait {
        if !harness.quiet {
            eprintln!("{} Reset issued", style("✓").green());
        }
        return Ok(());
    }

    let pb = harness.spinner("Waiting for bootloader...");
    let port = orchestrator.wait_for_bootloader(harness.timings.port_timeout);
    pb.finish_and_clear();
    let port = port.context("Bootloader did not enumerate after reset")?;

    if !harness.quiet {
        eprintln!("{} Bootloader in update mode", style("✓").green());
    }
    println!("{port}");
    Ok(())
}

/// Force BOOTSEL, optionally waiting for the volume.
pub(crate) fn cmd_bootsel(harness: &Harness, wait: bool) -> Result<()> {
    let orchestrator = harness.orchestrator();

    if !wait {
        orchestrator
            .force_bootsel()
            .context("Failed to force BOOTSEL")?;
        if !harness.quiet {
            eprintln!("{} Stage 2 invalidated, reset issued", style("✓").green());
        }
        return Ok(());
    }

    let pb = harness.spinner("Forcing BOOTSEL...");
    let mount = orchestrator.enter_mass_storage();
    pb.finish_and_clear();
    let mount = mount.context("Failed to reach mass-storage mode")?;

    if !harness.quiet {
        eprintln!("{} Mass-storage mode", style("✓").green());
    }
    println!("{}", mount.display());
    Ok(())
}

/// Force BOOTSEL and copy a UF2 file.
pub(crate) fn cmd_deploy_uf2(harness: &Harness, file: &Path) -> Result<()> {
    if !file.is_file() {
        anyhow::bail!("UF2 file not found: {}", file.display());
    }
    let orchestrator = harness.orchestrator();

    let pb = harness.spinner(format!("Deploying {}...", file.display()));
    let dest = orchestrator.deploy_uf2_file(file);
    pb.finish_and_clear();
    let dest = dest.with_context(|| format!("Failed to deploy {}", file.display()))?;

    if !harness.quiet {
        eprintln!(
            "{} Copied to {}, device rebooted",
            style("✓").green(),
            style(dest.display()).cyan()
        );
    }
    Ok(())
}

/// Print the observed device state.
pub(crate) fn cmd_state(harness: &Harness, json: bool) -> Result<()> {
    let state = harness.orchestrator().observe();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": state,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let styled = match state {
        DeviceState::Unknown => style(state.to_string()).dim(),
        _ => style(state.to_string()).green(),
    };
    println!("{styled}");
    Ok(())
}
