//! UF2 conversion and inspection commands.

use super::Harness;
use anyhow::{Context, Result};
use console::style;
use crispy_harness::image::uf2::BLOCK_SIZE;
use crispy_harness::{Uf2Encoder, Uf2Summary};
use std::path::Path;

/// Convert a raw binary into a UF2 file.
pub(crate) fn cmd_bin2uf2(
    harness: &Harness,
    input: &Path,
    output: &Path,
    base_address: u32,
    family_id: u32,
) -> Result<()> {
    let blocks = Uf2Encoder::new(family_id)
        .encode_file(input, output, base_address)
        .with_context(|| format!("Failed to convert {}", input.display()))?;

    if !harness.quiet {
        eprintln!(
            "{} {} -> {} ({} blocks, {} bytes, base {:#010x}, family {:#010x})",
            style("✓").green(),
            input.display(),
            style(output.display()).cyan(),
            blocks,
            blocks * BLOCK_SIZE,
            base_address,
            family_id
        );
    }
    Ok(())
}

/// Validate a UF2 file and print its summary.
pub(crate) fn cmd_uf2_info(harness: &Harness, file: &Path, json: bool) -> Result<()> {
    let summary = Uf2Summary::from_file(file)
        .with_context(|| format!("Failed to read UF2 file {}", file.display()))?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "file": file.display().to_string(),
                "blocks": summary.blocks,
                "family_id": format!("{:#010x}", summary.family_id),
                "start_addr": format!("{:#010x}", summary.start_addr),
                "end_addr": format!("{:#010x}", summary.end_addr),
                "payload_bytes": summary.payload_bytes,
                "matches_target": summary.family_id == harness.profile.family_id,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("UF2 Information").bold().underlined());
    eprintln!("  File:      {}", file.display());
    eprintln!("  Blocks:    {}", summary.blocks);
    eprintln!("  Payload:   {} bytes", summary.payload_bytes);
    eprintln!(
        "  Range:     {:#010x}..{:#010x}",
        summary.start_addr, summary.end_addr
    );
    let family = format!("{:#010x}", summary.family_id);
    if summary.family_id == harness.profile.family_id {
        eprintln!("  Family:    {} ({})", style(family).green(), harness.profile.chip);
    } else {
        eprintln!(
            "  Family:    {} (not {})",
            style(family).yellow(),
            harness.profile.chip
        );
    }
    Ok(())
}
