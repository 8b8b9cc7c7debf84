//! Port listing and device/volume lookup commands.

use super::{Harness, seconds_or};
use anyhow::{Context, Result};
use console::style;
use crispy_harness::device::UsbSource;
use crispy_harness::{
    DeviceKind, MassStorageLocator, SystemClock, SystemRunner, SystemStorage, UsbIdentity,
    UsbLocator, detect_ports, format_port_list,
};
use std::sync::Arc;

/// Platform USB enumeration source.
pub(crate) fn usb_source() -> Box<dyn UsbSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(crispy_harness::SysfsUsbSource::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(crispy_harness::SerialportUsbSource)
    }
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(harness: &Harness, json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                let kind = p
                    .identity()
                    .map(|id| DeviceKind::classify(&id, &harness.profile));
                serde_json::json!({
                    "name": p.name,
                    "device": kind.map(|k| k.name()),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for line in format_port_list(&detected, &harness.profile) {
            eprintln!("  {} {}", style("•").green(), line);
        }
    }
    Ok(())
}

/// Wait for a USB identity and print the port path on stdout.
pub(crate) fn cmd_find_port(
    harness: &Harness,
    vid: Option<u16>,
    pid: Option<u16>,
    timeout: Option<f64>,
) -> Result<()> {
    let identity = UsbIdentity::from_ids(
        vid.unwrap_or(harness.profile.usb_vid),
        pid.unwrap_or(harness.profile.bootloader_pid),
    );
    let timeout = seconds_or(timeout, harness.timings.port_timeout)?;

    let locator = UsbLocator::new(usb_source(), Arc::new(SystemClock))
        .with_interval(harness.timings.poll_interval);
    let pb = harness.spinner(format!("Waiting for USB device {identity}..."));
    let result = locator.find_port(&identity, timeout);
    pb.finish_and_clear();

    let port = result.with_context(|| format!("Looking for {identity}"))?;
    println!("{port}");
    Ok(())
}

/// Wait for the mass-storage volume and print its mount point on stdout.
pub(crate) fn cmd_find_volume(harness: &Harness, label: Option<&str>, timeout: Option<f64>) -> Result<()> {
    let label = label.unwrap_or(&harness.profile.volume_label);
    let timeout = seconds_or(timeout, harness.timings.volume_timeout)?;

    let locator = MassStorageLocator::new(
        Box::new(SystemStorage::new(Arc::new(SystemRunner))),
        Arc::new(SystemClock),
    )
    .with_interval(harness.timings.poll_interval);
    let pb = harness.spinner(format!("Waiting for {label} volume..."));
    let result = locator.find_volume(label, timeout);
    pb.finish_and_clear();

    let mount = result.with_context(|| format!("Looking for volume {label}"))?;
    println!("{}", mount.display());
    Ok(())
}
