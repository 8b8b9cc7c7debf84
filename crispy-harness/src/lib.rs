//! # crispy-harness
//!
//! Hardware-test orchestration for the crispy dual-bank RP2040 bootloader.
//!
//! The device under test is driven from the host through three channels:
//!
//! - a debug probe (`probe-rs`) for erasing, programming and resetting,
//! - USB CDC serial ports, identified by vendor/product id,
//! - the mask-ROM mass-storage volume (`RPI-RP2`) accepting UF2 files.
//!
//! This crate provides:
//!
//! - UF2 block encoding and inspection
//! - USB identity and mass-storage volume locators with bounded polling
//! - A debug-probe command executor
//! - A recovery orchestrator forcing update mode or BOOTSEL from any state
//! - Upload-utility and serial session helpers for end-to-end scenarios
//!
//! ## Features
//!
//! - `native` (default): serial port access through the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use crispy_harness::{Orchestrator, RecoveryTarget, TargetProfile, Timings};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::system(TargetProfile::rp2040(), Timings::default(), "probe-rs");
//!
//!     let entry = orchestrator.enter_update_mode()?;
//!     if !entry.any_armed() {
//!         eprintln!("no update-mode trigger armed");
//!     }
//!     let port = orchestrator.wait_for_bootloader(std::time::Duration::from_secs(10))?;
//!     println!("bootloader on {port}");
//!
//!     orchestrator.reach(RecoveryTarget::MassStorageProgramming)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bench;
pub mod command;
pub mod device;
pub mod error;
pub mod image;
pub mod poll;
pub mod probe;
pub mod recovery;
pub mod serial;
pub mod status;
pub mod storage;
pub mod target;
pub mod upload;

#[cfg(test)]
mod testing;

#[cfg(feature = "native")]
pub use device::SerialportUsbSource;
#[cfg(feature = "native")]
pub use serial::{NativeOpener, NativePort};
pub use {
    bench::Bench,
    command::{CommandResult, CommandRunner, Invocation, SystemRunner},
    device::{DetectedPort, DeviceKind, SysfsUsbSource, UsbIdentity, UsbLocator, detect_ports, format_port_list},
    error::{Error, Result},
    image::{FirmwareImage, Uf2Block, Uf2Encoder, Uf2Summary},
    poll::{Clock, SystemClock, poll_until},
    probe::DebugProbe,
    recovery::{DeviceState, Orchestrator, RecoveryTarget, UpdateModeEntry},
    serial::{Port, PortOpener, SerialConfig, SerialSession, drain_utf8_lossy},
    status::{BootloaderStatus, firmware_bank},
    storage::{BlockDevice, MassStorageLocator, StorageSource, SystemStorage},
    target::{TargetProfile, Timings},
    upload::UploadClient,
};
