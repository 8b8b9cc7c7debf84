//! USB serial device discovery.
//!
//! The bootloader and the sample firmwares enumerate as CDC-ACM serial ports.
//! They are told apart purely by USB vendor/product id, which the operating
//! system exposes per tty. Enumeration is racy: a port can be listed before
//! its sysfs attributes exist, so lookups poll and skip candidates whose
//! metadata cannot be read yet.
//!
//! ## Example
//!
//! ```rust,no_run
//! use crispy_harness::device::{SysfsUsbSource, UsbIdentity, UsbLocator};
//! use crispy_harness::poll::SystemClock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let locator = UsbLocator::new(Box::new(SysfsUsbSource::default()), Arc::new(SystemClock));
//! let port = locator.find_port(&UsbIdentity::from_ids(0x2E8A, 0x000A), Duration::from_secs(10))?;
//! println!("bootloader on {port}");
//! # Ok::<(), crispy_harness::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::poll::{Clock, poll_until};
use crate::target::TargetProfile;
use log::{debug, info, trace};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Fixed interval between enumeration passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A USB (vendor, product) pair in lowercase four-digit hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbIdentity {
    /// Vendor id, e.g. `2e8a`.
    pub vendor: String,
    /// Product id, e.g. `000a`.
    pub product: String,
}

impl UsbIdentity {
    /// Build from numeric ids.
    pub fn from_ids(vid: u16, pid: u16) -> Self {
        Self {
            vendor: format!("{vid:04x}"),
            product: format!("{pid:04x}"),
        }
    }

    /// Build from the raw text of sysfs `idVendor`/`idProduct` attributes.
    pub fn from_attributes(vendor: &str, product: &str) -> Self {
        Self {
            vendor: vendor.trim().to_ascii_lowercase(),
            product: product.trim().to_ascii_lowercase(),
        }
    }

    /// Parse `vvvv:pppp`.
    pub fn parse(s: &str) -> Result<Self> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| Error::Parse(format!("expected VID:PID, got '{s}'")))?;
        let vid = u16::from_str_radix(vid.trim(), 16)
            .map_err(|e| Error::Parse(format!("bad vendor id '{vid}': {e}")))?;
        let pid = u16::from_str_radix(pid.trim(), 16)
            .map_err(|e| Error::Parse(format!("bad product id '{pid}': {e}")))?;
        Ok(Self::from_ids(vid, pid))
    }
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vendor, self.product)
    }
}

/// What a USB identity means for the crispy target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Bootloader update mode, or firmware using the SDK default product id.
    Bootloader,
    /// Firmware with its own product id.
    Firmware,
    /// Another device from the same vendor.
    OtherVendorDevice,
    /// Unrelated device.
    Unknown,
}

impl DeviceKind {
    /// Classify an identity against a target profile.
    pub fn classify(identity: &UsbIdentity, profile: &TargetProfile) -> Self {
        if *identity == profile.bootloader_identity() {
            Self::Bootloader
        } else if *identity == profile.firmware_identity() {
            Self::Firmware
        } else if identity.vendor == format!("{:04x}", profile.usb_vid) {
            Self::OtherVendorDevice
        } else {
            Self::Unknown
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bootloader => "crispy bootloader",
            Self::Firmware => "crispy firmware",
            Self::OtherVendorDevice => "Raspberry Pi device",
            Self::Unknown => "Unknown",
        }
    }
}

/// Source of candidate serial devices and their USB identities.
pub trait UsbSource: Send + Sync {
    /// Device paths that might be the target, in a stable order.
    fn candidates(&self) -> Vec<String>;

    /// Read the identity of one candidate. Fails while the device is still
    /// enumerating.
    fn identity_of(&self, port: &str) -> io::Result<UsbIdentity>;
}

/// Linux sysfs source: `/dev/ttyACM*` matched through `/sys/class/tty`.
#[derive(Debug, Clone)]
pub struct SysfsUsbSource {
    dev_dir: PathBuf,
    tty_class_dir: PathBuf,
    prefix: String,
}

impl Default for SysfsUsbSource {
    fn default() -> Self {
        Self::new("/dev", "/sys/class/tty", "ttyACM")
    }
}

impl SysfsUsbSource {
    /// Source with explicit roots and tty name prefix.
    pub fn new(
        dev_dir: impl Into<PathBuf>,
        tty_class_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            tty_class_dir: tty_class_dir.into(),
            prefix: prefix.into(),
        }
    }
}

impl UsbSource for SysfsUsbSource {
    fn candidates(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dev_dir) else {
            return Vec::new();
        };
        let mut ports: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&self.prefix)
            })
            .map(|entry| entry.path().to_string_lossy().into_owned())
            .collect();
        ports.sort();
        ports
    }

    fn identity_of(&self, port: &str) -> io::Result<UsbIdentity> {
        let tty = PathBuf::from(port);
        let name = tty
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no tty name"))?;
        // The tty's device is the CDC interface; the USB device owning the ids
        // is its parent.
        let usb_dir = self.tty_class_dir.join(name).join("device").join("..");
        let vendor = fs::read_to_string(usb_dir.join("idVendor"))?;
        let product = fs::read_to_string(usb_dir.join("idProduct"))?;
        Ok(UsbIdentity::from_attributes(&vendor, &product))
    }
}

/// Cross-platform source backed by `serialport::available_ports()`.
#[cfg(feature = "native")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialportUsbSource;

#[cfg(feature = "native")]
impl UsbSource for SerialportUsbSource {
    fn candidates(&self) -> Vec<String> {
        detect_ports().into_iter().map(|p| p.name).collect()
    }

    fn identity_of(&self, port: &str) -> io::Result<UsbIdentity> {
        detect_ports()
            .into_iter()
            .find(|p| p.name == port)
            .and_then(|p| p.identity())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no USB metadata"))
    }
}

/// Polls a [`UsbSource`] for a given identity.
pub struct UsbLocator {
    source: Box<dyn UsbSource>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl UsbLocator {
    /// Locator with the default 0.5s poll interval.
    pub fn new(source: Box<dyn UsbSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One enumeration pass, no waiting.
    pub fn find_port_now(&self, identity: &UsbIdentity) -> Option<String> {
        self.source.candidates().into_iter().find(|port| {
            match self.source.identity_of(port) {
                Ok(found) => {
                    trace!("{port}: {found}");
                    found == *identity
                },
                Err(e) => {
                    debug!("Skipping {port}: {e}");
                    false
                },
            }
        })
    }

    /// Wait up to `timeout` for a port with `identity`.
    pub fn find_port(&self, identity: &UsbIdentity, timeout: Duration) -> Result<String> {
        let what = format!("USB device {identity}");
        let found = poll_until(self.clock.as_ref(), self.interval, timeout, &what, || {
            Ok(self.find_port_now(identity))
        });

        match found {
            Ok(port) => {
                info!("Found {identity} on {port}");
                Ok(port)
            },
            Err(Error::Timeout(_)) => Err(Error::DeviceNotFound(format!(
                "USB device {identity} not found within {:.1}s",
                timeout.as_secs_f64()
            ))),
            Err(e) => Err(e),
        }
    }
}

/// A serial port with whatever USB metadata the OS reports.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path (e.g. "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// USB vendor id (if available).
    pub vid: Option<u16>,
    /// USB product id (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// USB identity, when both ids are known.
    pub fn identity(&self) -> Option<UsbIdentity> {
        Some(UsbIdentity::from_ids(self.vid?, self.pid?))
    }
}

/// List all serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|port_info| {
                let mut detected = DetectedPort {
                    name: port_info.port_name,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };
                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                }
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// List all serial ports (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Format detected ports for display, tagging crispy devices.
pub fn format_port_list(ports: &[DetectedPort], profile: &TargetProfile) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = match port.identity() {
                Some(identity) => {
                    let kind = DeviceKind::classify(&identity, profile);
                    if kind == DeviceKind::Unknown {
                        format!(" [{identity}]")
                    } else {
                        format!(" [{identity} {}]", kind.name())
                    }
                },
                None => String::new(),
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}
