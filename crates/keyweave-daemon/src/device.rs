//! Capture-device discovery.
//!
//! The engine grabs exactly one device and listens for a fixed set of
//! gesture keys on it. Discovery probes every `/dev/input/event*` node,
//! classifies it (keyboard, pointer, other) and counts how many of the
//! hook's listened keys it can emit. Selection and grabbing only consider
//! devices that expose at least one gesture key: grabbing a device the
//! engine can never hear from would silence it for the rest of the system
//! for nothing.

use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
#[cfg(test)]
use evdev::AttributeSet;
use evdev::{AttributeSetRef, Device, Key};

use crate::hook::LISTENED_KEYS;

/// Broad class of an input device, from the key ranges it advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Keyboard,
    Pointer,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Keyboard => f.pad("keyboard"),
            DeviceKind::Pointer => f.pad("pointer"),
            DeviceKind::Other => f.pad("other"),
        }
    }
}

/// A probed input device: identity plus what the engine could hear from
/// it.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    pub path: PathBuf,
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub kind: DeviceKind,
    /// How many of the engine's gesture keys the device advertises.
    pub gesture_keys: usize,
}

impl CaptureDevice {
    fn probe(path: PathBuf, device: &Device) -> Self {
        let id = device.input_id();
        let keys = device.supported_keys();
        CaptureDevice {
            name: device.name().unwrap_or("unknown").to_string(),
            vendor: id.vendor(),
            product: id.product(),
            kind: classify(keys),
            gesture_keys: keys.map(count_listened).unwrap_or(0),
            path,
        }
    }

    /// Whether grabbing this device can ever produce a gesture.
    pub fn can_capture(&self) -> bool {
        self.gesture_keys > 0
    }
}

impl fmt::Display for CaptureDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:04x}:{:04x}  {:8}  {:2} gesture key(s)  {}",
            self.path.display(),
            self.vendor,
            self.product,
            self.kind,
            self.gesture_keys,
            self.name
        )
    }
}

fn classify(keys: Option<&AttributeSetRef<Key>>) -> DeviceKind {
    match keys {
        Some(keys) if keys.contains(Key::KEY_A) => DeviceKind::Keyboard,
        Some(keys) if keys.contains(Key::BTN_MIDDLE) => DeviceKind::Pointer,
        _ => DeviceKind::Other,
    }
}

fn count_listened(keys: &AttributeSetRef<Key>) -> usize {
    LISTENED_KEYS.iter().filter(|k| keys.contains(**k)).count()
}

/// Probe every event device. Unreadable nodes are skipped with a debug
/// log; insufficient permissions on `/dev/input` commonly hide devices.
pub fn discover() -> Result<Vec<CaptureDevice>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev/input").context("reading /dev/input")? {
        let path = entry?.path();
        let is_event_node = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false);
        if !is_event_node {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => devices.push(CaptureDevice::probe(path, &device)),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping unreadable device");
            }
        }
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Pick the capture device by name among devices that expose gesture
/// keys: exact match first, then substring.
pub fn find_device(name: &str) -> Result<CaptureDevice> {
    let candidates: Vec<CaptureDevice> = discover()?
        .into_iter()
        .filter(CaptureDevice::can_capture)
        .collect();

    if let Some(device) = candidates.iter().find(|d| d.name == name) {
        return Ok(device.clone());
    }
    if let Some(device) = candidates.iter().find(|d| d.name.contains(name)) {
        return Ok(device.clone());
    }
    bail!("no input device exposing gesture keys matches '{name}'")
}

/// Open a discovered device and grab it for exclusive access. The gesture
/// keys are re-checked at open time; the device may have changed since
/// discovery.
pub fn open_grabbed(capture: &CaptureDevice) -> Result<Device> {
    let mut device = Device::open(&capture.path)
        .with_context(|| format!("opening {}", capture.path.display()))?;

    let listened = device.supported_keys().map(count_listened).unwrap_or(0);
    if listened == 0 {
        bail!(
            "'{}' no longer exposes any gesture key; refusing to grab it",
            capture.name
        );
    }

    device
        .grab()
        .with_context(|| format!("grabbing {}", capture.name))?;
    Ok(device)
}
