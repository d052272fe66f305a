//! Synthetic keystroke emission.
//!
//! The engine talks to the OS through the [`KeySink`] trait: a toggle
//! primitive (`key down` / `key up` with modifiers applied as one call), a
//! tap fallback for sinks that reject a toggle, and a scroll primitive.
//! [`UinputSink`] is the Linux implementation over a uinput virtual
//! keyboard; [`NullSink`] swallows everything for dry runs;
//! [`RecordingSink`] captures calls with timestamps for tests.

use std::sync::Mutex;

use evdev::uinput::VirtualDeviceBuilder;
use evdev::{AttributeSet, InputEvent, Key, RelativeAxisType};
use thiserror::Error;
use tracing::trace;

use keyweave_config::{Modifier, OutputKey, QualifiedKey, ScrollDirection};

/// Which edge of a keypress to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Down,
    Up,
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink refused this combination; the caller may retry as a tap.
    #[error("sink rejected {key}: {reason}")]
    Rejected { key: QualifiedKey, reason: String },

    #[error("virtual device error")]
    Io(#[from] std::io::Error),
}

/// OS keystroke sink. Implementations must be safe to call from multiple
/// concurrently running sequences.
pub trait KeySink: Send + Sync {
    /// Inject one edge of a qualified key: modifiers and base together.
    fn key_toggle(&self, key: QualifiedKey, direction: KeyDirection) -> Result<(), SinkError>;

    /// Best-effort atomic press-and-release, used as the fallback when a
    /// toggle is rejected.
    fn key_tap(&self, key: QualifiedKey) -> Result<(), SinkError>;

    /// Inject a scroll event.
    fn scroll(&self, direction: ScrollDirection, magnitude: u32) -> Result<(), SinkError>;
}

/// Map an output key onto its evdev key code.
fn evdev_key(key: OutputKey) -> Key {
    match key {
        OutputKey::A => Key::KEY_A,
        OutputKey::B => Key::KEY_B,
        OutputKey::C => Key::KEY_C,
        OutputKey::D => Key::KEY_D,
        OutputKey::E => Key::KEY_E,
        OutputKey::F => Key::KEY_F,
        OutputKey::G => Key::KEY_G,
        OutputKey::H => Key::KEY_H,
        OutputKey::I => Key::KEY_I,
        OutputKey::J => Key::KEY_J,
        OutputKey::K => Key::KEY_K,
        OutputKey::L => Key::KEY_L,
        OutputKey::M => Key::KEY_M,
        OutputKey::N => Key::KEY_N,
        OutputKey::O => Key::KEY_O,
        OutputKey::P => Key::KEY_P,
        OutputKey::Q => Key::KEY_Q,
        OutputKey::R => Key::KEY_R,
        OutputKey::S => Key::KEY_S,
        OutputKey::T => Key::KEY_T,
        OutputKey::U => Key::KEY_U,
        OutputKey::V => Key::KEY_V,
        OutputKey::W => Key::KEY_W,
        OutputKey::X => Key::KEY_X,
        OutputKey::Y => Key::KEY_Y,
        OutputKey::Z => Key::KEY_Z,
        OutputKey::Space => Key::KEY_SPACE,
        OutputKey::Enter => Key::KEY_ENTER,
        OutputKey::Escape => Key::KEY_ESC,
        OutputKey::Tab => Key::KEY_TAB,
        OutputKey::End => Key::KEY_END,
        OutputKey::Home => Key::KEY_HOME,
        OutputKey::Up => Key::KEY_UP,
        OutputKey::Down => Key::KEY_DOWN,
        OutputKey::F5 => Key::KEY_F5,
        OutputKey::F6 => Key::KEY_F6,
        OutputKey::PageUp => Key::KEY_PAGEUP,
    }
}

/// Modifiers inject as their left-hand variants.
fn evdev_modifier(modifier: Modifier) -> Key {
    match modifier {
        Modifier::Shift => Key::KEY_LEFTSHIFT,
        Modifier::Alt => Key::KEY_LEFTALT,
        Modifier::Control => Key::KEY_LEFTCTRL,
    }
}

/// A virtual keyboard device backed by uinput.
pub struct UinputSink {
    device: Mutex<evdev::uinput::VirtualDevice>,
}

impl UinputSink {
    /// Create the virtual device. Requires write access to /dev/uinput.
    pub fn new(name: &str) -> Result<Self, SinkError> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 0..256u16 {
            keys.insert(Key::new(code));
        }
        let mut axes = AttributeSet::<RelativeAxisType>::new();
        axes.insert(RelativeAxisType::REL_WHEEL);

        let device = VirtualDeviceBuilder::new()?
            .name(name)
            .with_keys(&keys)?
            .with_relative_axes(&axes)?
            .build()?;

        Ok(UinputSink {
            device: Mutex::new(device),
        })
    }

    fn emit(&self, events: &[InputEvent]) -> Result<(), SinkError> {
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        device.emit(events)?;
        Ok(())
    }

    fn key_event(key: Key, down: bool) -> InputEvent {
        InputEvent::new(evdev::EventType::KEY, key.code(), i32::from(down))
    }

    fn syn() -> InputEvent {
        InputEvent::new(evdev::EventType::SYNCHRONIZATION, 0, 0)
    }
}

impl KeySink for UinputSink {
    fn key_toggle(&self, key: QualifiedKey, direction: KeyDirection) -> Result<(), SinkError> {
        let mut events = Vec::with_capacity(key.modifiers.len() + 2);
        match direction {
            KeyDirection::Down => {
                for m in key.modifiers.iter() {
                    events.push(Self::key_event(evdev_modifier(m), true));
                }
                events.push(Self::key_event(evdev_key(key.base), true));
            }
            KeyDirection::Up => {
                events.push(Self::key_event(evdev_key(key.base), false));
                // Modifiers release in reverse press order.
                let mods: Vec<_> = key.modifiers.iter().collect();
                for m in mods.into_iter().rev() {
                    events.push(Self::key_event(evdev_modifier(m), false));
                }
            }
        }
        events.push(Self::syn());
        self.emit(&events)
    }

    fn key_tap(&self, key: QualifiedKey) -> Result<(), SinkError> {
        self.key_toggle(key, KeyDirection::Down)?;
        self.key_toggle(key, KeyDirection::Up)
    }

    fn scroll(&self, direction: ScrollDirection, magnitude: u32) -> Result<(), SinkError> {
        let value = match direction {
            ScrollDirection::Up => magnitude as i32,
            ScrollDirection::Down => -(magnitude as i32),
        };
        self.emit(&[
            InputEvent::new(
                evdev::EventType::RELATIVE,
                RelativeAxisType::REL_WHEEL.0,
                value,
            ),
            Self::syn(),
        ])
    }
}

/// Sink that swallows everything. Used for dry runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl KeySink for NullSink {
    fn key_toggle(&self, key: QualifiedKey, direction: KeyDirection) -> Result<(), SinkError> {
        trace!(%key, ?direction, "null sink toggle");
        Ok(())
    }

    fn key_tap(&self, key: QualifiedKey) -> Result<(), SinkError> {
        trace!(%key, "null sink tap");
        Ok(())
    }

    fn scroll(&self, direction: ScrollDirection, magnitude: u32) -> Result<(), SinkError> {
        trace!(?direction, magnitude, "null sink scroll");
        Ok(())
    }
}

/// One recorded sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkAction {
    Toggle(QualifiedKey, KeyDirection),
    Tap(QualifiedKey),
    Scroll(ScrollDirection, u32),
}

/// A recorded call with the tokio instant it happened at.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub at: tokio::time::Instant,
    pub action: SinkAction,
}

/// Sink that records every call. Tests assert on ordering and timing;
/// toggles can be made to fail to exercise the tap fallback.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<SinkRecord>>,
    reject_toggles: Mutex<Vec<QualifiedKey>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink::default()
    }

    /// Make every toggle of `key` fail with [`SinkError::Rejected`].
    pub fn reject_toggle(&self, key: QualifiedKey) {
        self.reject_toggles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key);
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn actions(&self) -> Vec<SinkAction> {
        self.records().into_iter().map(|r| r.action).collect()
    }

    fn record(&self, action: SinkAction) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SinkRecord {
                at: tokio::time::Instant::now(),
                action,
            });
    }
}

impl KeySink for RecordingSink {
    fn key_toggle(&self, key: QualifiedKey, direction: KeyDirection) -> Result<(), SinkError> {
        let rejected = self
            .reject_toggles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key);
        if rejected {
            return Err(SinkError::Rejected {
                key,
                reason: "configured to reject".to_string(),
            });
        }
        self.record(SinkAction::Toggle(key, direction));
        Ok(())
    }

    fn key_tap(&self, key: QualifiedKey) -> Result<(), SinkError> {
        self.record(SinkAction::Tap(key));
        Ok(())
    }

    fn scroll(&self, direction: ScrollDirection, magnitude: u32) -> Result<(), SinkError> {
        self.record(SinkAction::Scroll(direction, magnitude));
        Ok(())
    }
}
