//! Global input hook: raw events in, canonical input keys out.
//!
//! Platforms deliver [`RawInputEvent`]s: an uppercase-ish key name, an edge,
//! optional scan/virtual codes and a monotonic timestamp. [`feed_raw`]
//! canonicalizes the name ("NUMPAD 8" -> "NUMPAD8", "MOUSE MIDDLE" ->
//! "MIDDLE_CLICK") and routes known input keys into the orchestrator;
//! unknown names are silently ignored.
//!
//! [`EvdevHook`] is the Linux implementation: it reads events from a
//! grabbed evdev device on a blocking task and feeds them through the same
//! path.

use evdev::{Device, InputEventKind, Key};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use keyweave_config::{canonicalize_key_name, InputKey};

use crate::events::monotonic_ms;
use crate::orchestrator::Orchestrator;

/// One raw event from a platform hook.
#[derive(Debug, Clone)]
pub struct RawInputEvent {
    pub name: String,
    pub down: bool,
    pub timestamp_ms: u64,
    pub scan_code: Option<u16>,
    pub virtual_key: Option<u16>,
}

/// Canonicalize and route one raw event. Returns whether it was routed.
pub fn feed_raw(orchestrator: &Orchestrator, event: &RawInputEvent) -> bool {
    let canonical = canonicalize_key_name(&event.name);
    match InputKey::from_name(&canonical) {
        Some(key) => {
            orchestrator.handle_raw(key, event.down, event.timestamp_ms);
            true
        }
        None => {
            trace!(name = %event.name, "unknown input key; ignored");
            false
        }
    }
}

/// Every evdev key the hook listens to, one per input key. Device
/// discovery probes capture candidates against this set.
pub(crate) const LISTENED_KEYS: [Key; 23] = [
    Key::KEY_1,
    Key::KEY_2,
    Key::KEY_3,
    Key::KEY_4,
    Key::KEY_5,
    Key::KEY_Q,
    Key::KEY_W,
    Key::KEY_E,
    Key::KEY_R,
    Key::KEY_T,
    Key::KEY_Z,
    Key::KEY_X,
    Key::KEY_C,
    Key::KEY_V,
    Key::KEY_KP4,
    Key::KEY_KP5,
    Key::KEY_KP6,
    Key::KEY_KP8,
    Key::KEY_F13,
    Key::KEY_F14,
    Key::BTN_MIDDLE,
    Key::BTN_SIDE,
    Key::BTN_EXTRA,
];

/// Raw key name for an evdev key, for the keys the engine listens to.
fn evdev_key_name(key: Key) -> Option<&'static str> {
    let name = match key {
        Key::KEY_1 => "1",
        Key::KEY_2 => "2",
        Key::KEY_3 => "3",
        Key::KEY_4 => "4",
        Key::KEY_5 => "5",
        Key::KEY_Q => "Q",
        Key::KEY_W => "W",
        Key::KEY_E => "E",
        Key::KEY_R => "R",
        Key::KEY_T => "T",
        Key::KEY_Z => "Z",
        Key::KEY_X => "X",
        Key::KEY_C => "C",
        Key::KEY_V => "V",
        Key::KEY_KP4 => "NUMPAD 4",
        Key::KEY_KP5 => "NUMPAD 5",
        Key::KEY_KP6 => "NUMPAD 6",
        Key::KEY_KP8 => "NUMPAD 8",
        Key::KEY_F13 => "F13",
        Key::KEY_F14 => "F14",
        Key::BTN_MIDDLE => "MOUSE MIDDLE",
        Key::BTN_SIDE => "MOUSE 4",
        Key::BTN_EXTRA => "MOUSE 5",
        _ => return None,
    };
    Some(name)
}

/// Evdev-backed input hook over a grabbed device.
pub struct EvdevHook {
    device: Device,
    device_name: String,
}

impl EvdevHook {
    pub fn new(device: Device) -> Self {
        let device_name = device.name().unwrap_or("unknown").to_string();
        EvdevHook {
            device,
            device_name,
        }
    }

    /// Run the read loop on a blocking task, feeding the orchestrator until
    /// the device goes away.
    pub fn spawn(self, orchestrator: Orchestrator) -> JoinHandle<()> {
        let EvdevHook {
            mut device,
            device_name,
        } = self;
        tokio::task::spawn_blocking(move || {
            info!(device = %device_name, "input hook running");
            loop {
                let events = match device.fetch_events() {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(device = %device_name, error = %e, "device read failed; hook stopping");
                        return;
                    }
                };
                for event in events {
                    let InputEventKind::Key(key) = event.kind() else {
                        continue;
                    };
                    // 1 = press, 0 = release; autorepeat (2) is dropped here,
                    // the state machines ignore it anyway.
                    let down = match event.value() {
                        1 => true,
                        0 => false,
                        _ => continue,
                    };
                    let Some(name) = evdev_key_name(key) else {
                        continue;
                    };
                    let raw = RawInputEvent {
                        name: name.to_string(),
                        down,
                        timestamp_ms: monotonic_ms(),
                        scan_code: Some(key.code()),
                        virtual_key: None,
                    };
                    feed_raw(&orchestrator, &raw);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use keyweave_config::{GestureTiming, GestureType};

    fn raw(name: &str, down: bool, t: u64) -> RawInputEvent {
        RawInputEvent {
            name: name.to_string(),
            down,
            timestamp_ms: t,
            scan_code: None,
            virtual_key: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_numpad_names_reach_their_machine() {
        let now = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let clock_now = Arc::clone(&now);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orch = Orchestrator::spawn_with_clock(
            GestureTiming {
                multi_press_window: 90,
                ..GestureTiming::default()
            },
            move |e: &crate::events::GestureEvent| {
                let _ = tx.send(*e);
            },
            Arc::new(move || clock_now.load(Ordering::SeqCst)),
        );

        assert!(feed_raw(&orch, &raw("NUMPAD 8", true, 0)));
        assert!(feed_raw(&orch, &raw("NUMPAD 8", false, 30)));
        now.store(300, Ordering::SeqCst);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, InputKey::Numpad8);
        assert_eq!(event.gesture, GestureType::Single);

        orch.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_names_are_silently_ignored() {
        let orch = Orchestrator::spawn_with_clock(
            GestureTiming::default(),
            |_e: &crate::events::GestureEvent| {},
            Arc::new(|| 0),
        );
        assert!(!feed_raw(&orch, &raw("VOLUME KNOB", true, 0)));
        assert!(!feed_raw(&orch, &raw("", false, 0)));
        orch.destroy();
    }

    #[test]
    fn evdev_names_cover_the_pointer_buttons() {
        assert_eq!(evdev_key_name(Key::BTN_MIDDLE), Some("MOUSE MIDDLE"));
        assert_eq!(evdev_key_name(Key::BTN_SIDE), Some("MOUSE 4"));
        assert_eq!(evdev_key_name(Key::KEY_KP8), Some("NUMPAD 8"));
        assert_eq!(evdev_key_name(Key::KEY_ENTER), None);
    }

    #[test]
    fn every_listened_key_resolves_to_an_input_key() {
        for key in LISTENED_KEYS {
            let name = evdev_key_name(key).unwrap();
            let canonical = canonicalize_key_name(name);
            assert!(
                InputKey::from_name(&canonical).is_some(),
                "{key:?} ({name}) does not reach an input key"
            );
        }
    }
}
