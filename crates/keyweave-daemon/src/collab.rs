//! Optional collaborators: audio control and spoken timers.
//!
//! Steps opt into side-effects through their `name` label. The executor
//! parses the label with [`route_step`] and calls the matching collaborator;
//! the collaborators themselves are pure executors with no-op defaults, and
//! all calls are best effort: a failing collaborator never stops a
//! sequence.

use std::fmt;

use tracing::debug;

use keyweave_config::{OutputKey, SequenceStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for VolumeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeLevel::Low => f.write_str("low"),
            VolumeLevel::Medium => f.write_str("medium"),
            VolumeLevel::High => f.write_str("high"),
        }
    }
}

/// Voice-chat audio control, e.g. a Discord bridge.
pub trait AudioControl: Send + Sync {
    fn set_volume(&self, level: VolumeLevel);
    fn toggle_mic(&self);
    fn toggle_deafen(&self);
}

/// Named text-to-speech countdown timers.
pub trait SpeechTimers: Send + Sync {
    fn timer_start(&self, id: &str, seconds: u64, message: &str);
}

/// Default audio collaborator: logs and does nothing.
#[derive(Debug, Default)]
pub struct NoopAudio;

impl AudioControl for NoopAudio {
    fn set_volume(&self, level: VolumeLevel) {
        debug!(%level, "audio: set volume (noop)");
    }

    fn toggle_mic(&self) {
        debug!("audio: mic toggle (noop)");
    }

    fn toggle_deafen(&self) {
        debug!("audio: deafen toggle (noop)");
    }
}

/// Default timer collaborator: logs and does nothing.
#[derive(Debug, Default)]
pub struct NoopSpeech;

impl SpeechTimers for NoopSpeech {
    fn timer_start(&self, id: &str, seconds: u64, message: &str) {
        debug!(id, seconds, message, "timer start (noop)");
    }
}

/// A parsed timer label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpec {
    /// Lowercased message with spaces replaced by underscores.
    pub id: String,
    pub seconds: u64,
    pub message: String,
}

/// Side-effect a step's name routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Volume(VolumeLevel),
    MicToggle,
    DeafenToggle,
    Timer(TimerSpec),
}

/// A routed step: which collaborator to call, and whether the keystroke
/// itself is replaced by the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub effect: SideEffect,
    /// Volume and timer steps are pure side-effects; mic/deafen steps
    /// still press their key (the hotkey is bound in the external app).
    pub skip_keystroke: bool,
}

/// Inspect a step's name and decide its side-effect, if any.
///
/// Volume and timer labels only route on `END` steps; mic and deafen
/// labels route on any step.
pub fn route_step(step: &SequenceStep) -> Option<Routed> {
    let name = step.name.as_deref()?.trim();
    let is_end = step.key.map(|k| k.raw() == OutputKey::End).unwrap_or(false);

    if is_end {
        if let Some(level) = parse_volume(name) {
            return Some(Routed {
                effect: SideEffect::Volume(level),
                skip_keystroke: true,
            });
        }
        if let Some(timer) = parse_timer(name) {
            return Some(Routed {
                effect: SideEffect::Timer(timer),
                skip_keystroke: true,
            });
        }
    }

    if name.eq_ignore_ascii_case("mic toggle") {
        return Some(Routed {
            effect: SideEffect::MicToggle,
            skip_keystroke: false,
        });
    }
    if name.eq_ignore_ascii_case("deafen") {
        return Some(Routed {
            effect: SideEffect::DeafenToggle,
            skip_keystroke: false,
        });
    }

    None
}

/// Parse a `"Volume: Low|Medium|High"` label.
fn parse_volume(name: &str) -> Option<VolumeLevel> {
    let level = name.strip_prefix("Volume:")?.trim();
    if level.eq_ignore_ascii_case("low") {
        Some(VolumeLevel::Low)
    } else if level.eq_ignore_ascii_case("medium") {
        Some(VolumeLevel::Medium)
    } else if level.eq_ignore_ascii_case("high") {
        Some(VolumeLevel::High)
    } else {
        None
    }
}

/// Parse a `"Timer placeholder - ... 'MSG' after N seconds"` label.
fn parse_timer(name: &str) -> Option<TimerSpec> {
    name.strip_prefix("Timer placeholder")?;

    let open = name.find('\'')?;
    let close = name[open + 1..].find('\'')? + open + 1;
    let message = name[open + 1..close].to_string();
    if message.is_empty() {
        return None;
    }

    let tail = &name[close + 1..];
    let after = tail.find("after ")? + "after ".len();
    let rest = &tail[after..];
    let digits_end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let seconds: u64 = rest[..digits_end].parse().ok()?;
    if !rest[digits_end..].trim_start().starts_with("second") {
        return None;
    }

    let id = message.to_lowercase().replace(' ', "_");
    Some(TimerSpec {
        id,
        seconds,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyweave_config::{BufferTier, QualifiedKey};

    fn end_step(name: &str) -> SequenceStep {
        let mut step = SequenceStep::keystroke(
            QualifiedKey::parse("END").unwrap(),
            BufferTier::Low,
        );
        step.name = Some(name.to_string());
        step
    }

    #[test]
    fn volume_labels_route_on_end_steps() {
        let routed = route_step(&end_step("Volume: Low")).unwrap();
        assert_eq!(routed.effect, SideEffect::Volume(VolumeLevel::Low));
        assert!(routed.skip_keystroke);

        let routed = route_step(&end_step("Volume: High")).unwrap();
        assert_eq!(routed.effect, SideEffect::Volume(VolumeLevel::High));
    }

    #[test]
    fn volume_labels_do_not_route_off_end() {
        let mut step = end_step("Volume: Low");
        step.key = Some(QualifiedKey::parse("R").unwrap());
        assert_eq!(route_step(&step), None);
    }

    #[test]
    fn mic_and_deafen_still_press_the_key() {
        let mut step = end_step("Mic Toggle");
        step.key = Some(QualifiedKey::parse("M").unwrap());
        let routed = route_step(&step).unwrap();
        assert_eq!(routed.effect, SideEffect::MicToggle);
        assert!(!routed.skip_keystroke);

        step.name = Some("Deafen".to_string());
        let routed = route_step(&step).unwrap();
        assert_eq!(routed.effect, SideEffect::DeafenToggle);
        assert!(!routed.skip_keystroke);
    }

    #[test]
    fn timer_labels_parse_message_and_seconds() {
        let routed =
            route_step(&end_step("Timer placeholder - say 'Shield Up' after 42 seconds")).unwrap();
        assert!(routed.skip_keystroke);
        match routed.effect {
            SideEffect::Timer(t) => {
                assert_eq!(t.id, "shield_up");
                assert_eq!(t.message, "Shield Up");
                assert_eq!(t.seconds, 42);
            }
            other => panic!("expected timer, got {other:?}"),
        }
    }

    #[test]
    fn malformed_timer_labels_do_not_route() {
        assert_eq!(route_step(&end_step("Timer placeholder - no quotes after 5 seconds")), None);
        assert_eq!(
            route_step(&end_step("Timer placeholder - 'msg' after some seconds")),
            None
        );
        assert_eq!(route_step(&end_step("Timer placeholder - 'msg' after 5 parsecs")), None);
    }

    #[test]
    fn unrelated_names_route_nowhere() {
        assert_eq!(route_step(&end_step("Open Inventory")), None);
        let mut unnamed = end_step("x");
        unnamed.name = None;
        assert_eq!(route_step(&unnamed), None);
    }
}
