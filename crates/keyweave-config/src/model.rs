//! Profile data model.
//!
//! A [`MacroProfile`] is the startup input: a gesture timing configuration
//! plus an ordered list of [`MacroBinding`]s, each mapping an
//! `(input key, gesture)` trigger to a sequence of [`SequenceStep`]s. The
//! wire form is JSON with camelCase fields; qualified keys appear as
//! `"MOD+MOD+BASE"` strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::keys::{InputKey, QualifiedKey};

/// Default hold range for a step's primary key, milliseconds.
pub const DEFAULT_KEY_DOWN: MsRange = MsRange { min: 15, max: 27 };

/// Default delay before an owed hold-through release, milliseconds.
pub const DEFAULT_RELEASE_DELAY: MsRange = MsRange { min: 7, max: 18 };

/// Default fixed dual-key offset when one is given without a value.
pub const DEFAULT_DUAL_KEY_OFFSET: u64 = 6;

/// How long a hold was, classified against the timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressType {
    Normal,
    Long,
    SuperLong,
}

/// One of the twelve gesture classifications: press count (1–4) crossed
/// with hold type. Base names omit the `normal` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureType {
    Single,
    SingleLong,
    SingleSuperLong,
    Double,
    DoubleLong,
    DoubleSuperLong,
    Triple,
    TripleLong,
    TripleSuperLong,
    Quadruple,
    QuadrupleLong,
    QuadrupleSuperLong,
}

impl GestureType {
    /// Combine a press count (1–4) and hold type into a gesture.
    /// Returns `None` for counts outside 1–4.
    pub fn from_parts(count: usize, press: PressType) -> Option<Self> {
        use GestureType::*;
        Some(match (count, press) {
            (1, PressType::Normal) => Single,
            (1, PressType::Long) => SingleLong,
            (1, PressType::SuperLong) => SingleSuperLong,
            (2, PressType::Normal) => Double,
            (2, PressType::Long) => DoubleLong,
            (2, PressType::SuperLong) => DoubleSuperLong,
            (3, PressType::Normal) => Triple,
            (3, PressType::Long) => TripleLong,
            (3, PressType::SuperLong) => TripleSuperLong,
            (4, PressType::Normal) => Quadruple,
            (4, PressType::Long) => QuadrupleLong,
            (4, PressType::SuperLong) => QuadrupleSuperLong,
            _ => return None,
        })
    }

    /// Press count this gesture classifies (1–4).
    pub fn press_count(self) -> usize {
        use GestureType::*;
        match self {
            Single | SingleLong | SingleSuperLong => 1,
            Double | DoubleLong | DoubleSuperLong => 2,
            Triple | TripleLong | TripleSuperLong => 3,
            Quadruple | QuadrupleLong | QuadrupleSuperLong => 4,
        }
    }

    /// Canonical snake_case name, matching the wire form.
    pub fn name(self) -> &'static str {
        use GestureType::*;
        match self {
            Single => "single",
            SingleLong => "single_long",
            SingleSuperLong => "single_super_long",
            Double => "double",
            DoubleLong => "double_long",
            DoubleSuperLong => "double_super_long",
            Triple => "triple",
            TripleLong => "triple_long",
            TripleSuperLong => "triple_super_long",
            Quadruple => "quadruple",
            QuadrupleLong => "quadruple_long",
            QuadrupleSuperLong => "quadruple_super_long",
        }
    }
}

impl fmt::Display for GestureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The seven millisecond thresholds governing gesture classification.
///
/// Invariant: `long_press_max < super_long_min <= super_long_max <
/// cancel_threshold`. Checked at profile load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GestureTiming {
    /// Initial window after the first press-down during which further
    /// presses join the gesture.
    pub multi_press_window: u64,
    pub long_press_min: u64,
    pub long_press_max: u64,
    pub super_long_min: u64,
    pub super_long_max: u64,
    /// Holds at or beyond this are discarded silently.
    pub cancel_threshold: u64,
    /// Hook-level debounce; informational for the engine.
    pub debounce_delay: u64,
}

impl Default for GestureTiming {
    fn default() -> Self {
        GestureTiming {
            multi_press_window: 350,
            long_press_min: 80,
            long_press_max: 145,
            super_long_min: 180,
            super_long_max: 400,
            cancel_threshold: 450,
            debounce_delay: 25,
        }
    }
}

impl GestureTiming {
    /// Check the threshold ordering invariant.
    pub fn check(&self) -> Result<(), String> {
        if self.multi_press_window == 0 {
            return Err("multiPressWindow must be positive".to_string());
        }
        if self.long_press_min == 0 || self.long_press_min > self.long_press_max {
            return Err(format!(
                "long press range [{}, {}] is not a positive ascending range",
                self.long_press_min, self.long_press_max
            ));
        }
        if !(self.long_press_max < self.super_long_min
            && self.super_long_min <= self.super_long_max
            && self.super_long_max < self.cancel_threshold)
        {
            return Err(format!(
                "thresholds must satisfy longPressMax < superLongMin <= superLongMax < cancelThreshold \
                 (got {} / {} / {} / {})",
                self.long_press_max, self.super_long_min, self.super_long_max, self.cancel_threshold
            ));
        }
        Ok(())
    }

    /// Classify a hold duration. Callers are expected to have already
    /// discarded holds at or beyond `cancel_threshold`.
    pub fn classify_hold(&self, hold_ms: u64) -> PressType {
        if (self.long_press_min..=self.long_press_max).contains(&hold_ms) {
            PressType::Long
        } else if (self.super_long_min..=self.super_long_max).contains(&hold_ms) {
            PressType::SuperLong
        } else {
            PressType::Normal
        }
    }
}

/// Coarse inter-step delay class; the executor maps tiers to ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferTier {
    Low,
    Medium,
    High,
}

/// An inclusive millisecond range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsRange {
    pub min: u64,
    pub max: u64,
}

impl MsRange {
    pub const fn new(min: u64, max: u64) -> Self {
        MsRange { min, max }
    }

    pub fn is_ascending(self) -> bool {
        self.min <= self.max
    }
}

impl fmt::Display for MsRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Scroll direction for scroll steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

fn default_echo_hits() -> u32 {
    1
}

fn is_one(n: &u32) -> bool {
    *n == 1
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A unit of output within a binding's sequence.
///
/// Carries either a [`BufferTier`] or an explicit `minDelay`/`maxDelay`
/// pair; an explicit pair must satisfy `minDelay >= 25` and
/// `maxDelay - minDelay >= 4`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SequenceStep {
    /// The qualified key to press. Required unless this is a scroll step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<QualifiedKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_tier: Option<BufferTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,

    /// How long to hold the key down; defaults to [`DEFAULT_KEY_DOWN`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_down_duration: Option<MsRange>,

    /// In-place repetitions of this step, 1–6.
    #[serde(default = "default_echo_hits", skip_serializing_if = "is_one")]
    pub echo_hits: u32,

    /// Second key pressed concurrently with the primary, after
    /// `dualKeyOffset` milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dual_key: Option<QualifiedKey>,
    /// Fixed offset before the dual press; when absent, a draw from the
    /// dual-offset range is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dual_key_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dual_key_down_duration: Option<MsRange>,

    /// Keep the key down into the following step; it is released during
    /// that step's buffer after a `releaseDelay` draw.
    #[serde(default, skip_serializing_if = "is_false")]
    pub hold_through_next: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_delay: Option<MsRange>,

    /// Opaque label the executor uses to route side-effects (volume, mic,
    /// TTS timers) to external collaborators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_direction: Option<ScrollDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_magnitude: Option<u32>,
}

impl SequenceStep {
    /// A keystroke step with a tier buffer. Most steps look like this.
    pub fn keystroke(key: QualifiedKey, tier: BufferTier) -> Self {
        SequenceStep {
            key: Some(key),
            buffer_tier: Some(tier),
            min_delay: None,
            max_delay: None,
            key_down_duration: None,
            echo_hits: 1,
            dual_key: None,
            dual_key_offset: None,
            dual_key_down_duration: None,
            hold_through_next: false,
            release_delay: None,
            name: None,
            scroll_direction: None,
            scroll_magnitude: None,
        }
    }

    /// Whether this step produces a scroll event instead of a keystroke.
    pub fn is_scroll(&self) -> bool {
        self.scroll_direction.is_some()
    }
}

/// What invokes a binding: an input key plus the gesture classified on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Trigger {
    pub key: InputKey,
    pub gesture: GestureType,
}

fn default_enabled() -> bool {
    true
}

/// A named macro: trigger plus output sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MacroBinding {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    pub sequence: Vec<SequenceStep>,
}

/// The startup profile: timing configuration plus ordered bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MacroProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub gesture_timing: GestureTiming,
    pub bindings: Vec<MacroBinding>,
}

impl MacroProfile {
    /// Find the first enabled binding matching a trigger, in profile order.
    pub fn find_binding(&self, key: InputKey, gesture: GestureType) -> Option<&MacroBinding> {
        self.bindings
            .iter()
            .find(|b| b.enabled && b.trigger.key == key && b.trigger.gesture == gesture)
    }
}
