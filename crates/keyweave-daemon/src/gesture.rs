//! Per-input-key gesture state machine.
//!
//! One [`GestureMachine`] instance exists per input key; no state is shared
//! across keys. The machine classifies a sequence of presses into exactly
//! one gesture: press count (1-4) crossed with the hold type of the *last*
//! press.
//!
//! # Windows
//!
//! The first press-down opens a `multi_press_window` during which further
//! presses join the gesture; every joining press extends the window by
//! `round(0.8 x multi_press_window)`. The fourth press-down closes the
//! window immediately and the gesture resolves on its release.
//!
//! # Invariants
//!
//! 1. State is fully reset before a resolved gesture is handed to the
//!    caller; a listener can never observe a half-cleared machine.
//! 2. After a triple the machine jails new presses for 120 ms, after a
//!    quadruple for 200 ms, absorbing operator overshoot.
//! 3. A hold at or beyond `cancel_threshold` discards the whole pending
//!    sequence silently; later presses start fresh.
//! 4. OS key-repeat bursts (key-down while already down) are ignored.
//!
//! The machine is time-agnostic: callers pass monotonic millisecond
//! timestamps, which keeps tests deterministic. Single/double/triple
//! gestures resolve through the owner's periodic [`GestureMachine::finalize`]
//! pass; only a fourth press resolves synchronously from
//! [`GestureMachine::handle_key_up`].

use keyweave_config::{GestureTiming, GestureType, PressType};

/// Presses after which the machine stops accepting input until resolution.
const PRESS_LIMIT: usize = 4;

/// Jail duration after a triple resolves, ms.
const JAIL_AFTER_TRIPLE: u64 = 120;

/// Jail duration after a quadruple resolves, ms.
const JAIL_AFTER_QUADRUPLE: u64 = 200;

/// One classified press, recorded at key release.
#[derive(Debug, Clone, Copy)]
struct PressRecord {
    press_type: PressType,
    hold_ms: u64,
}

/// A gesture the machine has resolved. Machine state is already reset when
/// one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedGesture {
    pub gesture: GestureType,
    /// Hold duration of the final press.
    pub hold_ms: u64,
}

#[derive(Debug)]
pub struct GestureMachine {
    timing: GestureTiming,
    initial_window: u64,
    extension_window: u64,

    press_history: Vec<PressRecord>,
    /// Timestamp of the current unreleased press.
    key_down_time: Option<u64>,
    /// Deadline after which no further press joins the current gesture.
    window_deadline: Option<u64>,
    /// True between the fourth key-down and its release.
    waiting_for_release: bool,
    /// Whether the current unreleased press opened inside the window.
    key_down_was_within_window: bool,
    /// True once four presses are classified; suppresses input until reset.
    press_limit_reached: bool,
    /// Presses before this timestamp are silently discarded.
    await_jail_until: u64,
}

impl GestureMachine {
    pub fn new(timing: GestureTiming) -> Self {
        let mut machine = GestureMachine {
            timing,
            initial_window: 0,
            extension_window: 0,
            press_history: Vec::with_capacity(PRESS_LIMIT),
            key_down_time: None,
            window_deadline: None,
            waiting_for_release: false,
            key_down_was_within_window: false,
            press_limit_reached: false,
            await_jail_until: 0,
        };
        machine.apply_timing(timing);
        machine
    }

    /// Swap in a new timing configuration and reset. Used on profile
    /// change; the machine itself is reused, not reallocated.
    pub fn apply_timing(&mut self, timing: GestureTiming) {
        self.timing = timing;
        self.initial_window = timing.multi_press_window;
        self.extension_window = (timing.multi_press_window as f64 * 0.8).round() as u64;
        self.reset();
    }

    /// Clear all press state, including the jail.
    pub fn reset(&mut self) {
        self.press_history.clear();
        self.key_down_time = None;
        self.window_deadline = None;
        self.waiting_for_release = false;
        self.key_down_was_within_window = false;
        self.press_limit_reached = false;
        self.await_jail_until = 0;
    }

    /// Whether any press is pending classification.
    pub fn has_pending(&self) -> bool {
        !self.press_history.is_empty() || self.key_down_time.is_some()
    }

    /// Record a key-down at monotonic time `now` (ms).
    pub fn handle_key_down(&mut self, now: u64) {
        if now < self.await_jail_until {
            return;
        }
        // Key-repeat autoburst: already down.
        if self.key_down_time.is_some() {
            return;
        }
        if self.press_limit_reached {
            return;
        }

        match self.window_deadline {
            Some(deadline) if now <= deadline => {
                self.key_down_was_within_window = true;
                self.window_deadline = Some(now + self.extension_window);
            }
            _ => {
                // Fresh sequence.
                if !self.waiting_for_release {
                    self.press_history.clear();
                    self.press_limit_reached = false;
                }
                self.key_down_was_within_window = false;
                self.window_deadline = Some(now + self.initial_window);
            }
        }

        self.key_down_time = Some(now);

        // Opening the fourth press: no further press may join, and the
        // gesture resolves on this press's release.
        if self.press_history.len() == PRESS_LIMIT - 1 {
            self.window_deadline = None;
            self.waiting_for_release = true;
        }
    }

    /// Record a key-up at monotonic time `now` (ms). Returns a gesture only
    /// when this release was the fourth press.
    pub fn handle_key_up(&mut self, now: u64) -> Option<ResolvedGesture> {
        let down_at = self.key_down_time.take()?;
        let hold = now.saturating_sub(down_at);

        if self.press_limit_reached {
            return None;
        }

        // Hold past the cancel threshold: discard the pending sequence.
        if hold >= self.timing.cancel_threshold {
            self.press_history.clear();
            self.window_deadline = None;
            self.waiting_for_release = false;
            return None;
        }

        let press_type = self.timing.classify_hold(hold);

        let counts = self.press_history.is_empty()
            || self.key_down_was_within_window
            || self.waiting_for_release;
        if !counts {
            // The press opened after the window closed: it starts a fresh
            // sequence instead of joining the stale one.
            self.press_history.clear();
        }

        self.press_history.push(PressRecord {
            press_type,
            hold_ms: hold,
        });

        if self.press_history.len() >= PRESS_LIMIT {
            self.press_limit_reached = true;
            self.window_deadline = None;
            self.waiting_for_release = false;
            return Some(self.resolve(now));
        }

        None
    }

    /// Periodic finalization: resolve a pending 1-3 press gesture once the
    /// window has lapsed with no key held.
    pub fn finalize(&mut self, now: u64) -> Option<ResolvedGesture> {
        if self.press_history.is_empty()
            || self.key_down_time.is_some()
            || self.waiting_for_release
        {
            return None;
        }
        match self.window_deadline {
            Some(deadline) if now > deadline => Some(self.resolve(now)),
            _ => None,
        }
    }

    /// Classify the recorded presses and reset. State is clean before the
    /// gesture is returned, so callers may emit it without re-entrancy
    /// hazards.
    fn resolve(&mut self, now: u64) -> ResolvedGesture {
        let count = self.press_history.len().min(PRESS_LIMIT);
        let last = self.press_history[count - 1];
        let gesture = GestureType::from_parts(count, last.press_type)
            .unwrap_or(GestureType::Single);

        self.await_jail_until = match count {
            3 => now + JAIL_AFTER_TRIPLE,
            4 => now + JAIL_AFTER_QUADRUPLE,
            _ => self.await_jail_until,
        };

        self.press_history.clear();
        self.press_limit_reached = false;
        self.window_deadline = None;
        self.key_down_was_within_window = false;

        ResolvedGesture {
            gesture,
            hold_ms: last.hold_ms,
        }
    }
}
