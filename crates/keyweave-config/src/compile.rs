//! Profile compilation: the static pass that partitions raw output keys
//! into *conundrum* and *safe* sets.
//!
//! A base key that the profile presses in two or more distinct modifier
//! forms can leak modifiers between concurrently running sequences (one
//! sequence holds Shift while another taps the bare key). The traffic
//! controller serializes access to exactly these keys, so the partition is
//! computed once per profile load.

use std::collections::{HashMap, HashSet};

use crate::keys::{ModifierSet, Modifier, OutputKey};
use crate::model::MacroProfile;

/// Modifier form of one appearance of a base key.
///
/// Alt+Shift is a distinct fourth form: a base appearing bare and as
/// Alt+Shift is contended. Control does not participate in form
/// classification; a Control-qualified key classifies by its Shift/Alt
/// bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Form {
    Bare,
    Shift,
    Alt,
    AltShift,
}

impl Form {
    fn of(modifiers: ModifierSet) -> Self {
        match (
            modifiers.contains(Modifier::Shift),
            modifiers.contains(Modifier::Alt),
        ) {
            (false, false) => Form::Bare,
            (true, false) => Form::Shift,
            (false, true) => Form::Alt,
            (true, true) => Form::AltShift,
        }
    }
}

/// Output of the compiler: two disjoint sets of raw output keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledProfile {
    /// Bases appearing in at least two distinct forms. Presses of these go
    /// through the traffic controller.
    pub conundrum_keys: HashSet<OutputKey>,
    /// Bases appearing in exactly one form, and that form is bare. Any
    /// number of sequences may press these concurrently.
    pub safe_keys: HashSet<OutputKey>,
}

impl CompiledProfile {
    /// The degraded partition: no key is contended. Used when compilation
    /// fails, trading contention safety for liveness.
    pub fn all_safe() -> Self {
        CompiledProfile::default()
    }

    pub fn is_conundrum(&self, key: OutputKey) -> bool {
        self.conundrum_keys.contains(&key)
    }
}

/// Run the static pass over every step of every binding. O(total steps).
///
/// Disabled bindings are included: the partition must stay valid when a
/// binding is toggled on without a recompile.
pub fn compile_profile(profile: &MacroProfile) -> CompiledProfile {
    let mut forms: HashMap<OutputKey, HashSet<Form>> = HashMap::new();

    for binding in &profile.bindings {
        for step in &binding.sequence {
            if let Some(key) = step.key {
                forms
                    .entry(key.raw())
                    .or_default()
                    .insert(Form::of(key.modifiers));
            }
        }
    }

    let mut compiled = CompiledProfile::default();
    for (base, seen) in forms {
        if seen.len() >= 2 {
            compiled.conundrum_keys.insert(base);
        } else if seen.contains(&Form::Bare) {
            compiled.safe_keys.insert(base);
        }
        // A base seen in exactly one modified form is neither: it needs no
        // serialization, but it is not marked safe either.
    }
    compiled
}
