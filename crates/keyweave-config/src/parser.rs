//! Profile loading and validation.
//!
//! Profiles are JSON documents. Loading parses the document, checks the
//! gesture timing invariant, then runs structural validation over every
//! binding, collecting all issues into one report.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{ProfileError, ValidationIssue};
use crate::keys::OutputKey;
use crate::model::{MacroBinding, MacroProfile, SequenceStep};

/// Maximum distinct base keys one sequence may touch.
pub const MAX_BASES_PER_SEQUENCE: usize = 4;

/// Maximum steps that may refer to any single base key.
pub const MAX_STEPS_PER_BASE: usize = 6;

/// Smallest allowed explicit `minDelay`.
pub const MIN_EXPLICIT_DELAY: u64 = 25;

/// Smallest allowed explicit `maxDelay - minDelay` spread.
pub const MIN_EXPLICIT_SPREAD: u64 = 4;

/// Parse and validate a profile file from the given path.
pub fn parse_profile(path: &Path) -> Result<MacroProfile, ProfileError> {
    let content = std::fs::read_to_string(path)?;
    parse_profile_str(&content)
}

/// Parse and validate a profile from a JSON string.
pub fn parse_profile_str(content: &str) -> Result<MacroProfile, ProfileError> {
    let profile: MacroProfile =
        serde_json::from_str(content).map_err(|e| ProfileError::from_json(content, e))?;

    profile
        .gesture_timing
        .check()
        .map_err(|message| ProfileError::InvalidTiming { message })?;

    let issues = validate_profile(&profile);
    if !issues.is_empty() {
        return Err(ProfileError::Invalid {
            src: Some(content.to_string()),
            issues,
        });
    }

    Ok(profile)
}

/// Validate every binding in a profile, collecting all issues.
pub fn validate_profile(profile: &MacroProfile) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut seen_names: HashMap<&str, usize> = HashMap::new();
    for binding in &profile.bindings {
        *seen_names.entry(binding.name.as_str()).or_insert(0) += 1;
    }
    for (name, count) in seen_names {
        if count > 1 {
            issues.push(ValidationIssue {
                binding: name.to_string(),
                step: None,
                message: format!("binding name appears {count} times; names must be unique"),
            });
        }
    }

    for binding in &profile.bindings {
        validate_binding(binding, &mut issues);
    }

    issues
}

/// Validate one binding: per-step rules plus the sequence aggregates.
pub fn validate_binding(binding: &MacroBinding, issues: &mut Vec<ValidationIssue>) {
    let issue = |step: Option<usize>, message: String| ValidationIssue {
        binding: binding.name.clone(),
        step,
        message,
    };

    if binding.sequence.is_empty() {
        issues.push(issue(None, "sequence is empty".to_string()));
        return;
    }

    for (i, step) in binding.sequence.iter().enumerate() {
        validate_step(step, |m| issues.push(issue(Some(i), m)));
    }

    // A held-through key stays down across the following step; pressing
    // the same base again while it is still down is unexecutable.
    for (i, pair) in binding.sequence.windows(2).enumerate() {
        if !pair[0].hold_through_next {
            continue;
        }
        if let (Some(held), Some(next)) = (pair[0].key, pair[1].key) {
            if held.raw() == next.raw() {
                issues.push(issue(
                    Some(i),
                    format!("cannot hold {held} through a press of the same base key"),
                ));
            }
        }
    }

    // Aggregate limits over the sequence's base keys.
    let mut per_base: HashMap<OutputKey, usize> = HashMap::new();
    for step in &binding.sequence {
        if let Some(key) = step.key {
            *per_base.entry(key.raw()).or_insert(0) += 1;
        }
    }
    if per_base.len() > MAX_BASES_PER_SEQUENCE {
        issues.push(issue(
            None,
            format!(
                "sequence touches {} distinct base keys (maximum {MAX_BASES_PER_SEQUENCE})",
                per_base.len()
            ),
        ));
    }
    for (base, count) in per_base {
        if count > MAX_STEPS_PER_BASE {
            issues.push(issue(
                None,
                format!("{count} steps refer to base key {base} (maximum {MAX_STEPS_PER_BASE})"),
            ));
        }
    }
}

fn validate_step(step: &SequenceStep, mut report: impl FnMut(String)) {
    if step.is_scroll() {
        if step.dual_key.is_some() {
            report("a scroll step cannot carry a dual key".to_string());
        }
        if step.hold_through_next {
            report("a scroll step cannot hold through the next step".to_string());
        }
        if let Some(0) = step.scroll_magnitude {
            report("scrollMagnitude must be at least 1".to_string());
        }
    } else if step.key.is_none() {
        report("step has no key and is not a scroll step".to_string());
    }

    match (step.buffer_tier, step.min_delay, step.max_delay) {
        (Some(_), None, None) => {}
        (Some(_), _, _) => {
            report("give bufferTier or minDelay/maxDelay, not both".to_string());
        }
        (None, Some(min), Some(max)) => {
            if min < MIN_EXPLICIT_DELAY {
                report(format!(
                    "minDelay must be at least {MIN_EXPLICIT_DELAY} ms (got {min})"
                ));
            }
            if max < min + MIN_EXPLICIT_SPREAD {
                report(format!(
                    "maxDelay must exceed minDelay by at least {MIN_EXPLICIT_SPREAD} ms (got [{min}, {max}])"
                ));
            }
        }
        (None, _, _) => {
            report("step needs a bufferTier or a minDelay/maxDelay pair".to_string());
        }
    }

    if let Some(range) = step.key_down_duration {
        if range.min == 0 || !range.is_ascending() {
            report(format!(
                "keyDownDuration {range} is not a positive ascending range"
            ));
        }
    }

    if !(1..=6).contains(&step.echo_hits) {
        report(format!("echoHits must be 1-6 (got {})", step.echo_hits));
    }

    if let Some(dual) = step.dual_key {
        match step.key {
            Some(primary) if primary.raw() == dual.raw() => {
                report(format!(
                    "dual key {dual} shares its base with the primary key"
                ));
            }
            _ => {}
        }
    }
    if let Some(0) = step.dual_key_offset {
        report("dualKeyOffset must be at least 1 ms".to_string());
    }
    if let Some(range) = step.dual_key_down_duration {
        if range.min == 0 || !range.is_ascending() {
            report(format!(
                "dualKeyDownDuration {range} is not a positive ascending range"
            ));
        }
    }
    if let Some(range) = step.release_delay {
        if range.min == 0 || !range.is_ascending() {
            report(format!(
                "releaseDelay {range} is not a positive ascending range"
            ));
        }
    }
}
