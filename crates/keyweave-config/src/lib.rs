//! Profile model, parsing and compilation for keyweave
//!
//! This crate holds the shared vocabulary (keys, gestures, timing), the
//! JSON profile model with validation, and the compiler that partitions
//! raw output keys into conundrum and safe sets.

mod compile;
mod error;
mod keys;
mod model;
mod parser;

pub use compile::{compile_profile, CompiledProfile};
pub use error::{ProfileError, ValidationIssue};
pub use keys::*;
pub use model::*;
pub use parser::{
    parse_profile, parse_profile_str, validate_binding, validate_profile,
    MAX_BASES_PER_SEQUENCE, MAX_STEPS_PER_BASE, MIN_EXPLICIT_DELAY, MIN_EXPLICIT_SPREAD,
};
