//! Gesture-to-binding dispatch.
//!
//! The dispatcher is the orchestrator's central callback: for each gesture
//! it finds the first enabled binding whose trigger matches and fires it
//! detached. No match means no action.

use std::sync::{Arc, Mutex};

use tracing::debug;

use keyweave_config::MacroProfile;

use crate::events::GestureEvent;
use crate::executor::SequenceExecutor;

pub struct BindingDispatcher {
    profile: Arc<Mutex<MacroProfile>>,
    executor: SequenceExecutor,
}

impl BindingDispatcher {
    pub fn new(profile: MacroProfile, executor: SequenceExecutor) -> Self {
        BindingDispatcher {
            profile: Arc::new(Mutex::new(profile)),
            executor,
        }
    }

    /// Swap the profile on reload. In-flight sequences are unaffected.
    pub fn set_profile(&self, profile: MacroProfile) {
        *self.profile.lock().unwrap_or_else(|e| e.into_inner()) = profile;
    }

    /// Route one gesture. Fire-and-forget; returns immediately.
    pub fn dispatch(&self, event: &GestureEvent) {
        let profile = self.profile.lock().unwrap_or_else(|e| e.into_inner());
        match profile.find_binding(event.key, event.gesture) {
            Some(binding) => {
                debug!(key = %event.key, gesture = %event.gesture, binding = %binding.name, "dispatch");
                self.executor.execute_detached(binding);
            }
            None => {
                debug!(key = %event.key, gesture = %event.gesture, "no binding");
            }
        }
    }
}
