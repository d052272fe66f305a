//! Event types emitted by the engine.
//!
//! Gesture events flow from the orchestrator to its subscribers; execution
//! events fan out from the sequence executor over a bounded broadcast
//! channel (slow consumers lag, the executor never blocks on them).

use std::sync::OnceLock;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;

use keyweave_config::{GestureType, InputKey};

/// Milliseconds since process start, monotonic.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// A classified gesture on one input key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GestureEvent {
    pub key: InputKey,
    pub gesture: GestureType,
    pub timestamp_ms: u64,
    /// Hold duration of the final press, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_duration_ms: Option<u64>,
}

/// State change of a running (or refused) sequence execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        binding: String,
        timestamp_ms: u64,
    },
    Step {
        binding: String,
        step_index: usize,
        /// Buffer delay drawn after the step, when one was slept.
        #[serde(skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        timestamp_ms: u64,
    },
    Completed {
        binding: String,
        timestamp_ms: u64,
    },
    Error {
        binding: String,
        error: String,
        timestamp_ms: u64,
    },
    Cancelled {
        binding: String,
        timestamp_ms: u64,
    },
}

impl ExecutionEvent {
    /// Name of the binding the event concerns.
    pub fn binding(&self) -> &str {
        match self {
            ExecutionEvent::Started { binding, .. }
            | ExecutionEvent::Step { binding, .. }
            | ExecutionEvent::Completed { binding, .. }
            | ExecutionEvent::Error { binding, .. }
            | ExecutionEvent::Cancelled { binding, .. } => binding,
        }
    }
}

/// Bounded fanout for execution events.
#[derive(Debug, Clone)]
pub struct ExecutionEventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        ExecutionEventBus { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for ExecutionEventBus {
    fn default() -> Self {
        ExecutionEventBus::new(256)
    }
}
