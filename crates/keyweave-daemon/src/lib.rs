//! keyweave engine
//!
//! Turns an operator's taps on a small set of input keys into classified
//! gestures, and gestures into concurrently executing, human-timed
//! synthetic keystroke sequences.
//!
//! The pipeline is strictly one-way: a platform hook feeds a bounded
//! ingest queue; a single-task orchestrator drives per-key gesture state
//! machines; resolved gestures dispatch to bindings; the executor runs
//! each binding as its own cooperative flow, coordinating contended keys
//! through the traffic controller and drawing every delay from the timing
//! oracle.

pub mod collab;
pub mod device;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod gesture;
pub mod hook;
pub mod oracle;
pub mod orchestrator;
pub mod sink;
pub mod traffic;

pub use dispatcher::BindingDispatcher;
pub use events::{ExecutionEvent, GestureEvent};
pub use executor::{BufferProfile, ExecError, SequenceExecutor};
pub use oracle::{DelayRange, TimingOracle};
pub use orchestrator::{Orchestrator, PointerButton};
pub use sink::{KeyDirection, KeySink, NullSink, UinputSink};
pub use traffic::TrafficController;
