//! Gesture orchestrator: owns one state machine per input key, ingests raw
//! events through a bounded FIFO queue, and drives periodic finalization.
//!
//! All four entry points feed a single bounded queue processed in strict
//! FIFO order by one task, so per-key and cross-key event ordering is
//! preserved. A 20 ms interval on the same task visits every machine's
//! finalization check; it is the only path that emits 1-3 press gestures
//! (4-press gestures resolve synchronously from the key-up dispatch).
//!
//! For a single emission the central callback runs before any additional
//! listener; listener panics are isolated per listener. After
//! [`Orchestrator::destroy`] returns, ingest is silently dropped and
//! nothing emits again.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use keyweave_config::{GestureTiming, InputKey};

use crate::events::{monotonic_ms, GestureEvent};
use crate::gesture::GestureMachine;

/// Ingest queue capacity. On overflow the newest event is dropped with an
/// error log.
const INGEST_CAPACITY: usize = 128;

/// Finalization interval.
const FINALIZE_EVERY: Duration = Duration::from_millis(20);

/// Pointer buttons the orchestrator accepts as gesture sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    Middle,
    Mouse4,
    Mouse5,
}

impl PointerButton {
    fn input_key(self) -> InputKey {
        match self {
            PointerButton::Middle => InputKey::MiddleClick,
            PointerButton::Mouse4 => InputKey::Mouse4,
            PointerButton::Mouse5 => InputKey::Mouse5,
        }
    }
}

/// Handle returned by [`Orchestrator::on_gesture`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&GestureEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum IngestEvent {
    Down(InputKey, u64),
    Up(InputKey, u64),
}

/// Monotonic millisecond source. Injectable so tests drive time explicitly.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

struct Shared {
    stopped: AtomicBool,
    machines: Mutex<HashMap<InputKey, GestureMachine>>,
    central: Listener,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl Shared {
    /// Emit one gesture: central callback first, then additional listeners,
    /// each inside its own panic boundary.
    fn emit(&self, event: GestureEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        debug!(key = %event.key, gesture = %event.gesture, "gesture");

        invoke_guarded(&self.central, &event, "central");

        let listeners: Vec<Listener> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            invoke_guarded(&listener, &event, "listener");
        }
    }
}

fn invoke_guarded(listener: &Listener, event: &GestureEvent, who: &str) {
    if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
        warn!("{who} gesture callback panicked; continuing");
    }
}

/// Owns the per-key gesture machines and the ingest loop. Clones share
/// the same machines, queue and subscribers.
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::Sender<IngestEvent>,
    shared: Arc<Shared>,
    clock: Clock,
}

impl Orchestrator {
    /// Spawn the orchestrator with its mandatory central callback.
    pub fn spawn(
        timing: GestureTiming,
        central: impl Fn(&GestureEvent) + Send + Sync + 'static,
    ) -> Self {
        Self::spawn_with_clock(timing, central, Arc::new(monotonic_ms))
    }

    /// Spawn with an explicit clock. Tests use this to drive time.
    pub fn spawn_with_clock(
        timing: GestureTiming,
        central: impl Fn(&GestureEvent) + Send + Sync + 'static,
        clock: Clock,
    ) -> Self {
        let mut machines = HashMap::new();
        for key in InputKey::ALL {
            machines.insert(key, GestureMachine::new(timing));
        }

        let shared = Arc::new(Shared {
            stopped: AtomicBool::new(false),
            machines: Mutex::new(machines),
            central: Arc::new(central),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        });

        let (tx, rx) = mpsc::channel(INGEST_CAPACITY);
        tokio::spawn(run_loop(rx, Arc::clone(&shared), Arc::clone(&clock)));

        Orchestrator { tx, shared, clock }
    }

    pub fn handle_key_down(&self, key: InputKey) {
        self.ingest(IngestEvent::Down(key, (self.clock)()));
    }

    pub fn handle_key_up(&self, key: InputKey) {
        self.ingest(IngestEvent::Up(key, (self.clock)()));
    }

    pub fn handle_mouse_down(&self, button: PointerButton) {
        self.ingest(IngestEvent::Down(button.input_key(), (self.clock)()));
    }

    pub fn handle_mouse_up(&self, button: PointerButton) {
        self.ingest(IngestEvent::Up(button.input_key(), (self.clock)()));
    }

    /// Ingest a key event with a hook-supplied timestamp.
    pub fn handle_raw(&self, key: InputKey, down: bool, timestamp_ms: u64) {
        let ev = if down {
            IngestEvent::Down(key, timestamp_ms)
        } else {
            IngestEvent::Up(key, timestamp_ms)
        };
        self.ingest(ev);
    }

    fn ingest(&self, ev: IngestEvent) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.try_send(ev).is_err() {
            error!("ingest queue full; dropping input event");
        }
    }

    /// Subscribe an additional gesture listener.
    pub fn on_gesture(
        &self,
        listener: impl Fn(&GestureEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off_gesture(&self, id: ListenerId) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(lid, _)| *lid != id);
    }

    /// Reset every machine onto a new timing configuration. Machines are
    /// reused, not reallocated.
    pub fn apply_timing(&self, timing: GestureTiming) {
        let mut machines = self
            .shared
            .machines
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for machine in machines.values_mut() {
            machine.apply_timing(timing);
        }
    }

    /// Stop the orchestrator: subsequent ingest is silently dropped, the
    /// finalization timer becomes a no-op, every machine is reset and all
    /// subscribers are cleared. Idempotent; nothing emits after this
    /// returns.
    pub fn destroy(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        {
            let mut machines = self
                .shared
                .machines
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for machine in machines.values_mut() {
                machine.reset();
            }
        }
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

async fn run_loop(mut rx: mpsc::Receiver<IngestEvent>, shared: Arc<Shared>, clock: Clock) {
    let mut tick = tokio::time::interval(FINALIZE_EVERY);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => dispatch(&shared, ev),
                None => return,
            },
            _ = tick.tick() => finalize_all(&shared, (clock)()),
        }
    }
}

/// Apply one queued event to its machine. Resolution is collected with the
/// machine lock held (its state is already reset) and emitted after the
/// lock drops, so a callback can never re-enter a machine mid-mutation.
fn dispatch(shared: &Shared, ev: IngestEvent) {
    let resolved = {
        let mut machines = shared.machines.lock().unwrap_or_else(|e| e.into_inner());
        match ev {
            IngestEvent::Down(key, t) => {
                if let Some(machine) = machines.get_mut(&key) {
                    machine.handle_key_down(t);
                }
                None
            }
            IngestEvent::Up(key, t) => machines
                .get_mut(&key)
                .and_then(|machine| machine.handle_key_up(t).map(|r| (key, t, r))),
        }
    };

    if let Some((key, t, r)) = resolved {
        shared.emit(GestureEvent {
            key,
            gesture: r.gesture,
            timestamp_ms: t,
            hold_duration_ms: Some(r.hold_ms),
        });
    }
}

fn finalize_all(shared: &Shared, now: u64) {
    if shared.stopped.load(Ordering::SeqCst) {
        return;
    }
    let resolved: Vec<(InputKey, crate::gesture::ResolvedGesture)> = {
        let mut machines = shared.machines.lock().unwrap_or_else(|e| e.into_inner());
        machines
            .iter_mut()
            .filter_map(|(key, machine)| machine.finalize(now).map(|r| (*key, r)))
            .collect()
    };
    for (key, r) in resolved {
        shared.emit(GestureEvent {
            key,
            gesture: r.gesture,
            timestamp_ms: now,
            hold_duration_ms: Some(r.hold_ms),
        });
    }
}
