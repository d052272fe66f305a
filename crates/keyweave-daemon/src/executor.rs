//! Concurrent sequence executor.
//!
//! Bindings run as independent fire-and-forget flows: any number of
//! *different* bindings may run at once, but a binding never overlaps
//! itself (a second `execute_detached` while it runs is a logged no-op).
//! Cancellation is cooperative, checked between every step and every echo
//! hit; there is no preemption and no timeout.
//!
//! Each step presses its qualified key for a drawn hold duration,
//! optionally pairs it with a dual key after a small offset, repeats for
//! its echo hits, and sleeps a drawn buffer before the next press. Presses
//! of conundrum keys acquire a crossing from the traffic controller first.
//! A `hold_through_next` step leaves its key down; the owed release fires
//! during the following step's buffer after a release-delay draw, and owed
//! keys are always released by the time the sequence ends, on any path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use keyweave_config::{
    validate_binding, BufferTier, MacroBinding, MsRange, SequenceStep, ValidationIssue,
    DEFAULT_KEY_DOWN, DEFAULT_RELEASE_DELAY,
};

use crate::collab::{
    route_step, AudioControl, NoopAudio, NoopSpeech, SideEffect, SpeechTimers,
};
use crate::events::{monotonic_ms, ExecutionEvent, ExecutionEventBus};
use crate::oracle::{DelayRange, TimingOracle};
use crate::sink::{KeyDirection, KeySink};
use crate::traffic::{Crossing, TrafficController};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid sequence for binding '{binding}'")]
    Validation {
        binding: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("binding '{0}' is already running")]
    AlreadyRunning(String),

    #[error("binding '{0}' was cancelled")]
    Cancelled(String),

    #[error("executor is destroyed")]
    Destroyed,
}

/// Inter-step buffer ranges. The tight defaults keep sequences snappy; the
/// humanized variant draws from the oracle's named buffer ranges instead,
/// picking up their sweet-spot shaping.
#[derive(Debug, Clone, Copy)]
pub struct BufferProfile {
    pub low: MsRange,
    pub medium: MsRange,
    pub high: MsRange,
    humanized: bool,
}

impl BufferProfile {
    pub fn tight() -> Self {
        BufferProfile {
            low: MsRange::new(11, 17),
            medium: MsRange::new(15, 24),
            high: MsRange::new(980, 1270),
            humanized: false,
        }
    }

    pub fn humanized() -> Self {
        BufferProfile {
            low: DelayRange::BufferLow.bounds(),
            medium: DelayRange::BufferMedium.bounds(),
            high: DelayRange::BufferHigh.bounds(),
            humanized: true,
        }
    }

    fn draw(&self, oracle: &TimingOracle, tier: BufferTier) -> u64 {
        if self.humanized {
            let range = match tier {
                BufferTier::Low => DelayRange::BufferLow,
                BufferTier::Medium => DelayRange::BufferMedium,
                BufferTier::High => DelayRange::BufferHigh,
            };
            oracle.draw(range)
        } else {
            let range = match tier {
                BufferTier::Low => self.low,
                BufferTier::Medium => self.medium,
                BufferTier::High => self.high,
            };
            oracle.draw_range(range)
        }
    }
}

impl Default for BufferProfile {
    fn default() -> Self {
        BufferProfile::tight()
    }
}

struct ExecutorInner {
    sink: Arc<dyn KeySink>,
    oracle: Arc<TimingOracle>,
    traffic: Arc<TrafficController>,
    audio: Arc<dyn AudioControl>,
    timers: Arc<dyn SpeechTimers>,
    bus: ExecutionEventBus,
    buffers: BufferProfile,
    active: Mutex<HashMap<String, Arc<AtomicBool>>>,
    destroyed: AtomicBool,
}

/// Executes macro sequences. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SequenceExecutor {
    inner: Arc<ExecutorInner>,
}

impl SequenceExecutor {
    pub fn new(
        sink: Arc<dyn KeySink>,
        oracle: Arc<TimingOracle>,
        traffic: Arc<TrafficController>,
    ) -> Self {
        SequenceExecutor {
            inner: Arc::new(ExecutorInner {
                sink,
                oracle,
                traffic,
                audio: Arc::new(NoopAudio),
                timers: Arc::new(NoopSpeech),
                bus: ExecutionEventBus::default(),
                buffers: BufferProfile::default(),
                active: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Swap in audio/timer collaborators. Call before sharing the executor.
    pub fn with_collaborators(
        mut self,
        audio: Arc<dyn AudioControl>,
        timers: Arc<dyn SpeechTimers>,
    ) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_collaborators must be called before the executor is shared");
        inner.audio = audio;
        inner.timers = timers;
        self
    }

    /// Swap in a buffer profile. Call before sharing the executor.
    pub fn with_buffers(mut self, buffers: BufferProfile) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_buffers must be called before the executor is shared");
        inner.buffers = buffers;
        self
    }

    /// Subscribe to execution events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.inner.bus.subscribe()
    }

    /// Run a binding to completion. Fails fast on validation without
    /// touching the OS; refuses to overlap a running instance of the same
    /// binding.
    pub async fn execute(&self, binding: &MacroBinding) -> Result<(), ExecError> {
        let running = self.register(binding)?;
        let result = self.inner.run_binding(binding, &running).await;
        self.deregister(&binding.name);
        result
    }

    /// Fire-and-forget variant. A second call while the binding runs logs
    /// a warning and starts nothing.
    pub fn execute_detached(&self, binding: &MacroBinding) {
        let running = match self.register(binding) {
            Ok(running) => running,
            Err(ExecError::AlreadyRunning(name)) => {
                warn!(binding = %name, "already running; detached execute ignored");
                return;
            }
            Err(ExecError::Destroyed) => {
                warn!("executor destroyed; detached execute ignored");
                return;
            }
            Err(e) => {
                warn!(error = %e, "detached execute refused");
                return;
            }
        };

        let executor = self.clone();
        let binding = binding.clone();
        tokio::spawn(async move {
            let result = executor.inner.run_binding(&binding, &running).await;
            executor.deregister(&binding.name);
            match result {
                Ok(()) => debug!(binding = %binding.name, "sequence completed"),
                Err(ExecError::Cancelled(_)) => {
                    debug!(binding = %binding.name, "sequence cancelled")
                }
                Err(e) => info!(binding = %binding.name, error = %e, "sequence failed"),
            }
        });
    }

    pub fn is_binding_executing(&self, name: &str) -> bool {
        self.active_map().contains_key(name)
    }

    pub fn active_count(&self) -> usize {
        self.active_map().len()
    }

    pub fn active_bindings(&self) -> Vec<String> {
        self.active_map().keys().cloned().collect()
    }

    /// Request cooperative cancellation of a running binding. Returns
    /// whether the binding was running.
    pub fn cancel(&self, name: &str) -> bool {
        match self.active_map().get(name) {
            Some(running) => {
                running.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for running in self.active_map().values() {
            running.store(false, Ordering::SeqCst);
        }
    }

    /// Cancel everything and refuse further executions. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.cancel_all();
    }

    fn register(&self, binding: &MacroBinding) -> Result<Arc<AtomicBool>, ExecError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ExecError::Destroyed);
        }
        let mut active = self.active_map();
        if active.contains_key(&binding.name) {
            return Err(ExecError::AlreadyRunning(binding.name.clone()));
        }
        let running = Arc::new(AtomicBool::new(true));
        active.insert(binding.name.clone(), Arc::clone(&running));
        Ok(running)
    }

    fn deregister(&self, name: &str) {
        self.active_map().remove(name);
    }

    fn active_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A key left down by a `hold_through_next` step, with the crossing it may
/// still be holding.
struct OwedRelease {
    key: keyweave_config::QualifiedKey,
    crossing: Option<Crossing>,
    delay: MsRange,
}

impl ExecutorInner {
    async fn run_binding(
        &self,
        binding: &MacroBinding,
        running: &AtomicBool,
    ) -> Result<(), ExecError> {
        let mut issues = Vec::new();
        validate_binding(binding, &mut issues);
        if !issues.is_empty() {
            for issue in &issues {
                error!(binding = %binding.name, %issue, "sequence validation failed");
            }
            self.bus.publish(ExecutionEvent::Error {
                binding: binding.name.clone(),
                error: issues
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
                timestamp_ms: monotonic_ms(),
            });
            return Err(ExecError::Validation {
                binding: binding.name.clone(),
                issues,
            });
        }

        self.bus.publish(ExecutionEvent::Started {
            binding: binding.name.clone(),
            timestamp_ms: monotonic_ms(),
        });

        let mut owed: Option<OwedRelease> = None;
        let steps = &binding.sequence;

        for (index, step) in steps.iter().enumerate() {
            for echo in 0..step.echo_hits {
                if !running.load(Ordering::SeqCst) {
                    self.flush_owed(&mut owed, false).await;
                    self.bus.publish(ExecutionEvent::Cancelled {
                        binding: binding.name.clone(),
                        timestamp_ms: monotonic_ms(),
                    });
                    return Err(ExecError::Cancelled(binding.name.clone()));
                }

                // A release owed by the previous press is paid inside this
                // press's trailing buffer, after the press itself: the held
                // key genuinely overlaps this step's key-down.
                let mut owed_from_prev = owed.take();

                let last_echo = echo + 1 == step.echo_hits;
                self.run_press(binding, step, last_echo, &mut owed).await;

                let is_final_press = index + 1 == steps.len() && last_echo;
                let delay_ms = if is_final_press {
                    None
                } else {
                    let ms = self.buffer_delay(step, last_echo);
                    self.sleep_buffer(ms, &mut owed_from_prev).await;
                    Some(ms)
                };
                self.flush_owed(&mut owed_from_prev, true).await;

                self.bus.publish(ExecutionEvent::Step {
                    binding: binding.name.clone(),
                    step_index: index,
                    delay_ms,
                    timestamp_ms: monotonic_ms(),
                });
            }
        }

        self.flush_owed(&mut owed, true).await;

        self.bus.publish(ExecutionEvent::Completed {
            binding: binding.name.clone(),
            timestamp_ms: monotonic_ms(),
        });
        Ok(())
    }

    /// One press of a step: side-effect routing, crossing, key-down timing,
    /// dual key, hold-through bookkeeping.
    async fn run_press(
        &self,
        binding: &MacroBinding,
        step: &SequenceStep,
        last_echo: bool,
        owed: &mut Option<OwedRelease>,
    ) {
        if let Some(routed) = route_step(step) {
            self.dispatch_side_effect(routed.effect);
            if routed.skip_keystroke {
                return;
            }
        }

        if step.is_scroll() {
            let magnitude = step.scroll_magnitude.unwrap_or(1);
            if let Some(direction) = step.scroll_direction {
                if let Err(e) = self.sink.scroll(direction, magnitude) {
                    warn!(error = %e, "scroll injection failed; skipping");
                }
            }
            return;
        }

        let Some(key) = step.key else { return };

        let crossing = self
            .traffic
            .request_crossing(key, Some(&binding.name))
            .await;

        let key_down_ms = self
            .oracle
            .draw_range(step.key_down_duration.unwrap_or(DEFAULT_KEY_DOWN));

        // Primary down. A rejected toggle falls back to an atomic tap with
        // the hold treated as already elapsed.
        let mut tapped = false;
        if let Err(e) = self.sink.key_toggle(key, KeyDirection::Down) {
            warn!(%key, error = %e, "key toggle rejected; falling back to tap");
            tapped = true;
            if let Err(e) = self.sink.key_tap(key) {
                error!(%key, error = %e, "tap fallback failed; skipping press");
            }
        }

        let holding_through = step.hold_through_next && last_echo && !tapped;

        if let Some(dual) = step.dual_key {
            let offset = match step.dual_key_offset {
                Some(ms) => ms,
                None => self.oracle.draw(DelayRange::DualOffset),
            };
            sleep(Duration::from_millis(offset)).await;

            let mut dual_down = true;
            if let Err(e) = self.sink.key_toggle(dual, KeyDirection::Down) {
                warn!(key = %dual, error = %e, "dual toggle rejected; falling back to tap");
                dual_down = false;
                if let Err(e) = self.sink.key_tap(dual) {
                    error!(key = %dual, error = %e, "dual tap fallback failed");
                }
            }

            let dual_hold = self.oracle.draw_range(
                step.dual_key_down_duration
                    .or(step.key_down_duration)
                    .unwrap_or(DEFAULT_KEY_DOWN),
            );

            // Finish the primary hold, release it, then let the dual key
            // run out the rest of its own hold.
            let remaining_primary = key_down_ms.saturating_sub(offset);
            if !tapped {
                sleep(Duration::from_millis(remaining_primary)).await;
                if !holding_through {
                    self.release_key(key);
                }
            }
            if dual_down {
                let elapsed_since_dual = if tapped { 0 } else { remaining_primary };
                let remaining_dual = dual_hold.saturating_sub(elapsed_since_dual);
                sleep(Duration::from_millis(remaining_dual)).await;
                self.release_key(dual);
            }
        } else if !tapped {
            sleep(Duration::from_millis(key_down_ms)).await;
            if !holding_through {
                self.release_key(key);
            }
        }

        if holding_through {
            *owed = Some(OwedRelease {
                key,
                crossing: crossing.is_held().then_some(crossing),
                delay: step.release_delay.unwrap_or(DEFAULT_RELEASE_DELAY),
            });
        } else {
            self.traffic.release_crossing(crossing);
        }
    }

    fn release_key(&self, key: keyweave_config::QualifiedKey) {
        if let Err(e) = self.sink.key_toggle(key, KeyDirection::Up) {
            warn!(%key, error = %e, "key release failed");
        }
    }

    /// Buffer delay for this press: the step's tier or explicit range, or
    /// the echo-hit range between humanized echo repetitions.
    fn buffer_delay(&self, step: &SequenceStep, last_echo: bool) -> u64 {
        if !last_echo && self.buffers.humanized {
            return self.oracle.draw(DelayRange::EchoHit);
        }
        match (step.buffer_tier, step.min_delay, step.max_delay) {
            (Some(tier), _, _) => self.buffers.draw(&self.oracle, tier),
            (None, Some(min), Some(max)) => self.oracle.draw_between(min, max),
            // Validation guarantees one of the two forms.
            _ => self.buffers.draw(&self.oracle, BufferTier::Low),
        }
    }

    /// Sleep a buffer, paying any owed hold-through release inside it.
    async fn sleep_buffer(&self, buffer_ms: u64, owed: &mut Option<OwedRelease>) {
        match owed.take() {
            Some(release) => {
                let delay = self.oracle.draw_range(release.delay).min(buffer_ms);
                sleep(Duration::from_millis(delay)).await;
                self.release_key(release.key);
                if let Some(crossing) = release.crossing {
                    self.traffic.release_crossing(crossing);
                }
                sleep(Duration::from_millis(buffer_ms - delay)).await;
            }
            None => sleep(Duration::from_millis(buffer_ms)).await,
        }
    }

    /// Release any owed key at a sequence boundary. On the completion path
    /// the release-delay draw is still respected; on cancellation the key
    /// goes up immediately.
    async fn flush_owed(&self, owed: &mut Option<OwedRelease>, with_delay: bool) {
        if let Some(release) = owed.take() {
            if with_delay {
                let delay = self.oracle.draw_range(release.delay);
                sleep(Duration::from_millis(delay)).await;
            }
            self.release_key(release.key);
            if let Some(crossing) = release.crossing {
                self.traffic.release_crossing(crossing);
            }
        }
    }

    fn dispatch_side_effect(&self, effect: SideEffect) {
        match effect {
            SideEffect::Volume(level) => self.audio.set_volume(level),
            SideEffect::MicToggle => self.audio.toggle_mic(),
            SideEffect::DeafenToggle => self.audio.toggle_deafen(),
            SideEffect::Timer(spec) => {
                self.timers.timer_start(&spec.id, spec.seconds, &spec.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyweave_config::{
        compile_profile, CompiledProfile, GestureType, InputKey, MacroProfile, QualifiedKey,
        Trigger,
    };

    use crate::collab::VolumeLevel;
    use crate::sink::{RecordingSink, SinkAction};

    struct Harness {
        executor: SequenceExecutor,
        sink: Arc<RecordingSink>,
    }

    fn harness_with(compiled: CompiledProfile) -> Harness {
        let sink = Arc::new(RecordingSink::new());
        let oracle = Arc::new(TimingOracle::new());
        let traffic = Arc::new(TrafficController::new(compiled, Arc::clone(&oracle)));
        let executor =
            SequenceExecutor::new(Arc::clone(&sink) as Arc<dyn KeySink>, oracle, traffic);
        Harness { executor, sink }
    }

    fn harness() -> Harness {
        harness_with(CompiledProfile::all_safe())
    }

    fn step(key: &str) -> SequenceStep {
        SequenceStep::keystroke(QualifiedKey::parse(key).unwrap(), BufferTier::Low)
    }

    fn binding(name: &str, steps: Vec<SequenceStep>) -> MacroBinding {
        MacroBinding {
            name: name.to_string(),
            enabled: true,
            trigger: Trigger {
                key: InputKey::W,
                gesture: GestureType::Single,
            },
            sequence: steps,
        }
    }

    fn key(s: &str) -> QualifiedKey {
        QualifiedKey::parse(s).unwrap()
    }

    /// Collect events until (and including) the first terminal event for
    /// `name`.
    async fn events_until_terminal(
        rx: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>,
        name: &str,
    ) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        loop {
            let ev = rx.recv().await.unwrap();
            let terminal = matches!(
                &ev,
                ExecutionEvent::Completed { binding, .. }
                | ExecutionEvent::Error { binding, .. }
                | ExecutionEvent::Cancelled { binding, .. }
                if binding == name
            );
            events.push(ev);
            if terminal {
                return events;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_never_touches_the_sink() {
        let h = harness();
        let mut rx = h.executor.subscribe();
        let mut bad = binding("bad", vec![step("R")]);
        bad.sequence[0].echo_hits = 9;

        let result = h.executor.execute(&bad).await;
        assert!(matches!(result, Err(ExecError::Validation { .. })));
        assert!(h.sink.actions().is_empty());

        match rx.recv().await.unwrap() {
            ExecutionEvent::Error { binding, error, .. } => {
                assert_eq!(binding, "bad");
                assert!(error.contains("echoHits"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(!h.executor.is_binding_executing("bad"));
    }

    #[tokio::test(start_paused = true)]
    async fn single_step_presses_for_the_drawn_hold() {
        let h = harness();
        h.executor.execute(&binding("one", vec![step("R")])).await.unwrap();

        let records = h.sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].action,
            SinkAction::Toggle(key("R"), KeyDirection::Down)
        );
        assert_eq!(
            records[1].action,
            SinkAction::Toggle(key("R"), KeyDirection::Up)
        );
        let hold = (records[1].at - records[0].at).as_millis() as u64;
        assert!(
            (DEFAULT_KEY_DOWN.min..=DEFAULT_KEY_DOWN.max).contains(&hold),
            "hold was {hold} ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn echo_hits_repeat_with_tier_buffers() {
        let h = harness();
        let mut s = step("Q");
        s.echo_hits = 3;
        h.executor.execute(&binding("echo", vec![s])).await.unwrap();

        let records = h.sink.records();
        assert_eq!(records.len(), 6); // three down/up pairs

        // Delay between a release and the next press is the low-tier draw.
        for pair in [(1usize, 2usize), (3, 4)] {
            let gap = (records[pair.1].at - records[pair.0].at).as_millis() as u64;
            assert!((11..=17).contains(&gap), "echo gap was {gap} ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detached_same_binding_does_not_overlap() {
        let h = harness();
        let mut rx = h.executor.subscribe();

        let mut slow = step("R");
        slow.buffer_tier = Some(BufferTier::High);
        let b = binding("solo", vec![slow, step("Q")]);

        h.executor.execute_detached(&b);
        assert!(h.executor.is_binding_executing("solo"));
        // Second start while running: logged no-op.
        h.executor.execute_detached(&b);

        let events = events_until_terminal(&mut rx, "solo").await;
        let started = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::Started { .. }))
            .count();
        let completed = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::Completed { .. }))
            .count();
        assert_eq!(started, 1);
        assert_eq!(completed, 1);
        assert!(!h.executor.is_binding_executing("solo"));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_bindings_run_concurrently() {
        let h = harness();
        let mut rx = h.executor.subscribe();

        let mut slow_a = step("Q");
        slow_a.buffer_tier = Some(BufferTier::High);
        let a = binding("a", vec![slow_a, step("Q")]);
        let mut slow_b = step("E");
        slow_b.buffer_tier = Some(BufferTier::High);
        let b = binding("b", vec![slow_b, step("E")]);

        h.executor.execute_detached(&a);
        h.executor.execute_detached(&b);
        assert_eq!(h.executor.active_count(), 2);
        let mut active = h.executor.active_bindings();
        active.sort();
        assert_eq!(active, vec!["a".to_string(), "b".to_string()]);

        let mut done = std::collections::HashSet::new();
        while done.len() < 2 {
            if let ExecutionEvent::Completed { binding, .. } = rx.recv().await.unwrap() {
                done.insert(binding);
            }
        }
        assert_eq!(h.executor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn conundrum_presses_never_overlap() {
        // R appears bare and shifted across two bindings, so both presses
        // must serialize through the traffic controller.
        let a = binding("a", vec![SequenceStep::keystroke(key("SHIFT+R"), BufferTier::Low)]);
        let b = binding("b", vec![SequenceStep::keystroke(key("R"), BufferTier::Low)]);
        let profile = MacroProfile {
            name: "p".to_string(),
            description: String::new(),
            gesture_timing: Default::default(),
            bindings: vec![a.clone(), b.clone()],
        };
        let h = harness_with(compile_profile(&profile));
        let mut rx = h.executor.subscribe();

        h.executor.execute_detached(&a);
        h.executor.execute_detached(&b);

        let mut done = std::collections::HashSet::new();
        while done.len() < 2 {
            if let ExecutionEvent::Completed { binding, .. } = rx.recv().await.unwrap() {
                done.insert(binding);
            }
        }

        // Reconstruct the down..up interval per qualified key and check the
        // two R-form intervals are disjoint.
        let records = h.sink.records();
        let interval = |k: QualifiedKey| {
            let down = records
                .iter()
                .find(|r| r.action == SinkAction::Toggle(k, KeyDirection::Down))
                .unwrap()
                .at;
            let up = records
                .iter()
                .find(|r| r.action == SinkAction::Toggle(k, KeyDirection::Up))
                .unwrap()
                .at;
            (down, up)
        };
        let (a_down, a_up) = interval(key("SHIFT+R"));
        let (b_down, b_up) = interval(key("R"));
        assert!(
            a_up <= b_down || b_up <= a_down,
            "conundrum intervals overlap: {a_down:?}..{a_up:?} vs {b_down:?}..{b_up:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dual_key_follows_after_the_offset() {
        let h = harness();
        let mut s = step("R");
        s.key_down_duration = Some(MsRange::new(20, 20));
        s.dual_key = Some(key("Q"));
        s.dual_key_offset = Some(6);
        s.dual_key_down_duration = Some(MsRange::new(20, 20));
        h.executor.execute(&binding("dual", vec![s])).await.unwrap();

        let records = h.sink.records();
        let actions: Vec<_> = records.iter().map(|r| r.action.clone()).collect();
        assert_eq!(
            actions,
            vec![
                SinkAction::Toggle(key("R"), KeyDirection::Down),
                SinkAction::Toggle(key("Q"), KeyDirection::Down),
                SinkAction::Toggle(key("R"), KeyDirection::Up),
                SinkAction::Toggle(key("Q"), KeyDirection::Up),
            ]
        );
        let ms = |i: usize, j: usize| (records[j].at - records[i].at).as_millis() as u64;
        assert_eq!(ms(0, 1), 6); // dual joins after the offset
        assert_eq!(ms(0, 2), 20); // primary holds its full duration
        assert_eq!(ms(1, 3), 20); // dual holds its own duration from its press
    }

    #[tokio::test(start_paused = true)]
    async fn hold_through_overlaps_the_next_press() {
        let h = harness();
        let mut first = step("W");
        first.hold_through_next = true;
        first.release_delay = Some(MsRange::new(5, 5));
        let b = binding("hold", vec![first, step("SPACE")]);
        h.executor.execute(&b).await.unwrap();

        let actions = h.sink.actions();
        assert_eq!(
            actions,
            vec![
                SinkAction::Toggle(key("W"), KeyDirection::Down),
                SinkAction::Toggle(key("SPACE"), KeyDirection::Down),
                SinkAction::Toggle(key("SPACE"), KeyDirection::Up),
                SinkAction::Toggle(key("W"), KeyDirection::Up),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_owed_keys() {
        let h = harness();
        let mut rx = h.executor.subscribe();

        let mut first = step("W");
        first.hold_through_next = true;
        first.buffer_tier = Some(BufferTier::High); // long gap before step 2
        let b = binding("held", vec![first, step("SPACE")]);

        h.executor.execute_detached(&b);
        // Cancel while the owed W release is still pending in the gap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.executor.cancel("held"));

        let events = events_until_terminal(&mut rx, "held").await;
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::Cancelled { .. })
        ));

        let actions = h.sink.actions();
        assert_eq!(
            actions,
            vec![
                SinkAction::Toggle(key("W"), KeyDirection::Down),
                SinkAction::Toggle(key("W"), KeyDirection::Up),
            ]
        );
    }

    struct RecordingAudio {
        calls: Mutex<Vec<String>>,
    }

    impl AudioControl for RecordingAudio {
        fn set_volume(&self, level: VolumeLevel) {
            self.calls.lock().unwrap().push(format!("volume:{level}"));
        }
        fn toggle_mic(&self) {
            self.calls.lock().unwrap().push("mic".to_string());
        }
        fn toggle_deafen(&self) {
            self.calls.lock().unwrap().push("deafen".to_string());
        }
    }

    struct RecordingTimers {
        calls: Mutex<Vec<(String, u64, String)>>,
    }

    impl SpeechTimers for RecordingTimers {
        fn timer_start(&self, id: &str, seconds: u64, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((id.to_string(), seconds, message.to_string()));
        }
    }

    fn harness_with_collaborators() -> (Harness, Arc<RecordingAudio>, Arc<RecordingTimers>) {
        let sink = Arc::new(RecordingSink::new());
        let oracle = Arc::new(TimingOracle::new());
        let traffic = Arc::new(TrafficController::new(
            CompiledProfile::all_safe(),
            Arc::clone(&oracle),
        ));
        let audio = Arc::new(RecordingAudio {
            calls: Mutex::new(Vec::new()),
        });
        let timers = Arc::new(RecordingTimers {
            calls: Mutex::new(Vec::new()),
        });
        let executor =
            SequenceExecutor::new(Arc::clone(&sink) as Arc<dyn KeySink>, oracle, traffic)
                .with_collaborators(
                    Arc::clone(&audio) as Arc<dyn AudioControl>,
                    Arc::clone(&timers) as Arc<dyn SpeechTimers>,
                );
        (Harness { executor, sink }, audio, timers)
    }

    #[tokio::test(start_paused = true)]
    async fn volume_step_replaces_the_keystroke() {
        let (h, audio, _) = harness_with_collaborators();
        let mut s = step("END");
        s.name = Some("Volume: High".to_string());
        h.executor.execute(&binding("vol", vec![s])).await.unwrap();

        assert!(h.sink.actions().is_empty());
        assert_eq!(*audio.calls.lock().unwrap(), vec!["volume:high"]);
    }

    #[tokio::test(start_paused = true)]
    async fn mic_toggle_still_presses_its_key() {
        let (h, audio, _) = harness_with_collaborators();
        let mut s = step("M");
        s.name = Some("Mic Toggle".to_string());
        h.executor.execute(&binding("mic", vec![s])).await.unwrap();

        assert_eq!(*audio.calls.lock().unwrap(), vec!["mic"]);
        assert_eq!(
            h.sink.actions(),
            vec![
                SinkAction::Toggle(key("M"), KeyDirection::Down),
                SinkAction::Toggle(key("M"), KeyDirection::Up),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_step_starts_a_named_timer() {
        let (h, _, timers) = harness_with_collaborators();
        let mut s = step("END");
        s.name = Some("Timer placeholder - say 'Back Off' after 12 seconds".to_string());
        h.executor.execute(&binding("timer", vec![s])).await.unwrap();

        assert!(h.sink.actions().is_empty());
        assert_eq!(
            *timers.calls.lock().unwrap(),
            vec![("back_off".to_string(), 12, "Back Off".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_toggle_falls_back_to_a_tap() {
        let h = harness();
        h.sink.reject_toggle(key("R"));
        h.executor
            .execute(&binding("tapped", vec![step("R"), step("Q")]))
            .await
            .unwrap();

        let actions = h.sink.actions();
        assert_eq!(
            actions,
            vec![
                SinkAction::Tap(key("R")),
                SinkAction::Toggle(key("Q"), KeyDirection::Down),
                SinkAction::Toggle(key("Q"), KeyDirection::Up),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_step_emits_a_scroll() {
        let h = harness();
        let mut s = step("R");
        s.key = None;
        s.scroll_direction = Some(keyweave_config::ScrollDirection::Down);
        s.scroll_magnitude = Some(3);
        h.executor.execute(&binding("scroll", vec![s])).await.unwrap();

        assert_eq!(
            h.sink.actions(),
            vec![SinkAction::Scroll(keyweave_config::ScrollDirection::Down, 3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_refuses_new_work() {
        let h = harness();
        h.executor.destroy();
        h.executor.destroy(); // idempotent

        let result = h.executor.execute(&binding("late", vec![step("R")])).await;
        assert!(matches!(result, Err(ExecError::Destroyed)));
        h.executor.execute_detached(&binding("late", vec![step("R")]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.sink.actions().is_empty());
        assert_eq!(h.executor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_delay_steps_use_their_own_range() {
        let h = harness();
        let mut s = step("Q");
        s.buffer_tier = None;
        s.min_delay = Some(40);
        s.max_delay = Some(48);
        s.echo_hits = 2;
        h.executor.execute(&binding("explicit", vec![s])).await.unwrap();

        let records = h.sink.records();
        let gap = (records[2].at - records[1].at).as_millis() as u64;
        assert!((40..=48).contains(&gap), "gap was {gap} ms");
    }
}
