//! Traffic controller: serialized access to conundrum keys.
//!
//! A sequence must hold a *crossing* for a raw key before pressing it in
//! any form, whenever that key is in the compiled profile's conundrum set.
//! At most one crossing exists per raw key at a time, and a crossing
//! request waits while **any** conundrum key's crossing is held, not just
//! its own: two sequences pressing `SHIFT+R` and bare `W` concurrently can
//! still leak the Shift into the `W` press, so conundrum presses are
//! serialized globally. FIFO fairness among contenders for the same key is
//! enforced with per-key ticket queues. The one exemption from the global
//! gate is a token the requesting macro itself still holds (a hold-through
//! key): a sequence never waits on itself.
//!
//! A macro granted *supremacy* bypasses the protocol entirely.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use keyweave_config::{CompiledProfile, OutputKey, QualifiedKey};

use crate::oracle::{DelayRange, TimingOracle};

/// Proof of an acquired (or waived) crossing. Pass back to
/// [`TrafficController::release_crossing`] when the press is done.
#[derive(Debug)]
#[must_use = "a crossing must be released after the key-up"]
pub struct Crossing {
    /// `None` when no crossing was needed (safe key or supremacy).
    held: Option<(OutputKey, u64)>,
}

impl Crossing {
    fn waived() -> Self {
        Crossing { held: None }
    }

    /// Whether a token is actually held.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

#[derive(Debug, Clone)]
struct Holder {
    ticket: u64,
    /// Macro name the token was granted to, when one was given.
    owner: Option<String>,
}

#[derive(Debug, Default)]
struct TrafficState {
    compiled: CompiledProfile,
    /// Current holder per raw key. At most one entry per key; only
    /// conundrum keys ever appear here.
    holders: HashMap<OutputKey, Holder>,
    /// FIFO wait queue per raw key.
    queues: HashMap<OutputKey, VecDeque<u64>>,
    /// Macro names that bypass the protocol.
    supremacy: HashSet<String>,
    next_ticket: u64,
}

impl TrafficState {
    /// Whether any crossing is held that did not come from `requester`.
    /// A sequence's own outstanding token (a hold-through key) must not
    /// gate its own next press, or the sequence would wait on itself.
    fn foreign_crossing_held(&self, requester: Option<&str>) -> bool {
        self.holders.values().any(|h| match (&h.owner, requester) {
            (Some(owner), Some(name)) => owner != name,
            _ => true,
        })
    }
}

pub struct TrafficController {
    state: Mutex<TrafficState>,
    oracle: Arc<TimingOracle>,
}

impl TrafficController {
    pub fn new(compiled: CompiledProfile, oracle: Arc<TimingOracle>) -> Self {
        TrafficController {
            state: Mutex::new(TrafficState {
                compiled,
                ..TrafficState::default()
            }),
            oracle,
        }
    }

    /// Replace the compiled partition on profile reload. Holders and
    /// queues drain under the old rules.
    pub fn set_compiled(&self, compiled: CompiledProfile) {
        self.lock().compiled = compiled;
    }

    /// Allow a macro (by name) to bypass crossings entirely.
    pub fn grant_supremacy(&self, macro_name: &str) {
        self.lock().supremacy.insert(macro_name.to_string());
    }

    pub fn revoke_supremacy(&self, macro_name: &str) {
        self.lock().supremacy.remove(macro_name);
    }

    /// Acquire the crossing for `key`'s raw base.
    ///
    /// Returns immediately when the macro holds supremacy or the base is
    /// not a conundrum key. Otherwise the caller joins the base's FIFO
    /// queue and sleeps on traffic-wait draws until it is both at the head
    /// of its queue and no crossing is held anywhere.
    pub async fn request_crossing(
        &self,
        key: QualifiedKey,
        macro_name: Option<&str>,
    ) -> Crossing {
        let raw = key.raw();
        let ticket = {
            let mut state = self.lock();
            if let Some(name) = macro_name {
                if state.supremacy.contains(name) {
                    return Crossing::waived();
                }
            }
            if !state.compiled.is_conundrum(raw) {
                return Crossing::waived();
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queues.entry(raw).or_default().push_back(ticket);
            ticket
        };

        loop {
            {
                let mut state = self.lock();
                let blocked = state.foreign_crossing_held(macro_name)
                    || state.holders.contains_key(&raw);
                let at_head = state
                    .queues
                    .get(&raw)
                    .and_then(|q| q.front())
                    .is_some_and(|t| *t == ticket);
                if !blocked && at_head {
                    state.holders.insert(
                        raw,
                        Holder {
                            ticket,
                            owner: macro_name.map(str::to_string),
                        },
                    );
                    trace!(key = %raw, ticket, "crossing acquired");
                    return Crossing {
                        held: Some((raw, ticket)),
                    };
                }
            }
            let wait = self.oracle.draw(DelayRange::TrafficWait);
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    /// Release a crossing after the key-up. Waived crossings are no-ops.
    pub fn release_crossing(&self, crossing: Crossing) {
        let Some((raw, ticket)) = crossing.held else {
            return;
        };
        let mut state = self.lock();
        if state.holders.get(&raw).map(|h| h.ticket) == Some(ticket) {
            state.holders.remove(&raw);
        }
        if let Some(queue) = state.queues.get_mut(&raw) {
            if queue.front() == Some(&ticket) {
                queue.pop_front();
            }
        }
        trace!(key = %raw, ticket, "crossing released");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrafficState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyweave_config::{
        compile_profile, parse_profile_str,
    };

    fn controller_for(profile_json: &str) -> Arc<TrafficController> {
        let profile = parse_profile_str(profile_json).unwrap();
        Arc::new(TrafficController::new(
            compile_profile(&profile),
            Arc::new(TimingOracle::new()),
        ))
    }

    /// R appears bare and shifted; W appears bare and alted. Q is safe.
    fn contended() -> Arc<TrafficController> {
        controller_for(
            r#"{
                "name": "t",
                "bindings": [
                    { "name": "a", "trigger": { "key": "1", "gesture": "single" },
                      "sequence": [ { "key": "R", "bufferTier": "low" },
                                    { "key": "ALT+W", "bufferTier": "low" },
                                    { "key": "Q", "bufferTier": "low" } ] },
                    { "name": "b", "trigger": { "key": "2", "gesture": "single" },
                      "sequence": [ { "key": "SHIFT+R", "bufferTier": "low" },
                                    { "key": "W", "bufferTier": "low" } ] }
                ]
            }"#,
        )
    }

    #[tokio::test]
    async fn safe_keys_pass_straight_through() {
        let traffic = contended();
        let crossing = traffic
            .request_crossing(QualifiedKey::parse("Q").unwrap(), None)
            .await;
        assert!(!crossing.is_held());
        traffic.release_crossing(crossing);
    }

    #[tokio::test]
    async fn conundrum_key_takes_a_token() {
        let traffic = contended();
        let crossing = traffic
            .request_crossing(QualifiedKey::parse("SHIFT+R").unwrap(), None)
            .await;
        assert!(crossing.is_held());
        traffic.release_crossing(crossing);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_contenders_are_fifo() {
        let traffic = contended();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let traffic = Arc::clone(&traffic);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let c = traffic
                    .request_crossing(QualifiedKey::parse("R").unwrap(), Some("a"))
                    .await;
                order.lock().unwrap().push("first");
                tokio::time::sleep(Duration::from_millis(60)).await;
                traffic.release_crossing(c);
            })
        };
        // Let the first contender enqueue before the second arrives.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let traffic = Arc::clone(&traffic);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let c = traffic
                    .request_crossing(QualifiedKey::parse("SHIFT+R").unwrap(), Some("b"))
                    .await;
                order.lock().unwrap().push("second");
                traffic.release_crossing(c);
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spans_distinct_conundrum_keys() {
        let traffic = contended();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Holder of R blocks a requester of W even though the raw keys
        // differ: the gate is global across conundrum keys.
        let r_holder = {
            let traffic = Arc::clone(&traffic);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let c = traffic
                    .request_crossing(QualifiedKey::parse("R").unwrap(), None)
                    .await;
                order.lock().unwrap().push("r-acquired");
                tokio::time::sleep(Duration::from_millis(80)).await;
                order.lock().unwrap().push("r-released");
                traffic.release_crossing(c);
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let w_contender = {
            let traffic = Arc::clone(&traffic);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let c = traffic
                    .request_crossing(QualifiedKey::parse("W").unwrap(), None)
                    .await;
                order.lock().unwrap().push("w-acquired");
                traffic.release_crossing(c);
            })
        };

        r_holder.await.unwrap();
        w_contender.await.unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["r-acquired", "r-released", "w-acquired"]
        );
    }

    #[tokio::test]
    async fn supremacy_bypasses_everything() {
        let traffic = contended();
        traffic.grant_supremacy("vip");

        // Park a holder on R, then show the vip macro sails through.
        let blocker = traffic
            .request_crossing(QualifiedKey::parse("R").unwrap(), None)
            .await;
        let crossing = traffic
            .request_crossing(QualifiedKey::parse("SHIFT+R").unwrap(), Some("vip"))
            .await;
        assert!(!crossing.is_held());
        traffic.release_crossing(crossing);
        traffic.release_crossing(blocker);

        traffic.revoke_supremacy("vip");
        let blocker = traffic
            .request_crossing(QualifiedKey::parse("R").unwrap(), Some("vip"))
            .await;
        assert!(blocker.is_held());
        traffic.release_crossing(blocker);
    }

    #[tokio::test]
    async fn release_then_reacquire() {
        let traffic = contended();
        for _ in 0..3 {
            let c = traffic
                .request_crossing(QualifiedKey::parse("R").unwrap(), None)
                .await;
            assert!(c.is_held());
            traffic.release_crossing(c);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn own_outstanding_token_does_not_gate_the_next_press() {
        // Macro "a" still holds R (a hold-through key) while it requests W.
        // It must not wait on its own token; a foreign requester must.
        let traffic = contended();
        let r_token = traffic
            .request_crossing(QualifiedKey::parse("R").unwrap(), Some("a"))
            .await;
        assert!(r_token.is_held());

        let w_token = traffic
            .request_crossing(QualifiedKey::parse("W").unwrap(), Some("a"))
            .await;
        assert!(w_token.is_held());
        traffic.release_crossing(w_token);

        // A different macro is still gated by a's outstanding R token.
        let foreign = {
            let traffic = Arc::clone(&traffic);
            tokio::spawn(async move {
                let c = traffic
                    .request_crossing(QualifiedKey::parse("W").unwrap(), Some("b"))
                    .await;
                traffic.release_crossing(c);
            })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!foreign.is_finished());

        traffic.release_crossing(r_token);
        foreign.await.unwrap();
    }

    #[tokio::test]
    async fn degraded_profile_waives_all_crossings() {
        let traffic = Arc::new(TrafficController::new(
            CompiledProfile::all_safe(),
            Arc::new(TimingOracle::new()),
        ));
        let c = traffic
            .request_crossing(QualifiedKey::parse("SHIFT+R").unwrap(), None)
            .await;
        assert!(!c.is_held());
        traffic.release_crossing(c);
    }
}
