// =============================================================================
// Strategy Lifecycle Manager (C8) — state machine, single-strategy guard
// =============================================================================
//
// One instance per account, built once at bootstrap and passed by `Arc`
// reference (spec §9's "explicit owner" redesign of the source's
// singleton-with-lazy-init pattern). Transitions are serialized by an
// internal `parking_lot::Mutex` so concurrent `start()` calls collapse to
// exactly one winner, and persisted to a `KeyValueStore` after every
// transition so a restart resumes from the last known state rather than
// silently reverting to IDLE.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::persistence::{KeyValueStore, KeyValueStoreExt};
use crate::types::{LifecycleState, Side, StrategyState};

/// Key under which the current `StrategyState` is persisted (spec §6).
pub const STRATEGY_STATE_KEY: &str = "strategy-state";

/// Events that drive the lifecycle state machine (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Signal,
    Stop,
    Entering,
    Abandon,
    Opened,
    EntryFailed,
    Closing,
    Closed,
    ReconcileReset,
}

/// Static transition table. Returns `None` for any `(state, event)` pair not
/// explicitly named in spec §4.6 — the caller turns that into
/// `InvalidStateTransitionError`.
fn next_state(from: LifecycleState, event: Event) -> Option<LifecycleState> {
    use Event::*;
    use LifecycleState::*;
    match (from, event) {
        (_, ReconcileReset) => Some(Idle),
        (Idle, Start) => Some(Analyzing),
        (Analyzing, Signal) => Some(SignalDetected),
        (Analyzing, Stop) => Some(Idle),
        (SignalDetected, Entering) => Some(EnteringPosition),
        (SignalDetected, Abandon) => Some(Analyzing),
        (EnteringPosition, Opened) => Some(PositionOpen),
        (EnteringPosition, EntryFailed) => Some(Analyzing),
        (PositionOpen, Closing) => Some(Closing),
        (Closing, Closed) => Some(Analyzing),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub state: StrategyState,
}

pub type Observer = Arc<dyn Fn(&StateChange) + Send + Sync>;

pub struct LifecycleManager {
    state: Mutex<StrategyState>,
    store: Arc<dyn KeyValueStore>,
    observers: Mutex<Vec<Observer>>,
}

impl LifecycleManager {
    /// Load the last persisted state (default `IDLE` if missing/corrupt, per
    /// spec §4.6 persistence rule).
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let state = store
            .get_json::<StrategyState>(STRATEGY_STATE_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        info!(state = %state.state, "lifecycle manager loaded persisted state");
        Self { state: Mutex::new(state), store, observers: Mutex::new(Vec::new()) }
    }

    pub fn on_state_change(&self, observer: Observer) {
        self.observers.lock().push(observer);
    }

    pub fn current(&self) -> StrategyState {
        self.state.lock().clone()
    }

    pub fn current_state(&self) -> LifecycleState {
        self.state.lock().state
    }

    pub fn can_start(&self) -> bool {
        self.current_state() == LifecycleState::Idle
    }

    pub fn can_open_position(&self) -> bool {
        matches!(self.current_state(), LifecycleState::Analyzing | LifecycleState::SignalDetected)
    }

    pub fn should_analyze(&self) -> bool {
        self.current_state() == LifecycleState::Analyzing
    }

    /// Begin running `strategy_name` on `instrument`. Enforces the
    /// single-strategy guard: fails with `SingleStrategyViolation` unless the
    /// current state is `IDLE`.
    pub fn start(&self, strategy_name: impl Into<String>, instrument: impl Into<String>) -> Result<(), EngineError> {
        let strategy_name = strategy_name.into();
        let mut guard = self.state.lock();
        if guard.state != LifecycleState::Idle {
            let active = guard.strategy_name.clone().unwrap_or_else(|| "unknown".to_string());
            return Err(EngineError::SingleStrategyViolation { active });
        }
        let from = guard.state;
        guard.state = LifecycleState::Analyzing;
        guard.strategy_name = Some(strategy_name);
        guard.instrument = Some(instrument.into());
        guard.started_at = Some(Utc::now());
        self.commit(from, guard)
    }

    pub fn signal(&self) -> Result<(), EngineError> {
        self.apply(Event::Signal)
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        self.apply(Event::Stop)
    }

    pub fn entering(&self) -> Result<(), EngineError> {
        self.apply(Event::Entering)
    }

    pub fn abandon(&self) -> Result<(), EngineError> {
        self.apply(Event::Abandon)
    }

    pub fn opened(&self, entry_price: f64, size: f64, side: Side) -> Result<(), EngineError> {
        let mut guard = self.state.lock();
        let from = guard.state;
        let to = next_state(from, Event::Opened)
            .ok_or_else(|| transition_error(from, Event::Opened))?;
        guard.state = to;
        guard.position_entry_price = Some(entry_price);
        guard.position_size = Some(size);
        guard.position_side = Some(side);
        self.commit(from, guard)
    }

    pub fn entry_failed(&self) -> Result<(), EngineError> {
        self.apply(Event::EntryFailed)
    }

    pub fn closing(&self) -> Result<(), EngineError> {
        self.apply(Event::Closing)
    }

    pub fn closed(&self) -> Result<(), EngineError> {
        let mut guard = self.state.lock();
        let from = guard.state;
        let to = next_state(from, Event::Closed).ok_or_else(|| transition_error(from, Event::Closed))?;
        guard.state = to;
        guard.position_entry_price = None;
        guard.position_size = None;
        guard.position_side = None;
        self.commit(from, guard)
    }

    /// Reconciler-only escape hatch: force back to IDLE regardless of the
    /// current state (spec §4.6: `(any) --reconcile_reset--> IDLE`).
    pub fn reconcile_reset(&self) -> Result<(), EngineError> {
        let mut guard = self.state.lock();
        let from = guard.state;
        *guard = StrategyState::default();
        self.commit(from, guard)
    }

    fn apply(&self, event: Event) -> Result<(), EngineError> {
        let mut guard = self.state.lock();
        let from = guard.state;
        let to = next_state(from, event).ok_or_else(|| transition_error(from, event))?;
        guard.state = to;
        self.commit(from, guard)
    }

    fn commit(&self, from: LifecycleState, guard: parking_lot::MutexGuard<'_, StrategyState>) -> Result<(), EngineError> {
        let state = guard.clone();
        let to = state.state;
        drop(guard);

        if let Err(err) = self.store.put_json(STRATEGY_STATE_KEY, &state) {
            warn!(error = %err, "failed to persist strategy state");
        }

        debug!(%from, %to, "lifecycle transition");
        let change = StateChange { from, to, state };
        for observer in self.observers.lock().iter() {
            observer(&change);
        }
        Ok(())
    }
}

fn transition_error(from: LifecycleState, event: Event) -> EngineError {
    EngineError::InvalidStateTransition { from: from.to_string(), event: format!("{event:?}") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryKeyValueStore;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Arc::new(MemoryKeyValueStore::default()))
    }

    #[test]
    fn fresh_manager_starts_idle() {
        let m = manager();
        assert_eq!(m.current_state(), LifecycleState::Idle);
        assert!(m.can_start());
    }

    #[test]
    fn full_happy_path_transition_sequence() {
        let m = manager();
        m.start("trend-follow", "BTC-PERP").unwrap();
        assert_eq!(m.current_state(), LifecycleState::Analyzing);
        m.signal().unwrap();
        assert_eq!(m.current_state(), LifecycleState::SignalDetected);
        m.entering().unwrap();
        assert_eq!(m.current_state(), LifecycleState::EnteringPosition);
        m.opened(50_000.0, 0.01, Side::Buy).unwrap();
        assert_eq!(m.current_state(), LifecycleState::PositionOpen);
        assert!(!m.can_open_position());
        m.closing().unwrap();
        m.closed().unwrap();
        assert_eq!(m.current_state(), LifecycleState::Analyzing);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let m = manager();
        let err = m.signal().unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn single_strategy_guard_rejects_second_start() {
        let m = manager();
        m.start("A", "BTC-PERP").unwrap();
        let err = m.start("B", "ETH-PERP").unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::SingleStrategyViolation);
        assert_eq!(m.current().strategy_name.unwrap(), "A");
    }

    #[test]
    fn reconcile_reset_forces_idle_from_any_state() {
        let m = manager();
        m.start("A", "BTC-PERP").unwrap();
        m.signal().unwrap();
        m.reconcile_reset().unwrap();
        assert_eq!(m.current_state(), LifecycleState::Idle);
    }

    #[test]
    fn state_persists_across_manager_instances() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::default());
        {
            let m = LifecycleManager::new(store.clone());
            m.start("A", "BTC-PERP").unwrap();
        }
        let reloaded = LifecycleManager::new(store);
        assert_eq!(reloaded.current_state(), LifecycleState::Analyzing);
        assert_eq!(reloaded.current().strategy_name.unwrap(), "A");
    }

    #[test]
    fn observers_see_every_transition_synchronously() {
        let m = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        m.on_state_change(Arc::new(move |change: &StateChange| {
            seen_clone.lock().push((change.from, change.to));
        }));
        m.start("A", "BTC-PERP").unwrap();
        m.signal().unwrap();
        let log = seen.lock();
        assert_eq!(log[0], (LifecycleState::Idle, LifecycleState::Analyzing));
        assert_eq!(log[1], (LifecycleState::Analyzing, LifecycleState::SignalDetected));
    }
}
