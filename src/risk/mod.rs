// =============================================================================
// Risk (C4 + ambient guard) — pure sizing/bracket math plus circuit breakers
// =============================================================================

pub mod engine;
pub mod guard;

pub use engine::{size_position, BrokerRules, Bracket, RiskMode, SizingInput, SizingOutput};
pub use guard::{CircuitBreakerInfo, GuardState, RiskGuard};
