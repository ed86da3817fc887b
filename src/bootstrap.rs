// =============================================================================
// Strategy bootstrap — resolves a `strategyId` + JSON config into a Strategy
// =============================================================================
//
// The orchestrator's RunnerFactory needs to turn `StartRunnerRequest.config`
// into a concrete `Box<dyn Strategy>` without knowing about any particular
// strategy implementation. This is the one place that maps names to types;
// adding a new strategy means adding one arm here; the Runner and
// Orchestrator never change.
// =============================================================================

use serde_json::Value;

use crate::errors::EngineError;
use crate::strategy::{MomentumStrategy, RiskParams, Strategy};

fn field(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn field_usize(config: &Value, key: &str, default: usize) -> usize {
    config.get(key).and_then(Value::as_u64).map(|v| v as usize).unwrap_or(default)
}

pub fn build_strategy(strategy_id: &str, config: &Value) -> Result<Box<dyn Strategy>, EngineError> {
    match strategy_id {
        "momentum-ema-rsi" | "momentum" => {
            let risk_params = RiskParams {
                stop_loss_percent: field(config, "stop_loss_percent", 1.0),
                take_profit_percent: field(config, "take_profit_percent", 2.0),
                cooldown_minutes: field_usize(config, "cooldown_minutes", 5) as u32,
            };
            Ok(Box::new(MomentumStrategy::new(
                field_usize(config, "fast_period", 12),
                field_usize(config, "slow_period", 26),
                field_usize(config, "rsi_period", 14),
                risk_params,
            )))
        }
        other => Err(EngineError::InvalidParams { message: format!("unknown strategy id '{other}'") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn momentum_strategy_resolves_with_defaults() {
        let strategy = build_strategy("momentum-ema-rsi", &serde_json::json!({})).unwrap();
        assert_eq!(strategy.name(), "momentum-ema-rsi");
    }

    #[test]
    fn unknown_strategy_id_is_rejected() {
        let result = build_strategy("does-not-exist", &serde_json::json!({}));
        assert!(result.is_err());
    }
}
