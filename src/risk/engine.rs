// =============================================================================
// Risk Engine (C4) — pure position sizing + bracket builder
// =============================================================================
//
// Stateless and side-effect-free: every input arrives in the call, every
// output is a plain value. No broker, no clock, no lock — grounded on the
// teacher's preference for small pure-function modules (see `indicators/*`)
// rather than folding math into a stateful service.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::{ContractType, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    Percent,
    Fixed,
}

/// Broker-side constraints the sizing algorithm must respect.
#[derive(Debug, Clone, Copy)]
pub struct BrokerRules {
    pub max_leverage: f64,
    pub tick_size: f64,
    pub lot: f64,
    pub contract_size: f64,
    pub contract_type: ContractType,
}

#[derive(Debug, Clone)]
pub struct SizingInput {
    pub equity: f64,
    pub risk_mode: RiskMode,
    pub risk_value: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub broker_rules: BrokerRules,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizingOutput {
    pub quantity: f64,
    pub notional: f64,
    pub effective_leverage: f64,
    pub risk_amount_usd: f64,
    pub warnings: Vec<String>,
}

/// Leverage beyond this generates a warning but is still accepted (spec §4.4
/// step 7); beyond the Validator's hard cap (spec §4.5, 50x) it is rejected
/// upstream, not here.
const WARN_LEVERAGE_THRESHOLD: f64 = 10.0;

/// Pure position-sizing algorithm (spec §4.4). Assumes a linear contract;
/// inverse contracts use a different notional formula and are rejected here
/// rather than silently mis-sized (spec §9 open question).
pub fn size_position(input: &SizingInput) -> Result<SizingOutput, EngineError> {
    if input.broker_rules.contract_type != ContractType::Linear {
        return Err(EngineError::InvalidParams {
            message: "risk engine only supports linear contracts".to_string(),
        });
    }

    let risk_amount = match input.risk_mode {
        RiskMode::Percent => input.equity * input.risk_value / 100.0,
        RiskMode::Fixed => input.risk_value,
    };

    let stop_distance = (input.entry_price - input.stop_price).abs();
    if stop_distance == 0.0 {
        return Err(EngineError::InvalidParams {
            message: "stop price must differ from entry price".to_string(),
        });
    }

    let raw_quantity = risk_amount / stop_distance;

    let lot = input.broker_rules.lot;
    let mut quantity = if lot > 0.0 { (raw_quantity / lot).floor() * lot } else { raw_quantity };

    if quantity < lot {
        return Err(EngineError::AmountTooSmall { amount: quantity, minimum: lot });
    }

    let mut notional = quantity * input.entry_price;
    let mut effective_leverage = if input.equity > 0.0 { notional / input.equity } else { f64::INFINITY };

    let mut warnings = Vec::new();

    if effective_leverage > input.broker_rules.max_leverage {
        // Scale quantity down to the max-leverage bound, then re-round to lot.
        let max_notional = input.broker_rules.max_leverage * input.equity;
        let bounded_quantity = max_notional / input.entry_price;
        quantity = if lot > 0.0 { (bounded_quantity / lot).floor() * lot } else { bounded_quantity };

        if quantity < lot {
            return Err(EngineError::AmountTooSmall { amount: quantity, minimum: lot });
        }

        notional = quantity * input.entry_price;
        effective_leverage = if input.equity > 0.0 { notional / input.equity } else { f64::INFINITY };
        warnings.push(format!(
            "quantity scaled down to respect max leverage {}x",
            input.broker_rules.max_leverage
        ));
    }

    if effective_leverage > WARN_LEVERAGE_THRESHOLD {
        warnings.push(format!("effective leverage {effective_leverage:.2}x exceeds {WARN_LEVERAGE_THRESHOLD}x"));
    }

    Ok(SizingOutput { quantity, notional, effective_leverage, risk_amount_usd: risk_amount, warnings })
}

#[derive(Debug, Clone, Serialize)]
pub struct Bracket {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Given `(side, entry, stop, rrRatio, tickSize)`, compute a stop-loss /
/// take-profit pair with the TP distance scaled by the reward:risk ratio,
/// each rounded to the instrument's tick (spec §4.4 bracket builder).
pub fn build_bracket(side: Side, entry: f64, stop: f64, rr_ratio: f64, tick_size: f64) -> Bracket {
    let stop_distance = (entry - stop).abs();
    let tp_distance = rr_ratio * stop_distance;

    let (stop_loss, take_profit) = match side {
        Side::Buy => (entry - stop_distance, entry + tp_distance),
        Side::Sell => (entry + stop_distance, entry - tp_distance),
    };

    Bracket { stop_loss: round_to_tick(stop_loss, tick_size), take_profit: round_to_tick(take_profit, tick_size) }
}

fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> BrokerRules {
        BrokerRules { max_leverage: 50.0, tick_size: 0.5, lot: 0.001, contract_size: 1.0, contract_type: ContractType::Linear }
    }

    #[test]
    fn happy_path_long_entry_matches_risk_contract() {
        // spec §8 scenario 1
        let input = SizingInput {
            equity: 10_000.0,
            risk_mode: RiskMode::Percent,
            risk_value: 2.0,
            entry_price: 50_000.0,
            stop_price: 49_000.0,
            broker_rules: BrokerRules { lot: 0.001, ..rules() },
        };
        let out = size_position(&input).unwrap();
        let risked = out.quantity * (input.entry_price - input.stop_price).abs();
        assert!(risked <= 200.0 + 1e-6);
        assert!(out.effective_leverage <= 50.0);
        assert!(out.quantity >= 0.001);
    }

    #[test]
    fn zero_stop_distance_is_invalid_params() {
        let input = SizingInput {
            equity: 10_000.0,
            risk_mode: RiskMode::Percent,
            risk_value: 2.0,
            entry_price: 50_000.0,
            stop_price: 50_000.0,
            broker_rules: rules(),
        };
        let err = size_position(&input).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::InvalidParams);
    }

    #[test]
    fn leverage_beyond_cap_scales_quantity_down() {
        // spec §8 scenario 2 variant: force a breach, expect scaling not rejection
        // when scaled quantity still clears the lot minimum.
        let input = SizingInput {
            equity: 500.0,
            risk_mode: RiskMode::Fixed,
            risk_value: 10_000.0,
            entry_price: 50_000.0,
            stop_price: 49_000.0,
            broker_rules: BrokerRules { max_leverage: 50.0, lot: 0.001, ..rules() },
        };
        let out = size_position(&input).unwrap();
        assert!(out.effective_leverage <= 50.0 + 1e-6);
        assert!(out.warnings.iter().any(|w| w.contains("max leverage")));
    }

    #[test]
    fn quantity_below_lot_is_amount_too_small() {
        let input = SizingInput {
            equity: 10.0,
            risk_mode: RiskMode::Fixed,
            risk_value: 0.01,
            entry_price: 50_000.0,
            stop_price: 49_999.0,
            broker_rules: rules(),
        };
        let err = size_position(&input).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::AmountTooSmall);
    }

    #[test]
    fn inverse_contracts_are_rejected() {
        let input = SizingInput {
            equity: 10_000.0,
            risk_mode: RiskMode::Percent,
            risk_value: 2.0,
            entry_price: 50_000.0,
            stop_price: 49_000.0,
            broker_rules: BrokerRules { contract_type: ContractType::Inverse, ..rules() },
        };
        let err = size_position(&input).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::InvalidParams);
    }

    #[test]
    fn bracket_builder_rounds_to_tick_and_respects_side() {
        let b = build_bracket(Side::Buy, 50_000.0, 49_000.0, 2.0, 0.5);
        assert_eq!(b.stop_loss, 49_000.0);
        assert_eq!(b.take_profit, 52_000.0);

        let b = build_bracket(Side::Sell, 50_000.0, 51_000.0, 1.5, 0.5);
        assert_eq!(b.stop_loss, 51_000.0);
        assert_eq!(b.take_profit, 48_500.0);
    }
}
