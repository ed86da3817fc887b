// =============================================================================
// Order Validator (C5) — pre-flight checks before any entry is placed
// =============================================================================
//
// Every check here is read-only: it resolves cached/fetched state and either
// returns a validated, lot/tick-rounded order shape or an `EngineError`. No
// orders are placed by this module — that is the Bracket Placer's job.
// =============================================================================

use std::sync::Arc;

use tracing::instrument;

use crate::broker::BrokerAdapter;
use crate::errors::EngineError;
use crate::lifecycle::LifecycleManager;
use crate::types::{Instrument, OrderType};

/// Hard leverage ceiling independent of any account/instrument override
/// (spec §4.5: reject above this regardless of configured risk limits).
const HARD_LEVERAGE_CAP: f64 = 50.0;
/// Leverage above this is accepted but flagged.
const WARN_LEVERAGE_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct ValidatedEntry {
    pub instrument: Instrument,
    pub amount: f64,
    pub price: Option<f64>,
    pub required_margin: f64,
    pub leverage: f64,
    pub warnings: Vec<String>,
}

pub struct OrderValidator {
    broker: Arc<BrokerAdapter>,
    lifecycle: Arc<LifecycleManager>,
}

impl OrderValidator {
    pub fn new(broker: Arc<BrokerAdapter>, lifecycle: Arc<LifecycleManager>) -> Self {
        Self { broker, lifecycle }
    }

    /// Validate a prospective entry order. `reference_price` is the current
    /// market price, used for notional/margin estimation regardless of
    /// whether the order itself is a market or limit order.
    #[instrument(skip(self), name = "validator.validate_entry")]
    pub async fn validate_entry(
        &self,
        instrument_name: &str,
        order_type: OrderType,
        amount: f64,
        price: Option<f64>,
        reference_price: f64,
        available_funds: f64,
    ) -> Result<ValidatedEntry, EngineError> {
        let instrument = self.broker.get_instrument(instrument_name).await?;

        let rounded_amount = instrument.round_to_lot(amount);
        if rounded_amount < instrument.min_trade_amount {
            return Err(EngineError::AmountTooSmall {
                amount: rounded_amount,
                minimum: instrument.min_trade_amount,
            });
        }

        let mut warnings = Vec::new();
        if (rounded_amount - amount).abs() > f64::EPSILON {
            warnings.push(format!("amount rounded from {amount} to {rounded_amount} (lot {})", instrument.min_trade_amount));
        }

        let rounded_price = match (order_type, price) {
            (OrderType::Limit | OrderType::StopLimit, Some(p)) => {
                let rounded = instrument.round_to_tick(p);
                if (rounded - p).abs() > f64::EPSILON {
                    warnings.push(format!("price rounded from {p} to {rounded} (tick {})", instrument.tick_size));
                }
                Some(rounded)
            }
            (OrderType::Limit | OrderType::StopLimit, None) => {
                return Err(EngineError::InvalidParams { message: "limit order requires a price".to_string() })
            }
            _ => None,
        };

        let notional = rounded_amount * reference_price;
        let required_margin = notional / instrument.max_leverage;
        if available_funds < required_margin {
            return Err(EngineError::InsufficientMargin { required: required_margin, available: available_funds });
        }

        let leverage = if available_funds > 0.0 { notional / available_funds } else { f64::INFINITY };
        if leverage > HARD_LEVERAGE_CAP {
            return Err(EngineError::LeverageExceeded { calculated: leverage, max: HARD_LEVERAGE_CAP });
        }
        if leverage > WARN_LEVERAGE_THRESHOLD {
            warnings.push(format!("leverage {leverage:.2}x exceeds {WARN_LEVERAGE_THRESHOLD}x"));
        }

        if !self.lifecycle.can_open_position() {
            return Err(EngineError::PositionAlreadyExists { instrument: instrument_name.to_string() });
        }
        if self.broker.has_open_position(Some(instrument_name)).await? {
            return Err(EngineError::PositionAlreadyExists { instrument: instrument_name.to_string() });
        }

        Ok(ValidatedEntry {
            instrument,
            amount: rounded_amount,
            price: rounded_price,
            required_margin,
            leverage,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_cap_and_warn_threshold_are_sane() {
        assert!(WARN_LEVERAGE_THRESHOLD < HARD_LEVERAGE_CAP);
    }
}
