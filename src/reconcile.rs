// =============================================================================
// Reconciler & Orphan Sweeper (C7)
// =============================================================================
//
// Two cooperating checks run from the same periodic sweep (spec §4.7): the
// broker<->local-state reconciler (position/lifecycle drift) and the orphan
// order sweeper (dangling protective legs). Grounded on the teacher's
// `reconcile_once` free function taking its collaborators by reference
// rather than owning them, generalized from Binance-balance drift detection
// to broker-agnostic position/order reconciliation.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::config::ReconcileCfg;
use crate::errors::EngineError;
use crate::lifecycle::LifecycleManager;
use crate::types::{LifecycleState, Order, OrderType};

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub unknown_positions: Vec<String>,
    pub stale_state: bool,
    pub instrument_mismatch: bool,
    pub guard_violation: bool,
    pub orphans_cancelled: Vec<String>,
    pub orphans_failed: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileReport {
    fn empty() -> Self {
        Self {
            unknown_positions: Vec::new(),
            stale_state: false,
            instrument_mismatch: false,
            guard_violation: false,
            orphans_cancelled: Vec::new(),
            orphans_failed: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this pass took (or recommended) any action — used by the
    /// idempotence test property (spec §8: a second run with no external
    /// change yields no additional actions).
    pub fn is_clean(&self) -> bool {
        self.unknown_positions.is_empty()
            && !self.stale_state
            && !self.instrument_mismatch
            && !self.guard_violation
            && self.orphans_cancelled.is_empty()
            && self.orphans_failed.is_empty()
    }
}

pub struct Reconciler {
    broker: Arc<BrokerAdapter>,
    lifecycle: Arc<LifecycleManager>,
    #[allow(dead_code)]
    cfg: ReconcileCfg,
    /// Whether unknown positions / guard violations are auto-closed, or only
    /// reported (spec §4.7: "optional autoCloseUnknown policy").
    auto_close_unknown: bool,
}

impl Reconciler {
    pub fn new(broker: Arc<BrokerAdapter>, lifecycle: Arc<LifecycleManager>, cfg: ReconcileCfg, auto_close_unknown: bool) -> Self {
        Self { broker, lifecycle, cfg, auto_close_unknown }
    }

    /// Broker<->state reconciler + orphan sweeper, run once. Called at
    /// startup and then every `cfg.interval_secs` from the bootstrap loop.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::empty();

        let positions = self.broker.get_open_positions().await?;
        let orders = self.broker.get_open_orders(None).await?;
        let state = self.lifecycle.current();

        match (positions.len(), state.state) {
            (0, LifecycleState::PositionOpen) => {
                warn!("stale state: lifecycle reports POSITION_OPEN but broker shows no open position");
                report.stale_state = true;
                // Drive the normal closed path rather than a silent jump, so
                // observers (journal, notification bridge) see the same
                // transition sequence as a managed exit, with unknown reason.
                let _ = self.lifecycle.closing();
                let _ = self.lifecycle.closed();
            }
            (n, LifecycleState::Idle) | (n, LifecycleState::Analyzing) if n > 0 => {
                let names: Vec<String> = positions.iter().map(|p| p.instrument.clone()).collect();
                warn!(?names, "unknown position(s): open on broker but lifecycle is not managing one");
                report.unknown_positions = names;
                if self.auto_close_unknown {
                    for position in &positions {
                        if let Err(err) = self.broker.close_position(&position.instrument).await {
                            warn!(instrument = %position.instrument, error = %err, "failed to auto-close unknown position");
                        }
                    }
                }
            }
            (1, LifecycleState::PositionOpen) => {
                if let (Some(managed), Some(actual)) = (&state.instrument, positions.first()) {
                    if managed != &actual.instrument {
                        warn!(managed, actual = %actual.instrument, "position instrument mismatch, not auto-acting");
                        report.instrument_mismatch = true;
                    }
                }
            }
            _ => {}
        }

        if positions.len() > 1 {
            warn!(count = positions.len(), "single-position guard violated");
            report.guard_violation = true;
            if self.auto_close_unknown {
                for position in positions.iter().skip(1) {
                    if let Err(err) = self.broker.close_position(&position.instrument).await {
                        warn!(instrument = %position.instrument, error = %err, "failed to close excess position");
                    }
                }
            }
        }

        let has_position_for = |instrument: &str| positions.iter().any(|p| p.instrument == instrument);
        for order in &orders {
            if is_oco_participating(order, &orders) || has_position_for(&order.instrument) {
                continue;
            }
            if is_orphan(order, &has_position_for(&order.instrument)) {
                match self.broker.cancel_order(&order.order_id).await {
                    Ok(()) => {
                        info!(order_id = %order.order_id, "cancelled orphan order");
                        report.orphans_cancelled.push(order.order_id.clone());
                    }
                    Err(err) => {
                        warn!(order_id = %order.order_id, error = %err, "failed to cancel orphan order");
                        report.orphans_failed.push(order.order_id.clone());
                    }
                }
            }
        }

        Ok(report)
    }

    /// Idempotent stop-loss repair: re-place a reduce-only stop-market order
    /// at `stop_price` for `instrument` unless one already exists.
    pub async fn repair_stop_loss(&self, instrument: &str, side_to_close: crate::types::Side, amount: f64, stop_price: f64) -> Result<String, EngineError> {
        let orders = self.broker.get_open_orders(Some(instrument)).await?;
        if let Some(existing) = orders.iter().find(|o| o.instrument == instrument && o.reduce_only && o.order_type == OrderType::StopMarket) {
            return Ok(existing.order_id.clone());
        }

        let instrument_info = self.broker.get_instrument(instrument).await?;
        let rounded_stop = instrument_info.round_to_tick(stop_price);
        let placed = self
            .broker
            .place_order(crate::broker::OrderParams {
                instrument: instrument.to_string(),
                side: side_to_close,
                order_type: OrderType::StopMarket,
                amount,
                price: None,
                trigger_price: Some(rounded_stop),
                reduce_only: true,
                label: Some(format!("repair-sl-{instrument}")),
                otoco_config: None,
            })
            .await?;
        info!(instrument, order_id = %placed.order.order_id, "repaired missing stop-loss");
        Ok(placed.order.order_id)
    }
}

/// An order participates in a bracket if its label names a sibling (by
/// shared `entry-<txid>` prefix) still present among open orders.
fn is_oco_participating(order: &Order, open_orders: &[Order]) -> bool {
    let Some(label) = &order.label else { return false };
    let Some(prefix) = bracket_prefix(label) else { return false };
    open_orders.iter().any(|other| {
        other.order_id != order.order_id
            && other.label.as_deref().and_then(bracket_prefix).as_deref() == Some(prefix.as_str())
    })
}

fn bracket_prefix(label: &str) -> Option<String> {
    if let Some(stripped) = label.strip_suffix("_sl").or_else(|| label.strip_suffix("_tp")) {
        Some(stripped.to_string())
    } else if label.starts_with("entry-") {
        Some(label.to_string())
    } else {
        None
    }
}

/// Orphan per spec §4.7 step 3: reduce-only with no position, or a
/// label naming an SL/TP leg with no position backing it.
fn is_orphan(order: &Order, has_position: &bool) -> bool {
    if *has_position {
        return false;
    }
    let names_protective_leg = order
        .label
        .as_deref()
        .map(|l| l.ends_with("_sl") || l.ends_with("_tp"))
        .unwrap_or(false);
    order.reduce_only || names_protective_leg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderState, Side};

    fn order(id: &str, label: Option<&str>, reduce_only: bool) -> Order {
        Order {
            order_id: id.to_string(),
            instrument: "BTC-PERP".to_string(),
            side: Side::Sell,
            order_type: OrderType::StopMarket,
            amount: 1.0,
            price: None,
            trigger_price: Some(100.0),
            filled: 0.0,
            state: OrderState::Open,
            created_at: Utc::now(),
            label: label.map(|s| s.to_string()),
            reduce_only,
            oco_ref: None,
        }
    }

    #[test]
    fn orphan_with_no_sibling_and_no_position_is_cancelled() {
        let o = order("1", Some("entry-abc_sl"), true);
        let open = vec![o.clone()];
        assert!(!is_oco_participating(&o, &open));
        assert!(is_orphan(&o, &false));
    }

    #[test]
    fn sibling_still_open_preserves_the_leg() {
        let sl = order("1", Some("entry-abc_sl"), true);
        let tp = order("2", Some("entry-abc_tp"), true);
        let open = vec![sl.clone(), tp.clone()];
        assert!(is_oco_participating(&sl, &open));
        assert!(is_oco_participating(&tp, &open));
    }

    #[test]
    fn report_is_clean_when_nothing_happened() {
        let report = ReconcileReport::empty();
        assert!(report.is_clean());
    }
}
