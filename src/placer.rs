// =============================================================================
// Bracket Placer (C6) — atomic OTOCO placement with rollback fallback
// =============================================================================
//
// Preferred path is a single native-OTOCO RPC, which the exchange is assumed
// to place atomically. When that is rejected (exchange doesn't support it,
// or the attempt itself fails before any leg exists) the fallback places
// entry -> stop -> take-profit sequentially and rolls back in reverse order
// on any failure, exactly as spec §4.5 describes. The whole operation is
// wrapped in the 5 s overall timeout; a timeout rolls back whatever was
// placed so far, mirroring the teacher's `ExecutionEngine` composing a small
// set of Arc'd collaborators behind one logging-wrapped entry point.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, OrderParams, OtocoChild};
use crate::errors::{EngineError, OrphanDetected};
use crate::types::{OrderType, Side};

const OVERALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BracketRequest {
    pub instrument: String,
    pub side: Side,
    pub entry_type: OrderType,
    pub amount: f64,
    /// Required for limit entries, ignored for market entries.
    pub entry_price: Option<f64>,
    pub stop_trigger_price: f64,
    pub take_profit_price: f64,
}

#[derive(Debug, Clone)]
pub struct BracketResult {
    pub transaction_id: String,
    pub entry_order_id: String,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
}

/// Callback invoked with a warning-level orphan event when rollback itself
/// cannot clean up every leg (spec §4.5/§7). The placer never swallows this
/// — it is the caller's job to route it to the reconciler/operator channel.
pub type OrphanSink = Arc<dyn Fn(OrphanDetected) + Send + Sync>;

pub struct BracketPlacer {
    broker: Arc<BrokerAdapter>,
    on_orphan: OrphanSink,
}

impl BracketPlacer {
    pub fn new(broker: Arc<BrokerAdapter>, on_orphan: OrphanSink) -> Self {
        Self { broker, on_orphan }
    }

    #[instrument(skip(self, req), name = "placer.place_bracket")]
    pub async fn place_bracket(&self, req: BracketRequest) -> Result<BracketResult, EngineError> {
        let transaction_id = Uuid::new_v4().to_string();
        let placed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let attempt = self.attempt(req, transaction_id.clone(), placed.clone());
        match tokio::time::timeout(OVERALL_TIMEOUT, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(transaction_id = %transaction_id, "bracket placement exceeded overall timeout, rolling back");
                let ids = placed.lock().clone();
                self.rollback(&transaction_id, &ids).await;
                Err(EngineError::Timeout { elapsed_ms: OVERALL_TIMEOUT.as_millis() as u64 })
            }
        }
    }

    async fn attempt(
        &self,
        req: BracketRequest,
        transaction_id: String,
        placed: Arc<Mutex<Vec<String>>>,
    ) -> Result<BracketResult, EngineError> {
        match self.try_native_otoco(&req, &transaction_id).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                info!(transaction_id = %transaction_id, error = %err, "native OTOCO unavailable, falling back to sequential placement");
            }
        }

        self.place_sequential(&req, &transaction_id, &placed).await
    }

    async fn try_native_otoco(&self, req: &BracketRequest, transaction_id: &str) -> Result<BracketResult, EngineError> {
        let entry_label = format!("entry-{transaction_id}");
        let sl_label = format!("{entry_label}_sl");
        let tp_label = format!("{entry_label}_tp");

        let params = OrderParams {
            instrument: req.instrument.clone(),
            side: req.side,
            order_type: req.entry_type,
            amount: req.amount,
            price: req.entry_price,
            trigger_price: None,
            reduce_only: false,
            label: Some(entry_label),
            linked_order_type: Some("one_triggers_one_cancels_other".to_string()),
            trigger_fill_condition: Some("first_hit".to_string()),
            otoco_config: Some(vec![
                OtocoChild {
                    order_type: OrderType::StopMarket,
                    trigger_price: Some(req.stop_trigger_price),
                    price: None,
                    reduce_only: true,
                    label: sl_label,
                },
                OtocoChild {
                    order_type: OrderType::TakeLimit,
                    trigger_price: None,
                    price: Some(req.take_profit_price),
                    reduce_only: true,
                    label: tp_label,
                },
            ]),
        };

        let placed = self.broker.place_order(params).await?;
        let sl_id = placed.child_orders.iter().find(|o| o.label.as_deref().map(|l| l.ends_with("_sl")).unwrap_or(false)).map(|o| o.order_id.clone());
        let tp_id = placed.child_orders.iter().find(|o| o.label.as_deref().map(|l| l.ends_with("_tp")).unwrap_or(false)).map(|o| o.order_id.clone());

        Ok(BracketResult {
            transaction_id: transaction_id.to_string(),
            entry_order_id: placed.order.order_id,
            sl_order_id: sl_id,
            tp_order_id: tp_id,
        })
    }

    async fn place_sequential(
        &self,
        req: &BracketRequest,
        transaction_id: &str,
        placed: &Arc<Mutex<Vec<String>>>,
    ) -> Result<BracketResult, EngineError> {
        let entry_label = format!("entry-{transaction_id}");

        let entry = self
            .broker
            .place_order(OrderParams {
                instrument: req.instrument.clone(),
                side: req.side,
                order_type: req.entry_type,
                amount: req.amount,
                price: req.entry_price,
                trigger_price: None,
                reduce_only: false,
                label: Some(entry_label.clone()),
                linked_order_type: None,
                trigger_fill_condition: None,
                otoco_config: None,
            })
            .await?;
        placed.lock().push(entry.order.order_id.clone());

        let sl_side = req.side.opposite();
        let sl = match self
            .broker
            .place_order(OrderParams {
                instrument: req.instrument.clone(),
                side: sl_side,
                order_type: OrderType::StopMarket,
                amount: req.amount,
                price: None,
                trigger_price: Some(req.stop_trigger_price),
                reduce_only: true,
                label: Some(format!("{entry_label}_sl")),
                linked_order_type: None,
                trigger_fill_condition: None,
                otoco_config: None,
            })
            .await
        {
            Ok(order) => order,
            Err(err) => {
                let ids = placed.lock().clone();
                self.rollback(transaction_id, &ids).await;
                return Err(err);
            }
        };
        placed.lock().push(sl.order.order_id.clone());

        let tp = match self
            .broker
            .place_order(OrderParams {
                instrument: req.instrument.clone(),
                side: sl_side,
                order_type: OrderType::TakeLimit,
                amount: req.amount,
                price: Some(req.take_profit_price),
                trigger_price: None,
                reduce_only: true,
                label: Some(format!("{entry_label}_tp")),
                linked_order_type: None,
                trigger_fill_condition: None,
                otoco_config: None,
            })
            .await
        {
            Ok(order) => order,
            Err(err) => {
                let ids = placed.lock().clone();
                self.rollback(transaction_id, &ids).await;
                return Err(err);
            }
        };
        placed.lock().push(tp.order.order_id.clone());

        Ok(BracketResult {
            transaction_id: transaction_id.to_string(),
            entry_order_id: entry.order.order_id,
            sl_order_id: Some(sl.order.order_id),
            tp_order_id: Some(tp.order.order_id),
        })
    }

    /// Cancel placed legs in reverse order. Any cancellation failure is
    /// collected and surfaced as an `ORPHAN_DETECTED` warning event rather
    /// than silently dropped (spec §4.5 step 2).
    async fn rollback(&self, transaction_id: &str, placed_ids: &[String]) {
        let mut uncancelled = Vec::new();
        for order_id in placed_ids.iter().rev() {
            if let Err(err) = self.broker.cancel_order(order_id).await {
                warn!(order_id, error = %err, "failed to cancel leg during bracket rollback");
                uncancelled.push(order_id.clone());
            }
        }
        if !uncancelled.is_empty() {
            (self.on_orphan)(OrphanDetected {
                transaction_id: transaction_id.to_string(),
                uncancelled_order_ids: uncancelled,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_grammar_matches_spec() {
        let tx = "abc123";
        let entry = format!("entry-{tx}");
        assert_eq!(format!("{entry}_sl"), "entry-abc123_sl");
        assert_eq!(format!("{entry}_tp"), "entry-abc123_tp");
    }
}
