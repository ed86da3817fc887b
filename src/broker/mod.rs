// =============================================================================
// Broker Adapter (C3) — domain-typed operations over the RPC Session
// =============================================================================
//
// Everything above this layer talks in `Instrument`/`Order`/`Position`, never
// in raw `serde_json::Value`. The instrument cache is read-mostly: a miss
// takes a short write lock to populate, every other reader only ever takes
// the read path, mirroring the teacher's `CandleBuffer` read/write split.
// =============================================================================

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::config::RunnerCfg;
use crate::errors::EngineError;
use crate::market_data::Candle;
use crate::rpc::RpcSession;
use crate::types::{AccountSummary, Instrument, Order, OrderType, Position, Side};

/// Parameters for a single order leg. `otoco_config` carries the child SL/TP
/// legs for a native bracket placement (spec §4.3/§4.5).
#[derive(Debug, Clone, Serialize)]
pub struct OrderParams {
    pub instrument: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// `"one_triggers_one_cancels_other"` when `otoco_config` is set (spec
    /// §4.3/§6); absent on plain single-leg orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_order_type: Option<String>,
    /// `"first_hit"` alongside `linked_order_type` — whichever of SL/TP
    /// fills first cancels the other (spec §4.3/§6).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_fill_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otoco_config: Option<Vec<OtocoChild>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtocoChild {
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ticker {
    pub instrument: String,
    pub last_price: f64,
    #[serde(default)]
    pub best_bid: Option<f64>,
    #[serde(default)]
    pub best_ask: Option<f64>,
}

/// Result of a bracket RPC: the entry order plus whatever child orders the
/// broker created (native OTOCO responses carry both legs inline).
#[derive(Debug, Clone, Deserialize)]
pub struct PlacedOrder {
    pub order: Order,
    #[serde(default)]
    pub child_orders: Vec<Order>,
}

struct CachedInstrument {
    instrument: Instrument,
    fetched_at: Instant,
}

/// Typed surface over a single broker session. Single-writer per user/env —
/// the owning Strategy Runner holds the only handle that mutates state.
pub struct BrokerAdapter {
    session: std::sync::Arc<RpcSession>,
    instrument_cache: DashMap<String, CachedInstrument>,
    instrument_cache_ttl: Duration,
}

impl BrokerAdapter {
    pub fn new(session: std::sync::Arc<RpcSession>, cfg: &RunnerCfg) -> Self {
        Self {
            session,
            instrument_cache: DashMap::new(),
            instrument_cache_ttl: Duration::from_secs(cfg.instrument_cache_ttl_secs),
        }
    }

    /// Clear the instrument cache, e.g. on environment switch (spec §4.3).
    pub fn clear_instrument_cache(&self) {
        self.instrument_cache.clear();
    }

    #[instrument(skip(self), name = "broker.get_balance")]
    pub async fn get_balance(&self, currency: &str) -> Result<AccountSummary, EngineError> {
        let result = self
            .session
            .call_rpc("private/get_account_summary", json!({ "currency": currency }))
            .await?;
        parse(&result)
    }

    #[instrument(skip(self), name = "broker.get_instrument")]
    pub async fn get_instrument(&self, name: &str) -> Result<Instrument, EngineError> {
        if let Some(entry) = self.instrument_cache.get(name) {
            if entry.fetched_at.elapsed() < self.instrument_cache_ttl {
                return Ok(entry.instrument.clone());
            }
        }

        let result = self
            .session
            .call_rpc("public/get_instruments", json!({ "instrument_name": name }))
            .await?;
        let instrument: Instrument = parse(&result)?;

        self.instrument_cache.insert(
            name.to_string(),
            CachedInstrument { instrument: instrument.clone(), fetched_at: Instant::now() },
        );
        debug!(instrument = name, "instrument cache populated");
        Ok(instrument)
    }

    #[instrument(skip(self), name = "broker.get_ticker")]
    pub async fn get_ticker(&self, name: &str) -> Result<Ticker, EngineError> {
        let result = self
            .session
            .call_rpc("public/ticker", json!({ "instrument_name": name }))
            .await?;
        parse(&result)
    }

    /// Warmup history fetch (spec §4.8 step 1). `count` closed bars, most
    /// recent last.
    #[instrument(skip(self), name = "broker.get_candles")]
    pub async fn get_candles(&self, instrument: &str, resolution: &str, count: usize) -> Result<Vec<Candle>, EngineError> {
        let result = self
            .session
            .call_rpc(
                "public/get_tradingview_chart_data",
                json!({ "instrument_name": instrument, "resolution": resolution, "count": count }),
            )
            .await?;
        parse(&result)
    }

    #[instrument(skip(self, params), name = "broker.place_order")]
    pub async fn place_order(&self, params: OrderParams) -> Result<PlacedOrder, EngineError> {
        let method = match params.side {
            Side::Buy => "private/buy",
            Side::Sell => "private/sell",
        };
        let value = serde_json::to_value(&params)
            .map_err(|e| EngineError::Unknown { message: format!("failed to encode order params: {e}") })?;
        let result = self.session.call_rpc(method, value).await?;
        parse(&result)
    }

    #[instrument(skip(self), name = "broker.cancel_order")]
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError> {
        self.session.call_rpc("private/cancel", json!({ "order_id": order_id })).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker.cancel_all_by_instrument")]
    pub async fn cancel_all_by_instrument(&self, name: &str) -> Result<(), EngineError> {
        self.session
            .call_rpc("private/cancel_all_by_instrument", json!({ "instrument_name": name }))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "broker.get_open_orders")]
    pub async fn get_open_orders(&self, instrument: Option<&str>) -> Result<Vec<Order>, EngineError> {
        let params = match instrument {
            Some(name) => json!({ "instrument_name": name }),
            None => json!({}),
        };
        let result = self.session.call_rpc("private/get_open_orders_by_instrument", params).await?;
        parse(&result)
    }

    #[instrument(skip(self), name = "broker.get_open_positions")]
    pub async fn get_open_positions(&self) -> Result<Vec<Position>, EngineError> {
        let result = self.session.call_rpc("private/get_positions", json!({})).await?;
        let positions: Vec<Position> = parse(&result)?;
        // Per spec §4.3: only non-zero-size entries count as "open".
        Ok(positions.into_iter().filter(|p| !p.is_flat()).collect())
    }

    /// Single-position predicate (spec §3/§4.3). With `instrument = None`,
    /// checks for any open position on the account at all.
    #[instrument(skip(self), name = "broker.has_open_position")]
    pub async fn has_open_position(&self, instrument: Option<&str>) -> Result<bool, EngineError> {
        let positions = self.get_open_positions().await?;
        Ok(match instrument {
            Some(name) => positions.iter().any(|p| p.instrument == name),
            None => !positions.is_empty(),
        })
    }

    #[instrument(skip(self), name = "broker.close_position")]
    pub async fn close_position(&self, name: &str) -> Result<(), EngineError> {
        self.session.call_rpc("private/close_position", json!({ "instrument_name": name })).await?;
        Ok(())
    }

    /// Subscribe to the broker's tick feed for `instrument`. `on_tick` is
    /// invoked inline on the session's I/O task for every tick notification.
    pub fn subscribe_ticks(&self, instrument: &str, on_tick: impl Fn(f64) + Send + Sync + 'static) {
        let channel = format!("ticker.{instrument}");
        self.session.subscribe(vec![channel], move |value| {
            if let Some(price) = value.get("last_price").and_then(|v| v.as_f64()) {
                on_tick(price);
            }
        });
    }

    /// Subscribe to per-instrument order-state notifications (fills, cancels).
    pub fn subscribe_order_updates(&self, instrument: &str, on_update: impl Fn(Order) + Send + Sync + 'static) {
        let channel = format!("user.orders.{instrument}");
        self.session.subscribe(vec![channel], move |value| {
            if let Ok(order) = serde_json::from_value::<Order>(value) {
                on_update(order);
            }
        });
    }

    #[instrument(skip(self), name = "broker.get_user_trades")]
    pub async fn get_user_trades(&self, instrument: &str) -> Result<Vec<Value>, EngineError> {
        let result = self
            .session
            .call_rpc("private/get_user_trades_by_instrument", json!({ "instrument_name": instrument }))
            .await?;
        match result {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => {
                warn!(?other, "unexpected user-trades shape");
                Ok(Vec::new())
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, EngineError> {
    serde_json::from_value(value.clone())
        .map_err(|e| EngineError::Unknown { message: format!("failed to decode broker response: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_params_serialize_without_optional_fields() {
        let params = OrderParams {
            instrument: "BTC-PERP".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            amount: 10.0,
            price: None,
            trigger_price: None,
            reduce_only: false,
            label: None,
            linked_order_type: None,
            trigger_fill_condition: None,
            otoco_config: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("price").is_none());
        assert!(value.get("otoco_config").is_none());
        assert_eq!(value["amount"], 10.0);
    }

    #[test]
    fn otoco_children_carry_labels() {
        let child = OtocoChild {
            order_type: OrderType::StopMarket,
            trigger_price: Some(49000.0),
            price: None,
            reduce_only: true,
            label: "entry-abc_sl".into(),
        };
        let value = serde_json::to_value(&child).unwrap();
        assert_eq!(value["label"], "entry-abc_sl");
        assert_eq!(value["reduce_only"], true);
    }

    #[test]
    fn otoco_entry_carries_linked_order_wire_fields() {
        let params = OrderParams {
            instrument: "BTC-PERP".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            amount: 10.0,
            price: None,
            trigger_price: None,
            reduce_only: false,
            label: Some("entry-abc".into()),
            linked_order_type: Some("one_triggers_one_cancels_other".into()),
            trigger_fill_condition: Some("first_hit".into()),
            otoco_config: Some(vec![]),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["linked_order_type"], "one_triggers_one_cancels_other");
        assert_eq!(value["trigger_fill_condition"], "first_hit");
    }
}
