// =============================================================================
// Trade Journal (C11) — append-only trade record with derived PnL
// =============================================================================
//
// The backing store is a pure append log (spec §1: "the core requires only
// ... an append log"); every mutation is folded into an in-memory map built
// by replaying the log on load, the same shape as an event-sourced ledger.
// `deleteTrade` appends a tombstone rather than rewriting history, so the
// log itself is never mutated in place.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::BrokerAdapter;
use crate::errors::EngineError;
use crate::persistence::{AppendLog, AppendLogExt};
use crate::types::{ExitReason, PnlSource, Side, Trade};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalEvent {
    Opened(Trade),
    OrderIdsAttached { id: String, sl: Option<String>, tp: Option<String> },
    StopsUpdated { id: String, sl: Option<f64>, tp: Option<f64> },
    Closed { id: String, exit_price: f64, exit_reason: ExitReason, pnl: f64, pnl_source: PnlSource },
    Deleted { id: String },
}

#[derive(Debug, Default, Clone)]
pub struct TradeQuery {
    pub strategy: Option<String>,
    pub instrument: Option<String>,
    pub open_only: Option<bool>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TradeStats {
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub sl_hits: u64,
    pub tp_hits: u64,
}

pub struct Journal {
    log: Arc<dyn AppendLog>,
    trades: RwLock<HashMap<String, Trade>>,
    /// Preserves append order independent of HashMap iteration order.
    order: RwLock<Vec<String>>,
}

impl Journal {
    pub fn new(log: Arc<dyn AppendLog>) -> Self {
        let journal = Self { log, trades: RwLock::new(HashMap::new()), order: RwLock::new(Vec::new()) };
        journal.replay();
        journal
    }

    fn replay(&self) {
        let events: Vec<JournalEvent> = match self.log.read_all_json() {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "failed to replay trade journal, starting empty");
                return;
            }
        };
        let mut trades = self.trades.write();
        let mut order = self.order.write();
        for event in events {
            match event {
                JournalEvent::Opened(trade) => {
                    order.push(trade.id.clone());
                    trades.insert(trade.id.clone(), trade);
                }
                JournalEvent::OrderIdsAttached { id, sl, tp } => {
                    if let Some(trade) = trades.get_mut(&id) {
                        if sl.is_some() {
                            trade.sl_order_id = sl;
                        }
                        if tp.is_some() {
                            trade.tp_order_id = tp;
                        }
                    }
                }
                JournalEvent::StopsUpdated { id, sl, tp } => {
                    if let Some(trade) = trades.get_mut(&id) {
                        if let Some(sl) = sl {
                            trade.stop_loss = sl;
                        }
                        if let Some(tp) = tp {
                            trade.take_profit = tp;
                        }
                    }
                }
                JournalEvent::Closed { id, exit_price, exit_reason, pnl, pnl_source } => {
                    if let Some(trade) = trades.get_mut(&id) {
                        trade.closed_at = Some(Utc::now());
                        trade.exit_price = Some(exit_price);
                        trade.exit_reason = Some(exit_reason);
                        trade.pnl = Some(pnl);
                        trade.pnl_source = Some(pnl_source);
                    }
                }
                JournalEvent::Deleted { id } => {
                    trades.remove(&id);
                    order.retain(|existing| existing != &id);
                }
            }
        }
        info!(count = trades.len(), "trade journal replayed");
    }

    fn append(&self, event: &JournalEvent) {
        if let Err(err) = self.log.append_json(event) {
            warn!(error = %err, "failed to append trade journal event");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_trade(
        &self,
        strategy: &str,
        instrument: &str,
        side: Side,
        amount: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        entry_order_id: &str,
    ) -> Trade {
        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            strategy: strategy.to_string(),
            instrument: instrument.to_string(),
            side,
            amount,
            entry_price,
            stop_loss,
            take_profit,
            entry_order_id: entry_order_id.to_string(),
            sl_order_id: None,
            tp_order_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            exit_price: None,
            pnl: None,
            pnl_source: None,
            exit_reason: None,
        };
        self.append(&JournalEvent::Opened(trade.clone()));
        self.trades.write().insert(trade.id.clone(), trade.clone());
        self.order.write().push(trade.id.clone());
        trade
    }

    pub fn attach_order_ids(&self, id: &str, sl: Option<String>, tp: Option<String>) {
        self.append(&JournalEvent::OrderIdsAttached { id: id.to_string(), sl: sl.clone(), tp: tp.clone() });
        if let Some(trade) = self.trades.write().get_mut(id) {
            if sl.is_some() {
                trade.sl_order_id = sl;
            }
            if tp.is_some() {
                trade.tp_order_id = tp;
            }
        }
    }

    pub fn update_stops(&self, id: &str, sl: Option<f64>, tp: Option<f64>) {
        self.append(&JournalEvent::StopsUpdated { id: id.to_string(), sl, tp });
        if let Some(trade) = self.trades.write().get_mut(id) {
            if let Some(sl) = sl {
                trade.stop_loss = sl;
            }
            if let Some(tp) = tp {
                trade.take_profit = tp;
            }
        }
    }

    pub fn close_trade(&self, id: &str, exit_price: f64, exit_reason: ExitReason, pnl: f64, pnl_source: PnlSource) {
        self.append(&JournalEvent::Closed { id: id.to_string(), exit_price, exit_reason, pnl, pnl_source });
        if let Some(trade) = self.trades.write().get_mut(id) {
            trade.closed_at = Some(Utc::now());
            trade.exit_price = Some(exit_price);
            trade.exit_reason = Some(exit_reason);
            trade.pnl = Some(pnl);
            trade.pnl_source = Some(pnl_source);
        }
    }

    pub fn delete_trade(&self, id: &str) {
        self.append(&JournalEvent::Deleted { id: id.to_string() });
        self.trades.write().remove(id);
        self.order.write().retain(|existing| existing != id);
    }

    pub fn get(&self, id: &str) -> Option<Trade> {
        self.trades.read().get(id).cloned()
    }

    pub fn query(&self, query: &TradeQuery) -> Vec<Trade> {
        let trades = self.trades.read();
        let order = self.order.read();
        let mut matched: Vec<Trade> = order
            .iter()
            .rev() // most recent first
            .filter_map(|id| trades.get(id))
            .filter(|t| query.strategy.as_deref().map(|s| s == t.strategy).unwrap_or(true))
            .filter(|t| query.instrument.as_deref().map(|i| i == t.instrument).unwrap_or(true))
            .filter(|t| query.open_only.map(|open| open == t.closed_at.is_none()).unwrap_or(true))
            .cloned()
            .collect();

        let start = query.offset.min(matched.len());
        matched = matched.split_off(start);
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        matched
    }

    pub fn stats(&self, query: &TradeQuery) -> TradeStats {
        let closed: Vec<Trade> = self
            .query(&TradeQuery { open_only: Some(false), limit: None, offset: 0, ..query.clone() })
            .into_iter()
            .filter(|t| t.pnl.is_some())
            .collect();

        let mut stats = TradeStats::default();
        if closed.is_empty() {
            return stats;
        }

        stats.total_trades = closed.len() as u64;
        let mut pnl_sum = 0.0;
        let mut best = f64::MIN;
        let mut worst = f64::MAX;
        for trade in &closed {
            let pnl = trade.pnl.unwrap_or(0.0);
            pnl_sum += pnl;
            if pnl >= 0.0 {
                stats.wins += 1;
            } else {
                stats.losses += 1;
            }
            best = best.max(pnl);
            worst = worst.min(pnl);
            match trade.exit_reason {
                Some(ExitReason::SlHit) => stats.sl_hits += 1,
                Some(ExitReason::TpHit) => stats.tp_hits += 1,
                _ => {}
            }
        }
        stats.total_pnl = pnl_sum;
        stats.avg_pnl = pnl_sum / closed.len() as f64;
        stats.best_trade = best;
        stats.worst_trade = worst;
        stats.win_rate = stats.wins as f64 / stats.total_trades as f64 * 100.0;
        stats
    }
}

/// Exit derivation (spec §4.9): authoritative path reads the broker's
/// per-fill user-trades; falls back to estimation when no fill data is
/// available, marking the result `pnl_source: estimation`.
/// Returns `(exitPrice, pnl, exitReason, pnlSource)`. `pnl` is computed here
/// — fees-aware and fills-weighted when `PnlSource::Fills`, a price-delta
/// estimate otherwise (spec §4.9) — so the caller never has to re-derive it
/// from a formula that would silently diverge from this one.
pub async fn derive_exit(
    broker: &BrokerAdapter,
    trade: &Trade,
    exit_price_hint: f64,
) -> Result<(f64, f64, ExitReason, PnlSource), EngineError> {
    let fills = broker.get_user_trades(&trade.instrument).await?;

    let entry_fills: Vec<&serde_json::Value> = fills
        .iter()
        .filter(|f| f.get("order_id").and_then(|v| v.as_str()) == Some(trade.entry_order_id.as_str()))
        .collect();

    let sl_order = trade.sl_order_id.as_deref();
    let tp_order = trade.tp_order_id.as_deref();
    let exit_fills: Vec<&serde_json::Value> = fills
        .iter()
        .filter(|f| {
            let order_id = f.get("order_id").and_then(|v| v.as_str());
            order_id.is_some() && (order_id == sl_order || order_id == tp_order)
        })
        .collect();

    if !entry_fills.is_empty() && !exit_fills.is_empty() {
        let entry_notional: f64 = entry_fills.iter().filter_map(|f| fill_notional(f)).sum();
        let exit_notional: f64 = exit_fills.iter().filter_map(|f| fill_notional(f)).sum();
        let fees: f64 = fills.iter().filter_map(|f| f.get("fee").and_then(|v| v.as_f64())).sum();

        let raw_pnl = exit_notional - entry_notional - fees;
        let pnl = match trade.side {
            Side::Buy => raw_pnl,
            Side::Sell => -raw_pnl,
        };

        let exit_order_id = exit_fills.first().and_then(|f| f.get("order_id")).and_then(|v| v.as_str());
        let exit_reason = if exit_order_id == sl_order {
            ExitReason::SlHit
        } else if exit_order_id == tp_order {
            ExitReason::TpHit
        } else {
            ExitReason::Manual
        };

        return Ok((exit_price_hint, pnl, exit_reason, PnlSource::Fills));
    }

    // Fallback: estimate from entry/exit price delta (spec §9 acknowledged
    // ambiguity: document the fallback rather than inventing fill data).
    let side_sign = trade.side.sign();
    let pnl = (exit_price_hint - trade.entry_price) * trade.amount * side_sign;

    let dist_to_sl = (exit_price_hint - trade.stop_loss).abs();
    let dist_to_tp = (exit_price_hint - trade.take_profit).abs();
    let exit_reason = if dist_to_sl <= dist_to_tp { ExitReason::SlHit } else { ExitReason::TpHit };

    Ok((exit_price_hint, pnl, exit_reason, PnlSource::Estimation))
}

fn fill_notional(fill: &serde_json::Value) -> Option<f64> {
    let price = fill.get("price").and_then(|v| v.as_f64())?;
    let amount = fill.get("amount").and_then(|v| v.as_f64())?;
    Some(price * amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryAppendLog;

    fn journal() -> Journal {
        Journal::new(Arc::new(MemoryAppendLog::default()))
    }

    #[test]
    fn open_then_close_trade_updates_in_memory_state() {
        let j = journal();
        let trade = j.open_trade("trend", "BTC-PERP", Side::Buy, 0.01, 50_000.0, 49_000.0, 52_000.0, "entry-1");
        j.close_trade(&trade.id, 52_000.0, ExitReason::TpHit, 20.0, PnlSource::Fills);
        let reloaded = j.get(&trade.id).unwrap();
        assert_eq!(reloaded.pnl, Some(20.0));
        assert_eq!(reloaded.exit_reason, Some(ExitReason::TpHit));
    }

    #[test]
    fn journal_replays_from_append_log_after_restart() {
        let log = Arc::new(MemoryAppendLog::default());
        let id;
        {
            let j = Journal::new(log.clone());
            let trade = j.open_trade("trend", "BTC-PERP", Side::Buy, 0.01, 50_000.0, 49_000.0, 52_000.0, "entry-1");
            j.close_trade(&trade.id, 52_000.0, ExitReason::TpHit, 20.0, PnlSource::Fills);
            id = trade.id;
        }
        let reloaded_journal = Journal::new(log);
        let trade = reloaded_journal.get(&id).unwrap();
        assert_eq!(trade.pnl, Some(20.0));
    }

    #[test]
    fn deleted_trade_is_absent_from_queries() {
        let j = journal();
        let trade = j.open_trade("trend", "BTC-PERP", Side::Buy, 0.01, 50_000.0, 49_000.0, 52_000.0, "entry-1");
        j.delete_trade(&trade.id);
        assert!(j.get(&trade.id).is_none());
        assert!(j.query(&TradeQuery::default()).is_empty());
    }

    #[test]
    fn stats_aggregate_wins_and_losses() {
        let j = journal();
        let a = j.open_trade("trend", "BTC-PERP", Side::Buy, 0.01, 50_000.0, 49_000.0, 52_000.0, "e1");
        j.close_trade(&a.id, 52_000.0, ExitReason::TpHit, 20.0, PnlSource::Fills);
        let b = j.open_trade("trend", "BTC-PERP", Side::Buy, 0.01, 50_000.0, 49_000.0, 52_000.0, "e2");
        j.close_trade(&b.id, 49_000.0, ExitReason::SlHit, -10.0, PnlSource::Fills);

        let stats = j.stats(&TradeQuery::default());
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.total_pnl, 10.0);
        assert_eq!(stats.sl_hits, 1);
        assert_eq!(stats.tp_hits, 1);
    }

    #[test]
    fn journal_round_trip_pnl_matches_within_tolerance() {
        // spec §8 journal round-trip property
        let j = journal();
        let trade = j.open_trade("trend", "BTC-PERP", Side::Buy, 0.01, 50_000.0, 49_000.0, 52_000.0, "e1");
        j.close_trade(&trade.id, 52_000.0, ExitReason::TpHit, 20.0, PnlSource::Fills);
        let reloaded = j.get(&trade.id).unwrap();
        assert!((reloaded.pnl.unwrap() - 20.0).abs() < 1e-6);
    }
}
