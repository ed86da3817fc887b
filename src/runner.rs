// =============================================================================
// Strategy Runner (C9) — per-job main loop
// =============================================================================
//
// One Runner per running job: owns a Broker Adapter, a Strategy instance, a
// Lifecycle reference and a Journal reference, and drives the tick/candle
// loop described in spec §4.8. Grounded on the teacher's per-symbol task
// model (one tokio task per tracked instrument) but generalized from a
// single hardwired strategy to any `Strategy` trait object.
//
// Ticks arrive on a `watch` channel: a watch naturally keeps only the latest
// value, which is exactly the "drop oldest tick, never drop order events"
// back-pressure policy spec §5 asks for. Order-state notifications arrive on
// an unbounded channel instead, so none are ever dropped.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use crate::broker::BrokerAdapter;
use crate::config::RiskCfg;
use crate::errors::EngineError;
use crate::journal::{self, Journal};
use crate::lifecycle::LifecycleManager;
use crate::placer::{BracketPlacer, BracketRequest};
use crate::risk::engine::{build_bracket, size_position, BrokerRules, RiskMode, SizingInput};
use crate::risk::RiskGuard;
use crate::strategy::{RiskParams, SignalType, Strategy};
use crate::types::{Order, OrderState, OrderType, Side};
use crate::validator::OrderValidator;

/// Minimum signal strength to act on (spec §4.8 step 4 default).
const DEFAULT_SIGNAL_THRESHOLD: f64 = 50.0;
const CANDLE_RESOLUTION: &str = "5";

pub struct Runner {
    broker: Arc<BrokerAdapter>,
    strategy: Mutex<Box<dyn Strategy>>,
    lifecycle: Arc<LifecycleManager>,
    validator: Arc<OrderValidator>,
    placer: Arc<BracketPlacer>,
    journal: Arc<Journal>,
    guard: Arc<RiskGuard>,
    instrument: String,
    risk_cfg: RiskCfg,
    signal_threshold: f64,
    current_trade_id: Mutex<Option<String>>,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
    flatten_on_stop: AtomicBool,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<BrokerAdapter>,
        strategy: Box<dyn Strategy>,
        lifecycle: Arc<LifecycleManager>,
        validator: Arc<OrderValidator>,
        placer: Arc<BracketPlacer>,
        journal: Arc<Journal>,
        guard: Arc<RiskGuard>,
        instrument: impl Into<String>,
        risk_cfg: RiskCfg,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            strategy: Mutex::new(strategy),
            lifecycle,
            validator,
            placer,
            journal,
            guard,
            instrument: instrument.into(),
            risk_cfg,
            signal_threshold: DEFAULT_SIGNAL_THRESHOLD,
            current_trade_id: Mutex::new(None),
            cooldown_until: Mutex::new(None),
            flatten_on_stop: AtomicBool::new(false),
        })
    }

    /// Requested by the orchestrator before signalling stop, when
    /// `stopRunner` was called with `flattenPositions = true` (spec §4.10).
    pub fn request_flatten(&self) {
        self.flatten_on_stop.store(true, Ordering::SeqCst);
    }

    /// Main loop. Runs until `stop_rx` reports `true`, then performs the
    /// cooperative shutdown sequence (spec §4.8 step 6, §5 cancellation).
    #[instrument(skip(self, stop_rx), name = "runner.run", fields(instrument = %self.instrument))]
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) -> Result<(), EngineError> {
        let warmup_bars = self.strategy.lock().warmup_bars();
        let candles = self.broker.get_candles(&self.instrument, CANDLE_RESOLUTION, warmup_bars).await?;
        {
            let mut strategy = self.strategy.lock();
            for candle in &candles {
                strategy.on_candle(candle);
            }
        }
        info!(bars = candles.len(), "strategy warmup complete");

        let (tick_tx, mut tick_rx) = watch::channel(0.0_f64);
        self.broker.subscribe_ticks(&self.instrument, move |price| {
            let _ = tick_tx.send(price);
        });

        let (order_tx, mut order_rx) = mpsc::unbounded_channel::<Order>();
        self.broker.subscribe_order_updates(&self.instrument, move |order| {
            let _ = order_tx.send(order);
        });

        let strategy_name = self.strategy.lock().name().to_string();
        self.lifecycle.start(strategy_name, self.instrument.clone())?;

        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                Some(order) = order_rx.recv() => {
                    if let Err(err) = self.on_order_update(order).await {
                        warn!(error = %err, "order update handling failed");
                    }
                }
                changed = tick_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let price = *tick_rx.borrow_and_update();
                    if let Err(err) = self.on_tick(price).await {
                        warn!(error = %err, "tick handling failed");
                    }
                }
            }
        }

        let flatten = self.flatten_on_stop.load(Ordering::SeqCst);
        self.shutdown(flatten).await
    }

    async fn on_tick(&self, price: f64) -> Result<(), EngineError> {
        if !self.lifecycle.should_analyze() {
            return Ok(());
        }
        if let Some(until) = *self.cooldown_until.lock() {
            if Utc::now() < until {
                return Ok(());
            }
        }
        let (can_trade, reason) = self.guard.can_trade();
        if !can_trade {
            if let Some(reason) = reason {
                warn!(reason, "risk guard blocks new entries");
            }
            return Ok(());
        }

        let signal = {
            let mut strategy = self.strategy.lock();
            strategy.on_tick(price);
            strategy.evaluate()
        };

        if signal.signal_type == SignalType::None || signal.strength < self.signal_threshold {
            return Ok(());
        }
        if !self.lifecycle.can_open_position() {
            return Ok(());
        }

        self.lifecycle.signal()?;
        self.lifecycle.entering()?;

        let side = match signal.signal_type {
            SignalType::Long => Side::Buy,
            SignalType::Short => Side::Sell,
            SignalType::None => unreachable!(),
        };
        let risk_params = self.strategy.lock().risk_params();

        match self.try_enter(side, price, &risk_params).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "entry attempt failed, returning to ANALYZING");
                self.lifecycle.entry_failed()?;
                self.set_cooldown(risk_params.cooldown_minutes);
                Ok(())
            }
        }
    }

    async fn try_enter(&self, side: Side, price: f64, risk_params: &RiskParams) -> Result<(), EngineError> {
        let account = self.broker.get_balance("USD").await?;
        let instrument_info = self.broker.get_instrument(&self.instrument).await?;

        let stop_price = match side {
            Side::Buy => price * (1.0 - risk_params.stop_loss_percent / 100.0),
            Side::Sell => price * (1.0 + risk_params.stop_loss_percent / 100.0),
        };

        let sizing = size_position(&SizingInput {
            equity: account.equity,
            risk_mode: RiskMode::Percent,
            risk_value: self.risk_cfg.max_risk_pct,
            entry_price: price,
            stop_price,
            broker_rules: BrokerRules {
                max_leverage: self.risk_cfg.max_leverage.min(instrument_info.max_leverage),
                tick_size: instrument_info.tick_size,
                lot: instrument_info.min_trade_amount,
                contract_size: instrument_info.contract_size,
                contract_type: instrument_info.contract_type,
            },
        })?;

        let validated = self
            .validator
            .validate_entry(&self.instrument, OrderType::Market, sizing.quantity, None, price, account.available_funds)
            .await?;

        let rr_ratio = if risk_params.stop_loss_percent > 0.0 {
            risk_params.take_profit_percent / risk_params.stop_loss_percent
        } else {
            1.0
        };
        let bracket = build_bracket(side, price, stop_price, rr_ratio, instrument_info.tick_size);

        let result = self
            .placer
            .place_bracket(BracketRequest {
                instrument: self.instrument.clone(),
                side,
                entry_type: OrderType::Market,
                amount: validated.amount,
                entry_price: None,
                stop_trigger_price: bracket.stop_loss,
                take_profit_price: bracket.take_profit,
            })
            .await?;

        self.lifecycle.opened(price, validated.amount, side)?;

        let trade = self.journal.open_trade(
            &self.strategy.lock().name().to_string(),
            &self.instrument,
            side,
            validated.amount,
            price,
            bracket.stop_loss,
            bracket.take_profit,
            &result.entry_order_id,
        );
        self.journal.attach_order_ids(&trade.id, result.sl_order_id, result.tp_order_id);
        *self.current_trade_id.lock() = Some(trade.id);

        info!(instrument = %self.instrument, transaction_id = %result.transaction_id, "position entered");
        Ok(())
    }

    async fn on_order_update(&self, order: Order) -> Result<(), EngineError> {
        if order.state != OrderState::Filled && order.state != OrderState::Cancelled {
            return Ok(());
        }
        if order.instrument != self.instrument {
            return Ok(());
        }
        if self.lifecycle.current_state() != crate::types::LifecycleState::PositionOpen {
            return Ok(());
        }

        let is_protective_leg = order
            .label
            .as_deref()
            .map(|l| l.ends_with("_sl") || l.ends_with("_tp"))
            .unwrap_or(false);
        if !is_protective_leg || order.state != OrderState::Filled {
            return Ok(());
        }

        let Some(trade_id) = self.current_trade_id.lock().clone() else { return Ok(()) };
        let Some(trade) = self.journal.get(&trade_id) else { return Ok(()) };

        self.lifecycle.closing()?;

        let exit_price = order.price.unwrap_or(trade.entry_price);
        let (resolved_price, pnl, exit_reason, pnl_source) = journal::derive_exit(&self.broker, &trade, exit_price).await?;
        self.journal.close_trade(&trade.id, resolved_price, exit_reason, pnl, pnl_source);
        self.guard.record_trade_result(pnl);

        // Cancel the sibling leg if the native OCO did not already.
        let remaining = self.broker.get_open_orders(Some(&self.instrument)).await.unwrap_or_default();
        for sibling in remaining.iter().filter(|o| o.order_id != order.order_id) {
            let names_sibling_leg = sibling.label.as_deref().map(|l| l.ends_with("_sl") || l.ends_with("_tp")).unwrap_or(false);
            if names_sibling_leg {
                let _ = self.broker.cancel_order(&sibling.order_id).await;
            }
        }

        *self.current_trade_id.lock() = None;
        self.lifecycle.closed()?;
        info!(trade_id = %trade.id, pnl, "trade closed");
        Ok(())
    }

    fn set_cooldown(&self, minutes: u32) {
        *self.cooldown_until.lock() = Some(Utc::now() + chrono::Duration::minutes(minutes as i64));
    }

    /// Cooperative shutdown (spec §4.8 step 6): cancel open orders for the
    /// instrument, optionally flatten, then transition back to IDLE.
    pub async fn shutdown(&self, flatten: bool) -> Result<(), EngineError> {
        if let Err(err) = self.broker.cancel_all_by_instrument(&self.instrument).await {
            warn!(error = %err, "failed to cancel open orders on shutdown");
        }
        if flatten {
            if let Err(err) = self.broker.close_position(&self.instrument).await {
                warn!(error = %err, "failed to flatten position on shutdown");
            }
        }
        // `stop()` only advances Analyzing -> Idle; a runner can be asked to
        // shut down from any lifecycle state (mid-signal, mid-entry, with a
        // position open), so drive the unconditional `reconcile_reset` edge
        // instead of the single-transition `stop()` (spec §4.6/§6: killswitch
        // and shutdown both contract to "transition lifecycle -> IDLE").
        if self.lifecycle.current_state() != crate::types::LifecycleState::Idle {
            let _ = self.lifecycle.reconcile_reset();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_signal_threshold_matches_spec_default() {
        assert_eq!(DEFAULT_SIGNAL_THRESHOLD, 50.0);
    }
}
