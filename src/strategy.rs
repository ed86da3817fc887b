// =============================================================================
// Strategy capability (C9 collaborator) — what the Runner consumes
// =============================================================================
//
// The teacher's `StrategyEngine` was a single hardwired indicator pipeline
// (`AuroraV3`) evaluated by a free function taking `&AppState`. Here the
// Runner is generic over anything implementing `Strategy`: the indicator
// math becomes a trait object the Runner owns, and the concrete pipeline
// below (`MomentumStrategy`) is one implementation among any number a
// deployment could register, kept as a reference implementation and for
// the Runner's own tests.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::{json, Value};

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Long,
    Short,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub strength: f64,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub indicators_snapshot: Value,
}

impl Signal {
    pub fn none() -> Self {
        Self { signal_type: SignalType::None, strength: 0.0, confidence: 0.0, reasons: Vec::new(), indicators_snapshot: json!({}) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RiskParams {
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub cooldown_minutes: u32,
}

/// Everything the Strategy Runner needs from a strategy; everything else
/// (indicator internals, parameter tuning) is the strategy's own concern.
pub trait Strategy: Send + Sync {
    /// Minimum candle history needed before `evaluate()` can be trusted.
    fn warmup_bars(&self) -> usize;

    fn on_candle(&mut self, candle: &Candle);

    fn on_tick(&mut self, price: f64);

    fn evaluate(&self) -> Signal;

    fn risk_params(&self) -> RiskParams;

    /// Human-readable identifier used in journal records and logs.
    fn name(&self) -> &str;
}

/// Reference strategy: EMA-cross momentum with an RSI confirmation filter.
/// Grounded on the teacher's EMA/RSI indicator math (`indicators::ema`,
/// `indicators::rsi`), stripped of the ensemble scorer, regime detector and
/// smart-filter stages the spec scopes out of the core engine.
pub struct MomentumStrategy {
    fast_period: usize,
    slow_period: usize,
    rsi_period: usize,
    closes: VecDeque<f64>,
    risk_params: RiskParams,
}

impl MomentumStrategy {
    pub fn new(fast_period: usize, slow_period: usize, rsi_period: usize, risk_params: RiskParams) -> Self {
        let capacity = slow_period.max(rsi_period) + 1;
        Self { fast_period, slow_period, rsi_period, closes: VecDeque::with_capacity(capacity), risk_params }
    }

    fn ema(&self, period: usize) -> Option<f64> {
        if self.closes.len() < period {
            return None;
        }
        let alpha = 2.0 / (period as f64 + 1.0);
        let mut iter = self.closes.iter().rev().take(period).rev();
        let mut ema = *iter.next()?;
        for &price in iter {
            ema = alpha * price + (1.0 - alpha) * ema;
        }
        Some(ema)
    }

    fn rsi(&self) -> Option<f64> {
        if self.closes.len() <= self.rsi_period {
            return None;
        }
        let recent: Vec<f64> = self.closes.iter().rev().take(self.rsi_period + 1).rev().copied().collect();
        let mut gains = 0.0;
        let mut losses = 0.0;
        for pair in recent.windows(2) {
            let delta = pair[1] - pair[0];
            if delta >= 0.0 {
                gains += delta;
            } else {
                losses -= delta;
            }
        }
        if losses == 0.0 {
            return Some(100.0);
        }
        let rs = (gains / self.rsi_period as f64) / (losses / self.rsi_period as f64);
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

impl Strategy for MomentumStrategy {
    fn warmup_bars(&self) -> usize {
        self.slow_period.max(self.rsi_period) + 1
    }

    fn on_candle(&mut self, candle: &Candle) {
        self.closes.push_back(candle.close);
        let cap = self.warmup_bars() * 3;
        while self.closes.len() > cap {
            self.closes.pop_front();
        }
    }

    fn on_tick(&mut self, price: f64) {
        if let Some(last) = self.closes.back_mut() {
            *last = price;
        } else {
            self.closes.push_back(price);
        }
    }

    fn evaluate(&self) -> Signal {
        let (Some(fast), Some(slow), Some(rsi)) = (self.ema(self.fast_period), self.ema(self.slow_period), self.rsi()) else {
            return Signal::none();
        };

        let snapshot = json!({ "ema_fast": fast, "ema_slow": slow, "rsi": rsi });
        let spread_pct = (fast - slow).abs() / slow * 100.0;
        let strength = (spread_pct * 20.0).min(100.0);

        if fast > slow && rsi < 70.0 {
            let confidence = rsi.min(70.0) / 70.0 * 100.0;
            return Signal {
                signal_type: SignalType::Long,
                strength,
                confidence,
                reasons: vec![
                    format!("ema{} crossed above ema{}", self.fast_period, self.slow_period),
                    format!("rsi {rsi:.1} below overbought"),
                ],
                indicators_snapshot: snapshot,
            };
        }

        if fast < slow && rsi > 30.0 {
            let confidence = (100.0 - rsi).max(30.0) / 70.0 * 100.0;
            return Signal {
                signal_type: SignalType::Short,
                strength,
                confidence,
                reasons: vec![
                    format!("ema{} crossed below ema{}", self.fast_period, self.slow_period),
                    format!("rsi {rsi:.1} above oversold"),
                ],
                indicators_snapshot: snapshot,
            };
        }

        Signal::none()
    }

    fn risk_params(&self) -> RiskParams {
        self.risk_params
    }

    fn name(&self) -> &str {
        "momentum-ema-rsi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    fn strategy() -> MomentumStrategy {
        MomentumStrategy::new(3, 8, 6, RiskParams { stop_loss_percent: 1.0, take_profit_percent: 2.0, cooldown_minutes: 5 })
    }

    #[test]
    fn insufficient_history_yields_no_signal() {
        let mut s = strategy();
        s.on_candle(&candle(100.0));
        assert_eq!(s.evaluate().signal_type, SignalType::None);
    }

    #[test]
    fn sustained_uptrend_produces_a_long_signal() {
        let mut s = strategy();
        let mut price = 100.0;
        for _ in 0..20 {
            price *= 1.01;
            s.on_candle(&candle(price));
        }
        let signal = s.evaluate();
        assert_eq!(signal.signal_type, SignalType::Long);
        assert!(signal.strength > 0.0);
    }

    #[test]
    fn sustained_downtrend_produces_a_short_signal() {
        let mut s = strategy();
        let mut price = 100.0;
        for _ in 0..20 {
            price *= 0.99;
            s.on_candle(&candle(price));
        }
        let signal = s.evaluate();
        assert_eq!(signal.signal_type, SignalType::Short);
    }

    #[test]
    fn warmup_bars_matches_the_longer_of_slow_and_rsi_period() {
        let s = strategy();
        assert_eq!(s.warmup_bars(), 9);
    }
}
