// =============================================================================
// Risk Guard — circuit breakers protecting capital (ambient safety layer)
// =============================================================================
//
// Three breakers, grounded on the teacher's RiskEngine: Daily Loss,
// Consecutive Losses, Trade Limit. The teacher also tracked a Max Drawdown
// breaker; GuardCfg (config.rs) does not carry a drawdown limit, so that
// breaker has no home here — drawdown policing is an exchange-side margin
// concern under this spec's data model, not this engine's. Daily statistics
// reset automatically on date rollover, exactly as the teacher's
// `maybe_reset_daily` does.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GuardCfg;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardState {
    pub risk_mode: String,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_pnl_pct: f64,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub daily_trades_count: u32,
    #[serde(default)]
    pub daily_wins: u32,
    #[serde(default)]
    pub daily_losses: u32,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
    #[serde(default)]
    pub current_date: String,
}

struct Inner {
    risk_mode: String,
    daily_pnl: f64,
    consecutive_losses: u32,
    daily_trades_count: u32,
    daily_wins: u32,
    daily_losses: u32,
    current_date: String,
    killed: bool,
}

/// Process-wide circuit breaker guard. Consulted by the Strategy Runner
/// before every entry; independent of (and in addition to) the Lifecycle
/// Manager's state-machine guard.
pub struct RiskGuard {
    state: RwLock<Inner>,
    capital: f64,
    max_daily_loss_pct: f64,
    max_consecutive_losses: u32,
    max_daily_trades: u32,
}

impl RiskGuard {
    pub fn new(capital: f64, cfg: &GuardCfg) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            capital,
            max_daily_loss_pct = cfg.max_daily_loss_pct,
            max_consecutive_losses = cfg.max_consecutive_losses,
            max_trades_per_day = cfg.max_trades_per_day,
            "risk guard initialized"
        );
        Self {
            state: RwLock::new(Inner {
                risk_mode: "Normal".to_string(),
                daily_pnl: 0.0,
                consecutive_losses: 0,
                daily_trades_count: 0,
                daily_wins: 0,
                daily_losses: 0,
                current_date: today,
                killed: false,
            }),
            capital,
            max_daily_loss_pct: cfg.max_daily_loss_pct / 100.0,
            max_consecutive_losses: cfg.max_consecutive_losses,
            max_daily_trades: cfg.max_trades_per_day,
        }
    }

    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades_count += 1;
        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }
        s.risk_mode = self.compute_risk_mode(&s);

        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            daily_trades = s.daily_trades_count,
            risk_mode = %s.risk_mode,
            "trade result recorded"
        );
    }

    /// `(true, None)` if clear to trade, `(false, Some(reason))` if tripped.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return (false, Some("kill switch activated".to_string()));
        }

        let daily_loss_pct = if self.capital > 0.0 { (-s.daily_pnl) / self.capital } else { 0.0 };
        if daily_loss_pct >= self.max_daily_loss_pct {
            let msg = format!(
                "daily loss breaker tripped: {:.2}% lost (limit {:.2}%)",
                daily_loss_pct * 100.0,
                self.max_daily_loss_pct * 100.0
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.consecutive_losses >= self.max_consecutive_losses {
            let msg = format!(
                "consecutive losses breaker tripped: {} (limit {})",
                s.consecutive_losses, self.max_consecutive_losses
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.daily_trades_count >= self.max_daily_trades {
            let msg = format!(
                "trade limit breaker tripped: {} trades today (limit {})",
                s.daily_trades_count, self.max_daily_trades
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        (true, None)
    }

    pub fn get_state(&self) -> GuardState {
        self.maybe_reset_daily();
        let s = self.state.read();
        let daily_pnl_pct = if self.capital > 0.0 { (s.daily_pnl / self.capital) * 100.0 } else { 0.0 };
        GuardState {
            risk_mode: s.risk_mode.clone(),
            daily_pnl: s.daily_pnl,
            daily_pnl_pct,
            consecutive_losses: s.consecutive_losses,
            daily_trades_count: s.daily_trades_count,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            circuit_breakers: self.build_circuit_breaker_info(&s),
            current_date: s.current_date.clone(),
        }
    }

    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        s.risk_mode = "KILLED".to_string();
        warn!("kill switch activated — all trading halted");
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled, resetting daily risk counters");
            Self::do_reset(&mut s, &today);
        }
    }

    fn do_reset(s: &mut Inner, date: &str) {
        s.daily_pnl = 0.0;
        s.consecutive_losses = 0;
        s.daily_trades_count = 0;
        s.daily_wins = 0;
        s.daily_losses = 0;
        s.current_date = date.to_string();
        s.risk_mode = if s.killed { "KILLED".to_string() } else { "Normal".to_string() };
    }

    fn compute_risk_mode(&self, s: &Inner) -> String {
        if s.killed {
            return "KILLED".to_string();
        }
        let daily_loss_pct = if self.capital > 0.0 { (-s.daily_pnl) / self.capital } else { 0.0 };
        if daily_loss_pct >= self.max_daily_loss_pct
            || s.consecutive_losses >= self.max_consecutive_losses
            || s.daily_trades_count >= self.max_daily_trades
        {
            "BREAKER_TRIPPED".to_string()
        } else if daily_loss_pct >= self.max_daily_loss_pct * 0.75
            || s.consecutive_losses as f64 >= self.max_consecutive_losses as f64 * 0.75
        {
            "Cautious".to_string()
        } else {
            "Normal".to_string()
        }
    }

    fn build_circuit_breaker_info(&self, s: &Inner) -> Vec<CircuitBreakerInfo> {
        let daily_loss_pct = if self.capital > 0.0 { ((-s.daily_pnl) / self.capital) * 100.0 } else { 0.0 };
        vec![
            CircuitBreakerInfo {
                name: "Daily Loss".to_string(),
                current: daily_loss_pct.max(0.0),
                limit: self.max_daily_loss_pct * 100.0,
                tripped: daily_loss_pct >= self.max_daily_loss_pct * 100.0,
            },
            CircuitBreakerInfo {
                name: "Consecutive Losses".to_string(),
                current: s.consecutive_losses as f64,
                limit: self.max_consecutive_losses as f64,
                tripped: s.consecutive_losses >= self.max_consecutive_losses,
            },
            CircuitBreakerInfo {
                name: "Trade Limit".to_string(),
                current: s.daily_trades_count as f64,
                limit: self.max_daily_trades as f64,
                tripped: s.daily_trades_count >= self.max_daily_trades,
            },
        ]
    }
}

impl std::fmt::Debug for RiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGuard")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .field("max_daily_trades", &self.max_daily_trades)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GuardCfg {
        GuardCfg { max_daily_loss_pct: 3.0, max_consecutive_losses: 3, max_trades_per_day: 10 }
    }

    #[test]
    fn clean_guard_allows_trading() {
        let guard = RiskGuard::new(10_000.0, &cfg());
        assert_eq!(guard.can_trade(), (true, None));
    }

    #[test]
    fn consecutive_losses_trip_the_breaker() {
        let guard = RiskGuard::new(10_000.0, &cfg());
        guard.record_trade_result(-10.0);
        guard.record_trade_result(-10.0);
        guard.record_trade_result(-10.0);
        let (can_trade, reason) = guard.can_trade();
        assert!(!can_trade);
        assert!(reason.unwrap().contains("consecutive"));
    }

    #[test]
    fn daily_loss_trips_the_breaker() {
        let guard = RiskGuard::new(1_000.0, &cfg());
        guard.record_trade_result(-31.0); // 3.1% > 3%
        let (can_trade, _) = guard.can_trade();
        assert!(!can_trade);
    }

    #[test]
    fn a_win_resets_the_consecutive_loss_counter() {
        let guard = RiskGuard::new(10_000.0, &cfg());
        guard.record_trade_result(-10.0);
        guard.record_trade_result(-10.0);
        guard.record_trade_result(5.0);
        assert_eq!(guard.get_state().consecutive_losses, 0);
    }

    #[test]
    fn kill_switch_blocks_trading_immediately() {
        let guard = RiskGuard::new(10_000.0, &cfg());
        guard.kill();
        let (can_trade, reason) = guard.can_trade();
        assert!(!can_trade);
        assert!(reason.unwrap().contains("kill switch"));
    }
}
