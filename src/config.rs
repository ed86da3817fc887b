// =============================================================================
// Configuration — per-component records assembled into one CoreCfg
// =============================================================================
//
// Every tunable lives in an explicit, named config record instead of one
// monolithic struct, so that each component takes only the settings it
// actually consumes. Persistence keeps the atomic tmp + rename pattern:
// write to a temporary sibling file, then rename, so a crash mid-write never
// corrupts the config on disk. Every field carries `#[serde(default)]` so
// that loading an older config file after adding a field never fails.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// ---------------------------------------------------------------------------
// Default-value helpers
// ---------------------------------------------------------------------------

fn default_rate_limit_capacity() -> u32 {
    20
}

fn default_rate_limit_refill_per_sec() -> f64 {
    20.0
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_heartbeat_stale_secs() -> u64 {
    60
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_instrument_cache_ttl_secs() -> u64 {
    3600
}

fn default_max_risk_pct() -> f64 {
    2.0
}

fn default_max_leverage() -> f64 {
    10.0
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_order_stale_secs() -> u64 {
    120
}

fn default_job_queue_capacity() -> usize {
    256
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// RateLimitCfg (C1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitCfg {
    /// Token bucket capacity (max burst).
    #[serde(default = "default_rate_limit_capacity")]
    pub capacity: u32,
    /// Tokens restored per second.
    #[serde(default = "default_rate_limit_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitCfg {
    fn default() -> Self {
        Self {
            capacity: default_rate_limit_capacity(),
            refill_per_sec: default_rate_limit_refill_per_sec(),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionCfg (C2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCfg {
    pub ws_url: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            ws_url: "wss://test.deribit.com/ws/api/v2".to_string(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunnerCfg (C3/C9)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerCfg {
    #[serde(default = "default_instrument_cache_ttl_secs")]
    pub instrument_cache_ttl_secs: u64,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        Self {
            instrument_cache_ttl_secs: default_instrument_cache_ttl_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// RiskCfg (C4)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCfg {
    /// Maximum fraction of equity risked per trade (percent, e.g. 2.0 = 2%).
    #[serde(default = "default_max_risk_pct")]
    pub max_risk_pct: f64,
    /// Hard cap on computed leverage, independent of the instrument's own max.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    /// Circuit-breaker guard settings, grounded on the teacher's RiskEngine.
    #[serde(default)]
    pub guard: GuardCfg,
}

impl Default for RiskCfg {
    fn default() -> Self {
        Self {
            max_risk_pct: default_max_risk_pct(),
            max_leverage: default_max_leverage(),
            guard: GuardCfg::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardCfg {
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_trades_per_day() -> u32 {
    50
}

impl Default for GuardCfg {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconcileCfg (C7)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileCfg {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// An orphan order younger than this is left alone for one more sweep,
    /// to avoid racing the placer's own in-flight bracket construction.
    #[serde(default = "default_order_stale_secs")]
    pub order_stale_secs: u64,
}

impl Default for ReconcileCfg {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            order_stale_secs: default_order_stale_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntitlementCfg / OrchestratorCfg (C10)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementCfg {
    /// Path to a JSON file mapping user_id -> Entitlement; absent means every
    /// user gets the free-tier default.
    #[serde(default)]
    pub entitlements_path: Option<String>,
}

impl Default for EntitlementCfg {
    fn default() -> Self {
        Self { entitlements_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorCfg {
    #[serde(default = "default_job_queue_capacity")]
    pub job_queue_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestratorCfg {
    fn default() -> Self {
        Self {
            job_queue_capacity: default_job_queue_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// CoreCfg — the assembled whole
// ---------------------------------------------------------------------------

/// Top-level configuration for the engine core. Every field has a serde
/// default so an older JSON file missing new fields still deserializes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreCfg {
    #[serde(default)]
    pub rate_limit: RateLimitCfg,
    #[serde(default)]
    pub session: SessionCfg,
    #[serde(default)]
    pub runner: RunnerCfg,
    #[serde(default)]
    pub risk: RiskCfg,
    #[serde(default)]
    pub reconcile: ReconcileCfg,
    #[serde(default)]
    pub entitlement: EntitlementCfg,
    #[serde(default)]
    pub orchestrator: OrchestratorCfg,
}

impl CoreCfg {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read core config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse core config from {}", path.display()))?;

        info!(path = %path.display(), "core config loaded");
        Ok(config)
    }

    /// Load from `path`, falling back to defaults (and logging a warning) if
    /// the file does not exist yet.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "no core config found, using defaults");
                Self::default()
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialize core config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "core config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = CoreCfg::default();
        assert_eq!(cfg.rate_limit.capacity, 20);
        assert_eq!(cfg.risk.max_leverage, 10.0);
        assert_eq!(cfg.risk.guard.max_consecutive_losses, 5);
        assert_eq!(cfg.orchestrator.job_queue_capacity, 256);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: CoreCfg = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.session.heartbeat_interval_secs, 15);
        assert_eq!(cfg.reconcile.interval_secs, 60);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "risk": { "max_risk_pct": 5.0 } }"#;
        let cfg: CoreCfg = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.risk.max_risk_pct, 5.0);
        assert_eq!(cfg.risk.max_leverage, 10.0);
        assert_eq!(cfg.rate_limit.capacity, 20);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = CoreCfg::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: CoreCfg = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.session.ws_url, cfg2.session.ws_url);
        assert_eq!(cfg.orchestrator.job_queue_capacity, cfg2.orchestrator.job_queue_capacity);
    }

    #[test]
    fn save_then_load_roundtrips_atomically() {
        let dir = std::env::temp_dir().join(format!("core_cfg_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = CoreCfg::default();
        cfg.risk.max_risk_pct = 1.5;
        cfg.save(&path).unwrap();

        let loaded = CoreCfg::load(&path).unwrap();
        assert_eq!(loaded.risk.max_risk_pct, 1.5);

        std::fs::remove_dir_all(&dir).ok();
    }
}
