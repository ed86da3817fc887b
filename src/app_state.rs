// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth for the running engine. Grounded on the
// teacher's `AppState` — one struct owning every subsystem's `Arc`, built
// once at startup and shared across every async task — generalized from a
// single hardwired Binance spot bot to a multi-user control plane.
//
// A `UserContext` bundles everything one connected user's broker session
// needs (spec §3 ownership: "Runner exclusively owns its Broker Adapter...").
// It is created on `POST /connect` and torn down on `POST /disconnect`; the
// process-wide collaborators (rate limiter, entitlement store, job queue,
// orchestrator) live directly on `AppState` and outlive any single user.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::bootstrap::build_strategy;
use crate::broker::BrokerAdapter;
use crate::config::CoreCfg;
use crate::errors::EngineError;
use crate::journal::Journal;
use crate::lifecycle::LifecycleManager;
use crate::orchestrator::{EntitlementStore, InMemoryJobQueue, JobQueue, Orchestrator, RunnerFactory, StopRunnerRequest};
use crate::persistence::{AppendLog, FileAppendLog, FileKeyValueStore, KeyValueStore};
use crate::placer::BracketPlacer;
use crate::reconcile::Reconciler;
use crate::risk::RiskGuard;
use crate::rpc::{RateLimiter, RpcSession};
use crate::types::{Credentials, Environment, JobStatus};
use crate::validator::OrderValidator;

/// Single-tenant control surface: every HTTP call acts on behalf of this
/// user id. The Orchestrator/Queue/Entitlement layers underneath are fully
/// multi-user already; wiring a real per-caller identity into the HTTP auth
/// layer is future work, left for a proper multi-tenant auth scheme.
pub const DEFAULT_USER_ID: &str = "default";

/// Everything one connected user's broker session needs (spec §4.3/§4.5-4.9).
pub struct UserContext {
    pub session: Arc<RpcSession>,
    pub broker: Arc<BrokerAdapter>,
    pub lifecycle: Arc<LifecycleManager>,
    pub validator: Arc<OrderValidator>,
    pub placer: Arc<BracketPlacer>,
    pub journal: Arc<Journal>,
    pub guard: Arc<RiskGuard>,
    pub reconciler: Arc<Reconciler>,
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub environment: Environment,
    pub session_state: String,
}

type ContextMap = Arc<RwLock<HashMap<String, Arc<UserContext>>>>;

fn to_engine_error(err: anyhow::Error) -> EngineError {
    EngineError::Unknown { message: err.to_string() }
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub cfg: CoreCfg,
    pub data_dir: std::path::PathBuf,
    pub rate_limiter: Arc<RateLimiter>,
    pub entitlements: Arc<EntitlementStore>,
    pub queue: Arc<dyn JobQueue>,
    pub orchestrator: Arc<Orchestrator>,
    contexts: ContextMap,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(cfg: CoreCfg, data_dir: std::path::PathBuf) -> Arc<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(&cfg.rate_limit));
        let entitlements = Arc::new(EntitlementStore::new(&cfg.entitlement));
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::default());
        let contexts: ContextMap = Arc::new(RwLock::new(HashMap::new()));

        let factory_contexts = contexts.clone();
        let risk_cfg = cfg.risk.clone();
        // Only constructs a Runner for a user who has already connected — a
        // Runner binds to an existing Broker Adapter (spec §4.8 step 0); the
        // entitlement/worker-limit checks happen upstream in `start_runner`.
        let factory: RunnerFactory = Arc::new(move |req| {
            let contexts = factory_contexts.read();
            let ctx = contexts
                .get(&req.user_id)
                .ok_or_else(|| EngineError::InvalidParams { message: "user has not connected a broker session".to_string() })?;
            let strategy = build_strategy(&req.strategy_id, &req.config)?;
            Ok(crate::runner::Runner::new(
                ctx.broker.clone(),
                strategy,
                ctx.lifecycle.clone(),
                ctx.validator.clone(),
                ctx.placer.clone(),
                ctx.journal.clone(),
                ctx.guard.clone(),
                req.instrument.clone(),
                risk_cfg.clone(),
            ))
        });

        let orchestrator = Orchestrator::new(queue.clone(), entitlements.clone(), factory, &cfg.orchestrator);

        info!("application state initialized");
        Arc::new(Self { cfg, data_dir, rate_limiter, entitlements, queue, orchestrator, contexts, started_at: Instant::now() })
    }

    fn path_for(&self, user_id: &str, name: &str) -> std::path::PathBuf {
        self.data_dir.join(format!("{user_id}-{name}"))
    }

    /// `POST /connect` (spec §6). Builds and connects a fresh broker session
    /// for `user_id`, replacing any prior one. Credentials are read from the
    /// environment — the core receives decrypted credentials, never a vault
    /// reference (spec §1 Non-goals).
    pub async fn connect(&self, user_id: &str, environment: Environment) -> Result<ConnectionSummary, EngineError> {
        let credentials = Credentials {
            api_key: std::env::var("BROKER_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("BROKER_API_SECRET").unwrap_or_default(),
            environment,
        };

        let session = Arc::new(RpcSession::new(self.cfg.session.clone(), credentials, self.rate_limiter.clone()));
        session.connect().await?;

        let broker = Arc::new(BrokerAdapter::new(session.clone(), &self.cfg.runner));

        std::fs::create_dir_all(&self.data_dir).map_err(|e| EngineError::Unknown { message: format!("failed to create data dir: {e}") })?;
        let kv_store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::open(self.path_for(user_id, "state.json")).map_err(to_engine_error)?);
        let lifecycle = Arc::new(LifecycleManager::new(kv_store));

        let validator = Arc::new(OrderValidator::new(broker.clone(), lifecycle.clone()));

        let account = broker.get_balance("USD").await.unwrap_or(crate::types::AccountSummary {
            currency: "USD".to_string(),
            balance: 0.0,
            equity: 0.0,
            available_funds: 0.0,
            maintenance_margin: 0.0,
            initial_margin: 0.0,
        });
        let guard = Arc::new(RiskGuard::new(account.equity, &self.cfg.risk.guard));

        let journal_log: Arc<dyn AppendLog> = Arc::new(FileAppendLog::open(self.path_for(user_id, "journal.log")).map_err(to_engine_error)?);
        let journal = Arc::new(Journal::new(journal_log));

        let placer = Arc::new(BracketPlacer::new(
            broker.clone(),
            Arc::new(|orphan: crate::errors::OrphanDetected| {
                warn!(
                    transaction_id = %orphan.transaction_id,
                    uncancelled = ?orphan.uncancelled_order_ids,
                    "orphan legs detected after bracket rollback"
                );
            }),
        ));

        let reconciler = Arc::new(Reconciler::new(broker.clone(), lifecycle.clone(), self.cfg.reconcile.clone(), false));

        let ctx = Arc::new(UserContext { session, broker, lifecycle, validator, placer, journal, guard, reconciler, environment });
        self.contexts.write().insert(user_id.to_string(), ctx);
        info!(user_id, ?environment, "user connected");
        Ok(ConnectionSummary { environment, session_state: "active".to_string() })
    }

    /// `POST /disconnect` (spec §6): stop any running jobs for this user,
    /// then drop the broker session.
    pub async fn disconnect(&self, user_id: &str) -> Result<(), EngineError> {
        for job in self.queue.get_user_jobs(user_id) {
            if job.status == JobStatus::Running {
                let _ = self
                    .orchestrator
                    .stop_runner(StopRunnerRequest { user_id: user_id.to_string(), job_id: job.job_id, flatten_positions: false })
                    .await;
            }
        }
        if let Some(ctx) = self.contexts.write().remove(user_id) {
            ctx.session.disconnect().await;
        }
        info!(user_id, "user disconnected");
        Ok(())
    }

    pub fn context(&self, user_id: &str) -> Option<Arc<UserContext>> {
        self.contexts.read().get(user_id).cloned()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.contexts.read().get(user_id).map(|ctx| ctx.session.is_connected()).unwrap_or(false)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
