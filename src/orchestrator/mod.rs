// =============================================================================
// Orchestrator (C10) — multi-user job queue, tier limits, runner registry
// =============================================================================
//
// Ties the Job Queue and the Entitlement Store to a live registry of running
// Strategy Runners. Grounded on the teacher's `AppState` pattern of a single
// struct owning `Arc`'d collaborators behind locks, generalized from one
// hardwired symbol loop to admitting arbitrary per-user jobs.
//
// The orchestrator does not know how to build a Runner — that requires a
// broker session, credentials and a concrete strategy, all user-specific.
// Bootstrap supplies a `RunnerFactory` closure; the orchestrator only ever
// calls it after entitlement checks pass.
// =============================================================================

pub mod entitlement;
pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::OrchestratorCfg;
use crate::errors::EngineError;
use crate::runner::Runner;
use crate::types::{Job, JobStatus};

pub use entitlement::EntitlementStore;
pub use queue::{InMemoryJobQueue, JobQueue, QueueStats};

#[derive(Debug, Clone)]
pub struct StartRunnerRequest {
    pub user_id: String,
    pub strategy_id: String,
    pub instrument: String,
    pub broker_id: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartRunnerResult {
    pub job_id: String,
}

#[derive(Debug, Clone)]
pub struct StopRunnerRequest {
    pub user_id: String,
    pub job_id: String,
    pub flatten_positions: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub workers: Vec<Job>,
    pub queue_stats: QueueStats,
}

/// Builds a fully-wired `Runner` for one admitted job. Supplied by bootstrap,
/// since only it knows how to resolve a user's broker credentials.
pub type RunnerFactory = Arc<dyn Fn(&StartRunnerRequest) -> Result<Arc<Runner>, EngineError> + Send + Sync>;

struct RunningWorker {
    runner: Arc<Runner>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    queue: Arc<dyn JobQueue>,
    entitlements: Arc<EntitlementStore>,
    factory: RunnerFactory,
    workers: Mutex<HashMap<String, RunningWorker>>,
    shutdown_grace: Duration,
}

impl Orchestrator {
    pub fn new(queue: Arc<dyn JobQueue>, entitlements: Arc<EntitlementStore>, factory: RunnerFactory, cfg: &OrchestratorCfg) -> Arc<Self> {
        Arc::new(Self {
            queue,
            entitlements,
            factory,
            workers: Mutex::new(HashMap::new()),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
        })
    }

    fn running_worker_count(&self, user_id: &str) -> u32 {
        self.queue
            .get_user_jobs(user_id)
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count() as u32
    }

    /// Admit a job (spec §4.10): entitlement check, then spawn the runner.
    #[instrument(skip(self, req), fields(user_id = %req.user_id, instrument = %req.instrument))]
    pub fn start_runner(&self, req: StartRunnerRequest) -> Result<StartRunnerResult, EngineError> {
        let entitlement = self
            .entitlements
            .check_startable(&req.user_id)
            .map_err(|reason| EngineError::InvalidParams { message: reason })?;

        if self.running_worker_count(&req.user_id) >= entitlement.max_workers {
            return Err(EngineError::InvalidParams {
                message: format!("tier '{:?}' worker limit ({}) reached", entitlement.tier, entitlement.max_workers),
            });
        }

        let runner = (self.factory)(&req)?;

        let job_id = Uuid::new_v4().to_string();
        let job = Job {
            job_id: job_id.clone(),
            user_id: req.user_id.clone(),
            strategy_id: req.strategy_id.clone(),
            broker_id: req.broker_id.clone(),
            config_snapshot: req.config.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
        };
        self.queue.enqueue(job);

        let (stop_tx, stop_rx) = watch::channel(false);
        let queue = self.queue.clone();
        let job_id_for_task = job_id.clone();
        let runner_for_task = runner.clone();
        let handle = tokio::spawn(async move {
            let result = runner_for_task.run(stop_rx).await;
            let status = match result {
                Ok(()) => JobStatus::Stopped,
                Err(err) => {
                    warn!(job_id = %job_id_for_task, error = %err, "runner exited with error");
                    JobStatus::Crashed
                }
            };
            queue.update_status(&job_id_for_task, status);
        });

        self.queue.update_status(&job_id, JobStatus::Running);
        self.workers.lock().insert(job_id.clone(), RunningWorker { runner, stop_tx, handle });
        info!(job_id = %job_id, "runner admitted and started");
        Ok(StartRunnerResult { job_id })
    }

    /// Stop a running job (spec §4.10: reject if `job.userId != request.userId`).
    #[instrument(skip(self), fields(job_id = %req.job_id))]
    pub async fn stop_runner(&self, req: StopRunnerRequest) -> Result<(), EngineError> {
        let job = self
            .queue
            .get_job(&req.job_id)
            .ok_or_else(|| EngineError::InvalidParams { message: format!("unknown job '{}'", req.job_id) })?;

        if job.user_id != req.user_id {
            return Err(EngineError::InvalidParams { message: "job does not belong to this user".to_string() });
        }

        let worker = self.workers.lock().remove(&req.job_id);
        let Some(worker) = worker else {
            // Already stopped or never started — idempotent no-op.
            self.queue.update_status(&req.job_id, JobStatus::Stopped);
            return Ok(());
        };

        if req.flatten_positions {
            worker.runner.request_flatten();
        }
        let _ = worker.stop_tx.send(true);

        if tokio::time::timeout(self.shutdown_grace, worker.handle).await.is_err() {
            warn!(job_id = %req.job_id, "runner did not stop within the grace period");
        }
        self.queue.update_status(&req.job_id, JobStatus::Stopped);
        Ok(())
    }

    /// `getStatus({userId?})` (spec §4.10).
    pub fn get_status(&self, user_id: Option<&str>) -> StatusReport {
        let workers = match user_id {
            Some(u) => self.queue.get_user_jobs(u),
            None => self.queue.get_all_jobs(),
        };
        StatusReport { workers, queue_stats: self.queue.get_stats() }
    }

    /// `POST /killswitch` (spec §6): stop every running worker, flattening
    /// positions, and report the jobs it acted on. Idempotent — a second
    /// call with no running workers is a no-op.
    pub async fn killswitch(&self) -> Vec<String> {
        let job_ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        let mut stopped = Vec::new();
        for job_id in job_ids {
            let Some(job) = self.queue.get_job(&job_id) else { continue };
            if self
                .stop_runner(StopRunnerRequest { user_id: job.user_id, job_id: job_id.clone(), flatten_positions: true })
                .await
                .is_ok()
            {
                stopped.push(job_id);
            }
        }
        stopped
    }

    /// Periodic entitlement downgrade sweep (spec §4.10).
    pub fn downgrade_sweep(&self) -> Vec<String> {
        self.entitlements.downgrade_sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntitlementCfg;

    fn fresh_orchestrator(factory_ok: bool) -> Arc<Orchestrator> {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::default());
        let entitlements = Arc::new(EntitlementStore::new(&EntitlementCfg::default()));
        let factory: RunnerFactory = if factory_ok {
            Arc::new(|_req: &StartRunnerRequest| Err(EngineError::Unknown { message: "test runners are not constructed in unit tests".to_string() }))
        } else {
            Arc::new(|_req: &StartRunnerRequest| Err(EngineError::Network { message: "forced failure".to_string() }))
        };
        Orchestrator::new(queue, entitlements, factory, &OrchestratorCfg::default())
    }

    fn req(user: &str) -> StartRunnerRequest {
        StartRunnerRequest {
            user_id: user.to_string(),
            strategy_id: "momentum-ema-rsi".to_string(),
            instrument: "BTC-PERP".to_string(),
            broker_id: "default".to_string(),
            config: serde_json::json!({}),
        }
    }

    #[test]
    fn start_runner_propagates_factory_errors() {
        let orch = fresh_orchestrator(true);
        let err = orch.start_runner(req("u1")).unwrap_err();
        assert!(matches!(err, EngineError::Unknown { .. }));
    }

    #[test]
    fn stop_runner_rejects_when_job_owned_by_another_user() {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::default());
        queue.enqueue(Job {
            job_id: "job-1".to_string(),
            user_id: "owner".to_string(),
            strategy_id: "s".to_string(),
            broker_id: "b".to_string(),
            config_snapshot: serde_json::json!({}),
            status: JobStatus::Running,
            created_at: Utc::now(),
        });
        let entitlements = Arc::new(EntitlementStore::new(&EntitlementCfg::default()));
        let factory: RunnerFactory = Arc::new(|_: &StartRunnerRequest| Err(EngineError::Unknown { message: "unused".to_string() }));
        let orch = Orchestrator::new(queue, entitlements, factory, &OrchestratorCfg::default());

        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(orch.stop_runner(StopRunnerRequest {
            user_id: "intruder".to_string(),
            job_id: "job-1".to_string(),
            flatten_positions: false,
        }));
        assert!(matches!(result, Err(EngineError::InvalidParams { .. })));
    }

    #[test]
    fn get_status_filters_by_user() {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::default());
        queue.enqueue(Job {
            job_id: "1".to_string(),
            user_id: "u1".to_string(),
            strategy_id: "s".to_string(),
            broker_id: "b".to_string(),
            config_snapshot: serde_json::json!({}),
            status: JobStatus::Running,
            created_at: Utc::now(),
        });
        queue.enqueue(Job {
            job_id: "2".to_string(),
            user_id: "u2".to_string(),
            strategy_id: "s".to_string(),
            broker_id: "b".to_string(),
            config_snapshot: serde_json::json!({}),
            status: JobStatus::Running,
            created_at: Utc::now(),
        });
        let entitlements = Arc::new(EntitlementStore::new(&EntitlementCfg::default()));
        let factory: RunnerFactory = Arc::new(|_: &StartRunnerRequest| Err(EngineError::Unknown { message: "unused".to_string() }));
        let orch = Orchestrator::new(queue, entitlements, factory, &OrchestratorCfg::default());

        let report = orch.get_status(Some("u1"));
        assert_eq!(report.workers.len(), 1);
        assert_eq!(report.workers[0].job_id, "1");
    }
}
