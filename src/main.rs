// =============================================================================
// Derivatives Execution Engine — Main Entry Point
// =============================================================================
//
// Bootstrap sequence (spec §9 "singleton with lazy init" → explicit owner):
// load config, build `AppState` once, mount the HTTP control surface, spawn
// the periodic reconciliation + entitlement sweep loop, then wait for a
// shutdown signal and drain every running job within the configured grace
// period before exiting (spec §5/§6).
// =============================================================================

mod api;
mod app_state;
mod bootstrap;
mod broker;
mod config;
mod errors;
mod journal;
mod lifecycle;
mod market_data;
mod orchestrator;
mod persistence;
mod placer;
mod reconcile;
mod risk;
mod rpc;
mod runner;
mod strategy;
mod types;
mod validator;

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, DEFAULT_USER_ID};
use crate::config::CoreCfg;
use crate::orchestrator::StopRunnerRequest;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level())))
        .init();

    info!("derivatives execution engine starting up");

    match run().await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::from(0)
        }
        Err(err) => {
            error!(error = %err, "fatal startup error");
            ExitCode::from(1)
        }
    }
}

fn log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

async fn run() -> anyhow::Result<()> {
    let config_path = std::env::var("CORE_CONFIG_PATH").unwrap_or_else(|_| "core-config.json".to_string());
    let cfg = CoreCfg::load_or_default(&config_path);

    let data_dir = std::env::var("CORE_DATA_DIR").map(std::path::PathBuf::from).unwrap_or_else(|_| std::path::PathBuf::from("./data"));
    std::fs::create_dir_all(&data_dir)?;

    let state = AppState::new(cfg, data_dir);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let bind_addr = format!("{host}:{port}");

    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP control surface listening");

    let server_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "HTTP server exited unexpectedly");
        }
    });

    let reconcile_state = state.clone();
    let reconcile_handle = tokio::spawn(async move { reconcile_loop(reconcile_state).await });

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining runners");

    shutdown(&state).await;

    reconcile_handle.abort();
    server_handle.abort();

    Ok(())
}

/// Periodic reconciliation (spec §4.7) and entitlement downgrade sweep
/// (spec §4.10), run once per `cfg.reconcile.interval_secs` for every
/// connected user.
async fn reconcile_loop(state: Arc<AppState>) {
    let interval_secs = state.cfg.reconcile.interval_secs.max(1);
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;

        if let Some(ctx) = state.context(DEFAULT_USER_ID) {
            match ctx.reconciler.reconcile_once().await {
                Ok(report) if !report.is_clean() => info!(?report, "reconciliation pass took action"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "reconciliation pass failed"),
            }
        }

        let downgraded = state.orchestrator.downgrade_sweep();
        if !downgraded.is_empty() {
            info!(?downgraded, "entitlement downgrade sweep demoted users to free tier");
        }
    }
}

/// Graceful shutdown (spec §5/§6): stop admitting new jobs is implicit once
/// the server task is aborted; every running job is asked to stop (without
/// flattening — an operator-initiated SIGTERM is not a killswitch) and given
/// `shutdown_grace_secs` before the process exits regardless.
async fn shutdown(state: &Arc<AppState>) {
    let grace = std::time::Duration::from_secs(state.cfg.orchestrator.shutdown_grace_secs);
    let jobs = state.orchestrator.get_status(None).workers;

    let drain = async {
        for job in jobs {
            if job.status != crate::types::JobStatus::Running {
                continue;
            }
            let result = state
                .orchestrator
                .stop_runner(StopRunnerRequest { user_id: job.user_id.clone(), job_id: job.job_id.clone(), flatten_positions: false })
                .await;
            if let Err(err) = result {
                warn!(job_id = %job.job_id, error = %err, "failed to stop runner during shutdown");
            }
        }
    };

    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("graceful shutdown exceeded grace period");
    }
}
