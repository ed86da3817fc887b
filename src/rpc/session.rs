// =============================================================================
// RPC Session (C2) — single WebSocket, JSON-RPC 2.0 framing
// =============================================================================
//
// One task owns the socket. Public methods talk to it through a command
// channel and correlate replies through a shared pending-request table,
// mirroring the teacher's `main.rs` pattern of one `tokio::spawn` loop per
// stream rather than sharing a connection across callers. Reconnect,
// heartbeat and auth-refresh all live inside that single task so there is
// never a question of who is allowed to touch the socket.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::SessionCfg;
use crate::errors::EngineError;
use crate::rpc::rate_limiter::RateLimiter;
use crate::rpc::wire::{RpcFrame, RpcRequest};
use crate::types::Credentials;

/// Request correlation timeout (spec §4.2).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Max consecutive reconnect attempts before giving up (state -> Error).
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Max retry attempts for idempotent read methods.
const MAX_READ_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Connecting,
    Active,
    Error,
}

#[derive(Debug, Clone)]
struct AuthTokens {
    access_token: String,
    refresh_token: String,
    expires_at: Instant,
}

type Handler = Arc<dyn Fn(Value) + Send + Sync>;

struct PendingRequest {
    resolver: oneshot::Sender<Result<Value, EngineError>>,
    method: String,
}

enum Command {
    Send(RpcRequest),
    Subscribe(Vec<String>, Handler),
    Disconnect,
}

/// Read-only methods eligible for the RPC layer's own retry policy.
fn is_idempotent_read(method: &str) -> bool {
    matches!(
        method,
        "public/ticker"
            | "public/get_instrument"
            | "public/get_instruments"
            | "private/get_account_summary"
            | "private/get_position"
            | "private/get_positions"
    )
}

struct Shared {
    cfg: SessionCfg,
    credentials: Credentials,
    state_tx: watch::Sender<SessionState>,
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    tokens: RwLock<Option<AuthTokens>>,
    subscriptions: DashMap<String, Handler>,
    last_heartbeat: RwLock<Instant>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

/// JSON-RPC 2.0 session over a single WebSocket connection to the broker.
pub struct RpcSession {
    shared: Arc<Shared>,
    rate_limiter: Arc<RateLimiter>,
    cmd_rx_slot: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("ws_url", &self.shared.cfg.ws_url)
            .field("state", &*self.shared.state_tx.borrow())
            .finish()
    }
}

impl RpcSession {
    pub fn new(cfg: SessionCfg, credentials: Credentials, rate_limiter: Arc<RateLimiter>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Stopped);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        info!(ws_url = %cfg.ws_url, "rpc session created");
        let shared = Arc::new(Shared {
            cfg,
            credentials,
            state_tx,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            tokens: RwLock::new(None),
            subscriptions: DashMap::new(),
            last_heartbeat: RwLock::new(Instant::now()),
            cmd_tx,
        });
        Self { shared, rate_limiter, cmd_rx_slot: Mutex::new(Some(cmd_rx)), task: Mutex::new(None) }
    }

    pub fn current_state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == SessionState::Active
    }

    /// Connect and authenticate; spawns the owning IO task.
    pub async fn connect(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut slot = self.cmd_rx_slot.lock().await;
        let cmd_rx = match slot.take() {
            Some(rx) => rx,
            None => return Ok(()), // already connected
        };
        drop(slot);

        let shared = self.shared.clone();
        let handle = tokio::spawn(io_loop(shared, cmd_rx));
        *self.task.lock().await = Some(handle);

        // Wait for the session to reach Active or Error before returning,
        // so callers observe a deterministic outcome from connect().
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            match *rx.borrow() {
                SessionState::Active => return Ok(()),
                SessionState::Error => {
                    return Err(EngineError::Network { message: "connection failed".into() })
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::Network { message: "session task exited".into() });
            }
        }
    }

    pub async fn disconnect(&self) {
        let _ = self.shared.cmd_tx.send(Command::Disconnect);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.shared.state_tx.send(SessionState::Stopped);
    }

    /// Register a handler for a set of channels; replays on reconnect.
    pub fn subscribe(&self, channels: Vec<String>, handler: impl Fn(Value) + Send + Sync + 'static) {
        let handler: Handler = Arc::new(handler);
        for channel in &channels {
            self.shared.subscriptions.insert(channel.clone(), handler.clone());
        }
        let _ = self.shared.cmd_tx.send(Command::Subscribe(channels, handler));
    }

    /// Issue a JSON-RPC call, applying the process-wide rate limiter and the
    /// RPC layer's own retry policy for idempotent reads.
    pub async fn call_rpc(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let retryable = is_idempotent_read(method);
        let max_attempts = if retryable { MAX_READ_RETRIES } else { 1 };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let shared = self.shared.clone();
            let method_owned = method.to_string();
            let params_clone = params.clone();
            let result = self
                .rate_limiter
                .throttle(move || call_once(shared, method_owned, params_clone))
                .await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if retryable && attempt < max_attempts && err.kind().is_retryable_for_reads() => {
                    let backoff = backoff_duration(attempt);
                    warn!(method, attempt, ?backoff, "retrying idempotent read after error");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn call_once(shared: Arc<Shared>, method: String, params: Value) -> Result<Value, EngineError> {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    shared.pending.insert(id, PendingRequest { resolver: tx, method: method.clone() });

    let request = RpcRequest::new(id, method.clone(), params);
    if shared.cmd_tx.send(Command::Send(request)).is_err() {
        shared.pending.remove(&id);
        return Err(EngineError::Network { message: "session task not running".into() });
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => {
            shared.pending.remove(&id);
            Err(EngineError::Network { message: "session dropped pending request".into() })
        }
        Err(_) => {
            shared.pending.remove(&id);
            Err(EngineError::Timeout { elapsed_ms: REQUEST_TIMEOUT.as_millis() as u64 })
        }
    }
}

fn backoff_duration(attempt: u32) -> Duration {
    let base_secs = 2f64.powi(attempt as i32 - 1).min(30.0);
    let jitter = rand::thread_rng().gen_range(-0.3..=0.3);
    Duration::from_secs_f64((base_secs * (1.0 + jitter)).max(0.05))
}

/// The single task that owns the WebSocket for the lifetime of the session.
/// Handles connect, auth, heartbeat, reconnect-with-backoff, and dispatch of
/// both replies and subscription notifications.
async fn io_loop(shared: Arc<Shared>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut reconnect_attempts = 0u32;

    'reconnect: loop {
        let _ = shared.state_tx.send(SessionState::Connecting);
        let ws_stream = match tokio_tungstenite::connect_async(&shared.cfg.ws_url).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                reconnect_attempts += 1;
                error!(error = %err, attempt = reconnect_attempts, "websocket connect failed");
                if reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                    let _ = shared.state_tx.send(SessionState::Error);
                    return;
                }
                tokio::time::sleep(backoff_duration(reconnect_attempts)).await;
                continue 'reconnect;
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();

        if let Err(err) = authenticate(&shared, &mut ws_write).await {
            error!(error = %err, "authentication failed");
            reconnect_attempts += 1;
            if reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                let _ = shared.state_tx.send(SessionState::Error);
                return;
            }
            tokio::time::sleep(backoff_duration(reconnect_attempts)).await;
            continue 'reconnect;
        }

        reconnect_attempts = 0;
        *shared.last_heartbeat.write() = Instant::now();
        let _ = shared.state_tx.send(SessionState::Active);
        info!("rpc session active");

        resubscribe(&shared, &mut ws_write).await;

        let mut heartbeat_ticker = tokio::time::interval(Duration::from_secs(shared.cfg.heartbeat_interval_secs));
        let mut stale_checker = tokio::time::interval(Duration::from_secs(5));
        let mut refresh_checker = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send(req)) => {
                            if let Err(err) = send_request(&mut ws_write, &req).await {
                                warn!(error = %err, "failed to send rpc request");
                                if let Some((_, pending)) = shared.pending.remove(&req.id) {
                                    let _ = pending.resolver.send(Err(EngineError::Network {
                                        message: err.to_string(),
                                    }));
                                }
                                break;
                            }
                        }
                        Some(Command::Subscribe(channels, _handler)) => {
                            let _ = subscribe_channels(&mut ws_write, &shared, &channels).await;
                        }
                        Some(Command::Disconnect) | None => {
                            let _ = ws_write.send(Message::Close(None)).await;
                            let _ = shared.state_tx.send(SessionState::Stopped);
                            return;
                        }
                    }
                }
                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            *shared.last_heartbeat.write() = Instant::now();
                            dispatch_frame(&shared, &text);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("websocket closed by peer, reconnecting");
                            break;
                        }
                        Some(Ok(_)) => {
                            *shared.last_heartbeat.write() = Instant::now();
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket read error, reconnecting");
                            break;
                        }
                    }
                }
                _ = heartbeat_ticker.tick() => {
                    let req = RpcRequest::new(
                        shared.next_id.fetch_add(1, Ordering::SeqCst),
                        "public/test",
                        json!({}),
                    );
                    let _ = send_request(&mut ws_write, &req).await;
                }
                _ = stale_checker.tick() => {
                    let stale = shared.last_heartbeat.read().elapsed()
                        > Duration::from_secs(shared.cfg.heartbeat_stale_secs);
                    if stale {
                        warn!("connection stale, forcing reconnect");
                        break;
                    }
                }
                _ = refresh_checker.tick() => {
                    let due = shared.tokens.read().as_ref()
                        .is_some_and(|t| Instant::now() >= t.expires_at);
                    if due {
                        if let Err(err) = refresh_tokens(&shared, &mut ws_write).await {
                            warn!(error = %err, "token refresh failed");
                        }
                    }
                }
            }
        }

        fail_all_pending(&shared, "connection lost");
    }
}

async fn send_request(
    ws_write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    req: &RpcRequest,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(req)?;
    ws_write.send(Message::Text(text)).await?;
    Ok(())
}

/// Send a `public/auth` request and await its correlated reply, installing
/// tokens on success. Registers in `shared.pending` exactly like a normal
/// `call_rpc` so `dispatch_frame` has somewhere to deliver the response —
/// auth and refresh are otherwise ordinary RPCs, not a special channel.
async fn send_auth(
    shared: &Arc<Shared>,
    ws_write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    params: Value,
) -> anyhow::Result<()> {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    shared.pending.insert(id, PendingRequest { resolver: tx, method: "public/auth".to_string() });

    let req = RpcRequest::new(id, "public/auth", params);
    if let Err(err) = send_request(ws_write, &req).await {
        shared.pending.remove(&id);
        return Err(err);
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(err))) => Err(anyhow::anyhow!(err)),
        Ok(Err(_)) => {
            shared.pending.remove(&id);
            Err(anyhow::anyhow!("session dropped pending auth request"))
        }
        Err(_) => {
            shared.pending.remove(&id);
            Err(anyhow::anyhow!("auth request timed out"))
        }
    }
}

async fn authenticate(
    shared: &Arc<Shared>,
    ws_write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) -> anyhow::Result<()> {
    send_auth(
        shared,
        ws_write,
        json!({
            "grant_type": "client_credentials",
            "client_id": shared.credentials.api_key,
            "client_secret": shared.credentials.api_secret,
        }),
    )
    .await
}

/// Refresh the access token via the `refresh_token` grant (spec §4.2: "refresh
/// when `now >= expiresAt - 60s`").
async fn refresh_tokens(
    shared: &Arc<Shared>,
    ws_write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) -> anyhow::Result<()> {
    let refresh_token = shared.tokens.read().as_ref().map(|t| t.refresh_token.clone());
    let Some(refresh_token) = refresh_token else { return Ok(()) };
    debug!("refreshing access token");
    send_auth(shared, ws_write, json!({ "grant_type": "refresh_token", "refresh_token": refresh_token })).await
}

async fn resubscribe(
    shared: &Arc<Shared>,
    ws_write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) {
    let channels: Vec<String> = shared.subscriptions.iter().map(|e| e.key().clone()).collect();
    if channels.is_empty() {
        return;
    }
    let _ = subscribe_channels(ws_write, shared, &channels).await;
}

async fn subscribe_channels(
    ws_write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    shared: &Arc<Shared>,
    channels: &[String],
) -> anyhow::Result<()> {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let req = RpcRequest::new(id, "private/subscribe", json!({ "channels": channels }));
    send_request(ws_write, &req).await
}

fn dispatch_frame(shared: &Arc<Shared>, text: &str) {
    let frame: RpcFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(err) => {
            debug!(error = %err, "failed to parse rpc frame");
            return;
        }
    };

    if frame.is_notification() {
        if let Some(channel) = frame.channel() {
            if let Some(handler) = shared.subscriptions.get(channel) {
                if let Some(params) = &frame.params {
                    handler(params.clone());
                }
            }
        }
        return;
    }

    let Some(id) = frame.id else { return };
    if let Some((_, pending)) = shared.pending.remove(&id) {
        let result = match frame.error {
            Some(err) => Err(EngineError::from_rpc_error(err.code, &err.message)),
            None => Ok(frame.result.unwrap_or(Value::Null)),
        };

        if pending.method == "public/auth" {
            if let Ok(value) = &result {
                install_tokens(shared, value);
            }
        }

        let _ = pending.resolver.send(result);
    }
}

fn install_tokens(shared: &Arc<Shared>, result: &Value) {
    let access_token = result.get("access_token").and_then(|v| v.as_str());
    let refresh_token = result.get("refresh_token").and_then(|v| v.as_str());
    let expires_in = result.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(600);
    if let (Some(access_token), Some(refresh_token)) = (access_token, refresh_token) {
        *shared.tokens.write() = Some(AuthTokens {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
    }
}

fn fail_all_pending(shared: &Arc<Shared>, reason: &str) {
    let ids: Vec<u64> = shared.pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, pending)) = shared.pending.remove(&id) {
            let _ = pending.resolver.send(Err(EngineError::Network { message: reason.to_string() }));
        }
    }
}

/// Diagnostic snapshot of the session's book-keeping state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub pending_requests: usize,
    pub subscribed_channels: Vec<String>,
}

impl RpcSession {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.current_state(),
            pending_requests: self.shared.pending.len(),
            subscribed_channels: self.shared.subscriptions.iter().map(|e| e.key().clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_reads_are_classified_correctly() {
        assert!(is_idempotent_read("public/ticker"));
        assert!(is_idempotent_read("private/get_account_summary"));
        assert!(!is_idempotent_read("private/buy"));
        assert!(!is_idempotent_read("private/cancel"));
    }

    #[test]
    fn backoff_is_capped_at_30_seconds_before_jitter() {
        let d = backoff_duration(10);
        assert!(d.as_secs_f64() <= 30.0 * 1.3 + 0.01);
    }

    #[test]
    fn fresh_session_starts_stopped() {
        let cfg = SessionCfg::default();
        let creds = Credentials {
            api_key: "k".into(),
            api_secret: "s".into(),
            environment: crate::types::Environment::Testnet,
        };
        let limiter = Arc::new(RateLimiter::new(&crate::config::RateLimitCfg::default()));
        let session = RpcSession::new(cfg, creds, limiter);
        assert_eq!(session.current_state(), SessionState::Stopped);
        assert!(!session.is_connected());
    }
}
