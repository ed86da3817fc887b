// =============================================================================
// Normalized Error Taxonomy — see spec §4.2 / §7
// =============================================================================
//
// Every user-visible failure carries a stable machine-readable `kind`, a
// human message, and (where applicable) a structured `details` payload.
// Transport-layer classification (NETWORK_ERROR, TIMEOUT_ERROR, ...) lives
// here so the RPC session's retry policy and the HTTP control surface both
// consult the same table.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable, machine-readable category for every engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NetworkError,
    AuthenticationError,
    InvalidParams,
    InsufficientFunds,
    InsufficientMargin,
    RateLimit,
    ServerError,
    TimeoutError,
    WebsocketError,
    LeverageExceeded,
    AmountTooSmall,
    PositionAlreadyExists,
    SingleStrategyViolation,
    InvalidStateTransition,
    UnknownError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::InsufficientMargin => "INSUFFICIENT_MARGIN",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServerError => "SERVER_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::WebsocketError => "WEBSOCKET_ERROR",
            Self::LeverageExceeded => "LEVERAGE_EXCEEDED",
            Self::AmountTooSmall => "AMOUNT_TOO_SMALL",
            Self::PositionAlreadyExists => "POSITION_ALREADY_EXISTS",
            Self::SingleStrategyViolation => "SINGLE_STRATEGY_VIOLATION",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::UnknownError => "UNKNOWN_ERROR",
        };
        write!(f, "{s}")
    }
}

impl ErrorKind {
    /// Whether the RPC layer may retry a read-only call that failed with this
    /// kind (spec §4.2: only transient transport/server faults qualify).
    pub fn is_retryable_for_reads(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::TimeoutError | Self::ServerError | Self::WebsocketError
        )
    }
}

/// Top-level engine error. Every variant maps to exactly one [`ErrorKind`].
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("invalid params: {message}")]
    InvalidParams { message: String },

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("rate limited")]
    RateLimit,

    #[error("server error: {message}")]
    Server { message: String },

    #[error("request timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("websocket error: {message}")]
    Websocket { message: String },

    #[error("leverage exceeded: calculated {calculated:.2}x, max {max:.2}x")]
    LeverageExceeded { calculated: f64, max: f64 },

    #[error("amount too small: {amount} < minimum {minimum}")]
    AmountTooSmall { amount: f64, minimum: f64 },

    #[error("a position already exists on {instrument}")]
    PositionAlreadyExists { instrument: String },

    #[error("single-strategy guard violated: '{active}' is already running")]
    SingleStrategyViolation { active: String },

    #[error("invalid state transition: {from} --{event}--> (no such edge)")]
    InvalidStateTransition { from: String, event: String },

    #[error("{message}")]
    Unknown { message: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::NetworkError,
            Self::Authentication { .. } => ErrorKind::AuthenticationError,
            Self::InvalidParams { .. } => ErrorKind::InvalidParams,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::InsufficientMargin { .. } => ErrorKind::InsufficientMargin,
            Self::RateLimit => ErrorKind::RateLimit,
            Self::Server { .. } => ErrorKind::ServerError,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::Websocket { .. } => ErrorKind::WebsocketError,
            Self::LeverageExceeded { .. } => ErrorKind::LeverageExceeded,
            Self::AmountTooSmall { .. } => ErrorKind::AmountTooSmall,
            Self::PositionAlreadyExists { .. } => ErrorKind::PositionAlreadyExists,
            Self::SingleStrategyViolation { .. } => ErrorKind::SingleStrategyViolation,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::Unknown { .. } => ErrorKind::UnknownError,
        }
    }

    /// Structured `details` object for API responses, where applicable.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InsufficientFunds { required, available } => Some(serde_json::json!({
                "required": required,
                "available": available,
            })),
            Self::InsufficientMargin { required, available } => Some(serde_json::json!({
                "required": required,
                "available": available,
            })),
            Self::LeverageExceeded { calculated, max } => Some(serde_json::json!({
                "calculated": calculated,
                "max": max,
            })),
            Self::AmountTooSmall { amount, minimum } => Some(serde_json::json!({
                "amount": amount,
                "minimum": minimum,
            })),
            _ => None,
        }
    }

    /// Classify a JSON-RPC error code/message pair from the broker wire into
    /// an [`EngineError`], per spec §4.2's code table.
    pub fn from_rpc_error(code: i64, message: &str) -> Self {
        let lower = message.to_lowercase();
        if (10000..=10999).contains(&code) {
            return Self::Authentication { message: message.to_string() };
        }
        if code == 10009 || lower.contains("insufficient") {
            return Self::InsufficientFunds { required: 0.0, available: 0.0 };
        }
        if code == 10028 || lower.contains("rate limit") {
            return Self::RateLimit;
        }
        if code == -32602 {
            return Self::InvalidParams { message: message.to_string() };
        }
        if matches!(code, -32000 | -32603 | 500 | 502 | 503) {
            return Self::Server { message: message.to_string() };
        }
        Self::Unknown { message: message.to_string() }
    }
}

/// Structured, warning-level event emitted when the placer's rollback could
/// not fully clean up after a failed bracket (spec §4.5/§7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanDetected {
    pub transaction_id: String,
    pub uncancelled_order_ids: Vec<String>,
}
