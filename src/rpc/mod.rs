// =============================================================================
// RPC layer — wire types (C0), rate limiter (C1), session (C2)
// =============================================================================

pub mod rate_limiter;
pub mod session;
pub mod wire;

pub use rate_limiter::{RateLimiter, RateLimiterSnapshot};
pub use session::{RpcSession, SessionSnapshot, SessionState};
pub use wire::{RpcError, RpcFrame, RpcRequest};
