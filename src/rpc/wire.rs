// =============================================================================
// JSON-RPC 2.0 wire types
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: "2.0", id, method: method.into(), params }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A frame coming off the wire is either a response to a request we sent
/// (carries `id`) or a subscription notification (`method == "subscription"`,
/// no `id`).
#[derive(Debug, Clone, Deserialize)]
pub struct RpcFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcFrame {
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.as_deref() == Some("subscription")
    }

    /// Channel name of a subscription notification, per Deribit's
    /// `params.channel` convention.
    pub fn channel(&self) -> Option<&str> {
        self.params.as_ref()?.get("channel")?.as_str()
    }
}
