//! Wire envelopes exchanged over the work and reply queues.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request published to a durable work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Error detail carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcErrorBody {
    pub code: String,
    pub message: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Reply published by a worker to the caller's reply queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn now_rfc3339() -> Option<String> {
    Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

impl RpcResponse {
    pub fn success(data: Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
            error: None,
            timestamp: now_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>, status_code: u16) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(RpcErrorBody {
                code: code.into(),
                message: message.into(),
                status_code,
                details: None,
            }),
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }

    /// Status code reported by a failed response, if any.
    pub fn error_status(&self) -> Option<u16> {
        self.error.as_ref().map(|e| e.status_code)
    }
}
