//! Mapping RPC outcomes to HTTP responses.
//!
//! # Responsibilities
//! - Forward a worker's response envelope with the right status code
//! - Turn transport failures into `SERVICE_UNAVAILABLE`
//! - Render gateway-originated errors in the same envelope workers use
//!
//! # Design Decisions
//! - The transport never invents a status code; every HTTP mapping lives here
//! - A failed envelope without a usable `statusCode` is a 500

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use super::server::AppState;
use crate::observability::metrics;
use crate::rpc::{RpcRequest, RpcResponse};

/// Where a gateway route sends its request.
#[derive(Debug, Clone, Copy)]
pub struct RouteTarget {
    /// Metrics label.
    pub route: &'static str,
    /// Human name used in `"<service> service unavailable"`.
    pub service: &'static str,
    pub queue: &'static str,
    pub method: &'static str,
    /// Status returned when the worker reports success.
    pub success: StatusCode,
}

/// Error produced by the gateway itself, rendered as a failed envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn service_unavailable(service: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            format!("{service} service unavailable"),
        )
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Endpoint not found")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = RpcResponse::error(self.message, self.code, self.status.as_u16());
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            rejection.body_text(),
        )
    }
}

/// HTTP status for a worker's response envelope.
pub fn status_for(response: &RpcResponse, success: StatusCode) -> StatusCode {
    if response.success {
        return success;
    }
    response
        .error_status()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .filter(|status| status.is_client_error() || status.is_server_error())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Call the route's worker and render the outcome.
pub async fn forward(state: &AppState, target: RouteTarget, params: Value) -> Response {
    let request = RpcRequest::new(target.method, params);

    match state.transport.call(target.queue, &request, None).await {
        Ok(response) => {
            let status = status_for(&response, target.success);
            if !response.success {
                tracing::warn!(
                    route = target.route,
                    method = target.method,
                    status = status.as_u16(),
                    error = response.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                    "Downstream reported failure"
                );
            }
            metrics::record_gateway_request(target.route, status.as_u16());
            (status, Json(response)).into_response()
        }
        Err(e) => {
            tracing::error!(
                route = target.route,
                queue = target.queue,
                method = target.method,
                error = %e,
                "Downstream call failed"
            );
            let error = ApiError::service_unavailable(target.service);
            metrics::record_gateway_request(target.route, error.status.as_u16());
            error.into_response()
        }
    }
}
