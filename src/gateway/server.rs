//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the axum Router with the gateway route table
//! - Wire up middleware (tracing, limits, request ID, timeout)
//! - Serve on a bound listener until the shutdown future resolves

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::config::schema::HttpConfig;
use crate::rpc::RpcTransport;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<RpcTransport>,
}

/// HTTP front end for the quiz services.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(config: &HttpConfig, transport: Arc<RpcTransport>) -> Self {
        let state = AppState { transport };
        Self {
            router: build_router(config, state),
        }
    }

    /// The fully layered router, for driving in-process.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server on `listener` until `shutdown` completes.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(config: &HttpConfig, state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/circuit-breaker/status", get(handlers::breaker_status))
        .route("/auth/register", post(handlers::register))
        .route("/auth/login", post(handlers::login))
        .route("/game/start", post(handlers::start_game))
        .route("/game/{game_id}/submit", post(handlers::submit_answer))
        .route("/game/{game_id}/join", put(handlers::join_game))
        .route("/game/{game_id}/end", get(handlers::end_game))
        .route("/result/me/{game_id}", get(handlers::player_result))
        .route("/player/all/{game_id}", get(handlers::game_result))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
