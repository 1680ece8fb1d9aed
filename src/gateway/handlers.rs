//! Route handlers.
//!
//! Each handler builds the worker's `params` and hands off to
//! [`forward`](super::response::forward).

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::caller::Caller;
use super::response::{forward, ApiError, RouteTarget};
use super::server::AppState;
use crate::observability::metrics;
use crate::rpc::{ConnectionHealth, RpcResponse};

const AUTH: &str = "Authentication";
const GAME: &str = "Game";
const PLAYERS: &str = "Players";

pub const REGISTER: RouteTarget = RouteTarget {
    route: "auth_register",
    service: AUTH,
    queue: "auth_queue",
    method: "register",
    success: StatusCode::CREATED,
};

pub const LOGIN: RouteTarget = RouteTarget {
    route: "auth_login",
    service: AUTH,
    queue: "auth_queue",
    method: "login",
    success: StatusCode::OK,
};

pub const START_GAME: RouteTarget = RouteTarget {
    route: "game_start",
    service: GAME,
    queue: "game_queue",
    method: "startGame",
    success: StatusCode::CREATED,
};

pub const SUBMIT_ANSWER: RouteTarget = RouteTarget {
    route: "game_submit",
    service: GAME,
    queue: "game_queue",
    method: "submitAnswer",
    success: StatusCode::OK,
};

pub const JOIN_GAME: RouteTarget = RouteTarget {
    route: "game_join",
    service: GAME,
    queue: "game_queue",
    method: "joinGame",
    success: StatusCode::OK,
};

pub const END_GAME: RouteTarget = RouteTarget {
    route: "game_end",
    service: GAME,
    queue: "game_queue",
    method: "endGame",
    success: StatusCode::OK,
};

pub const PLAYER_RESULT: RouteTarget = RouteTarget {
    route: "result_me",
    service: PLAYERS,
    queue: "players_queue",
    method: "getPlayerResult",
    success: StatusCode::OK,
};

pub const GAME_RESULT: RouteTarget = RouteTarget {
    route: "player_all",
    service: PLAYERS,
    queue: "players_queue",
    method: "getGameResult",
    success: StatusCode::OK,
};

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub name: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct StartGameBody {
    #[serde(default)]
    pub name: Option<String>,
    pub difficulty: u32,
}

#[derive(Debug, Deserialize)]
pub struct SubmitAnswerBody {
    pub answer: f64,
}

pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    tracing::info!(username = %body.username, "Register request");
    let params = json!({
        "name": body.name,
        "username": body.username,
        "password": body.password,
    });
    Ok(forward(&state, REGISTER, params).await)
}

pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    tracing::info!(username = %body.username, "Login request");
    let params = json!({
        "username": body.username,
        "password": body.password,
    });
    Ok(forward(&state, LOGIN, params).await)
}

pub async fn start_game(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<StartGameBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    tracing::info!(
        player_id = %caller.player_id,
        difficulty = body.difficulty,
        "Start game request"
    );
    let params = json!({
        "playerId": caller.player_id,
        "name": body.name.or(caller.name),
        "difficulty": body.difficulty,
    });
    Ok(forward(&state, START_GAME, params).await)
}

pub async fn submit_answer(
    State(state): State<AppState>,
    caller: Caller,
    Path(game_id): Path<String>,
    body: Result<Json<SubmitAnswerBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    tracing::info!(game_id = %game_id, player_id = %caller.player_id, "Submit answer request");
    let params = json!({
        "gameId": game_id,
        "playerId": caller.player_id,
        "answer": body.answer,
    });
    Ok(forward(&state, SUBMIT_ANSWER, params).await)
}

pub async fn join_game(
    State(state): State<AppState>,
    caller: Caller,
    Path(game_id): Path<String>,
) -> Response {
    tracing::info!(game_id = %game_id, player_id = %caller.player_id, "Join game request");
    let params = json!({
        "gameId": game_id,
        "playerId": caller.player_id,
        "playerName": caller.name,
    });
    forward(&state, JOIN_GAME, params).await
}

pub async fn end_game(
    State(state): State<AppState>,
    caller: Caller,
    Path(game_id): Path<String>,
) -> Response {
    tracing::info!(game_id = %game_id, requested_by = %caller.player_id, "End game request");
    forward(&state, END_GAME, json!({ "gameId": game_id })).await
}

pub async fn player_result(
    State(state): State<AppState>,
    caller: Caller,
    Path(game_id): Path<String>,
) -> Response {
    let params = json!({
        "gameId": game_id,
        "playerId": caller.player_id,
    });
    forward(&state, PLAYER_RESULT, params).await
}

pub async fn game_result(
    State(state): State<AppState>,
    caller: Caller,
    Path(game_id): Path<String>,
) -> Response {
    tracing::debug!(game_id = %game_id, requested_by = %caller.player_id, "Game results request");
    forward(&state, GAME_RESULT, json!({ "gameId": game_id })).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub circuit_breaker: ConnectionHealth,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let connection = state.transport.connection();
    let (status, label) = if connection.is_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    let body = HealthStatus {
        status: label,
        service: "quiz-gateway",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        circuit_breaker: connection.health(),
    };
    (status, Json(body)).into_response()
}

pub async fn breaker_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let connection = state.transport.connection();
    if !connection.is_connected() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Broker not connected",
        ));
    }
    let health = serde_json::to_value(connection.health()).map_err(|e| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
    })?;
    Ok(Json(RpcResponse::success(health, "Circuit breaker status")).into_response())
}

pub async fn not_found(uri: Uri) -> ApiError {
    tracing::warn!(path = %uri.path(), "Endpoint not found");
    metrics::record_gateway_request("not_found", StatusCode::NOT_FOUND.as_u16());
    ApiError::not_found()
}
