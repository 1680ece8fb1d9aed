//! Gateway routes driven in-process with `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use quiz_gateway::broker::memory::MemoryBroker;
use quiz_gateway::config::schema::{CircuitBreakerConfig, HttpConfig};
use quiz_gateway::gateway::{build_router, AppState, X_PLAYER_ID, X_PLAYER_NAME};
use quiz_gateway::rpc::{HandlerError, MethodRouter, RpcResponse};
use quiz_gateway::RpcTransport;

async fn app(broker: &MemoryBroker, timeout_ms: u64) -> (Router, Arc<RpcTransport>) {
    let transport =
        common::transport(broker, &[], CircuitBreakerConfig::default(), timeout_ms).await;
    let router = build_router(
        &HttpConfig::default(),
        AppState {
            transport: transport.clone(),
        },
    );
    (router, transport)
}

fn auth_router() -> MethodRouter {
    MethodRouter::new()
        .route("register", |params: Value| async move {
            Ok::<_, HandlerError>(RpcResponse::success(
                json!({"username": params["username"]}),
                "User registered",
            ))
        })
        .route("login", |_: Value| async move {
            Ok::<_, HandlerError>(RpcResponse::error("Invalid credentials", "INVALID_CREDENTIALS", 401))
        })
}

fn request(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder().method(method).uri(uri)
}

fn as_player(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header(X_PLAYER_ID, "player-7").header(X_PLAYER_NAME, "Ada")
}

fn json_body(builder: axum::http::request::Builder, body: Value) -> Request<Body> {
    builder
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_register_forwards_and_returns_created() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;
    let worker = common::spawn_worker(&broker, "auth_queue", auth_router()).await;

    let (status, body) = send(
        &router,
        json_body(
            request(Method::POST, "/auth/register"),
            json!({"name": "Ada", "username": "ada", "password": "s3cret!"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["username"], json!("ada"));
    worker.stop().await;
}

#[tokio::test]
async fn test_downstream_error_status_is_passed_through() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;
    let worker = common::spawn_worker(&broker, "auth_queue", auth_router()).await;

    let (status, body) = send(
        &router,
        json_body(
            request(Method::POST, "/auth/login"),
            json!({"username": "ada", "password": "wrong"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], json!("INVALID_CREDENTIALS"));
    worker.stop().await;
}

#[tokio::test]
async fn test_invalid_body_is_rejected_before_any_rpc() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;

    let (status, body) = send(
        &router,
        json_body(request(Method::POST, "/auth/login"), json!({"username": "ada"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("VALIDATION_ERROR"));
    assert_eq!(broker.queue_len("auth_queue"), 0);
}

#[tokio::test]
async fn test_protected_route_requires_identity() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;

    let (status, body) = send(
        &router,
        json_body(request(Method::POST, "/game/start"), json!({"difficulty": 2})),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], json!("UNAUTHORIZED"));
    assert_eq!(broker.queue_len("game_queue"), 0);
}

#[tokio::test]
async fn test_start_game_uses_caller_identity() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;
    let worker = common::spawn_worker(
        &broker,
        "game_queue",
        MethodRouter::new().route("startGame", |params: Value| async move {
            Ok::<_, HandlerError>(RpcResponse::success(params, "Game started"))
        }),
    )
    .await;

    let (status, body) = send(
        &router,
        json_body(as_player(request(Method::POST, "/game/start")), json!({"difficulty": 2})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body["data"],
        json!({"playerId": "player-7", "name": "Ada", "difficulty": 2})
    );
    worker.stop().await;
}

#[tokio::test]
async fn test_game_routes_map_path_and_method() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;
    let worker = common::spawn_worker(
        &broker,
        "game_queue",
        MethodRouter::new()
            .route("submitAnswer", |params: Value| async move {
                Ok::<_, HandlerError>(RpcResponse::success(params, "Answer submitted"))
            })
            .route("joinGame", |params: Value| async move {
                Ok::<_, HandlerError>(RpcResponse::success(params, "Joined"))
            })
            .route("endGame", |params: Value| async move {
                Ok::<_, HandlerError>(RpcResponse::success(params, "Ended"))
            }),
    )
    .await;

    let (status, body) = send(
        &router,
        json_body(as_player(request(Method::POST, "/game/g-1/submit")), json!({"answer": 4.5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"],
        json!({"gameId": "g-1", "playerId": "player-7", "answer": 4.5})
    );

    let (status, body) = send(
        &router,
        as_player(request(Method::PUT, "/game/g-1/join"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["playerName"], json!("Ada"));

    let (status, body) = send(
        &router,
        as_player(request(Method::GET, "/game/g-1/end"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({"gameId": "g-1"}));
    worker.stop().await;
}

#[tokio::test]
async fn test_result_routes_reach_players_queue() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;
    let worker = common::spawn_worker(
        &broker,
        "players_queue",
        MethodRouter::new()
            .route("getPlayerResult", |params: Value| async move {
                Ok::<_, HandlerError>(RpcResponse::success(params, "Result"))
            })
            .route("getGameResult", |_: Value| async move {
                Ok::<_, HandlerError>(RpcResponse::error("Game not found", "NOT_FOUND", 404))
            }),
    )
    .await;

    let (status, body) = send(
        &router,
        as_player(request(Method::GET, "/result/me/g-9"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({"gameId": "g-9", "playerId": "player-7"}));

    let (status, _) = send(
        &router,
        as_player(request(Method::GET, "/player/all/g-9"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_is_service_unavailable() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 100).await;

    let (status, body) = send(
        &router,
        as_player(request(Method::GET, "/game/g-1/end"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"]["code"], json!("SERVICE_UNAVAILABLE"));
    assert_eq!(body["error"]["message"], json!("Game service unavailable"));
    assert_eq!(body["error"]["statusCode"], json!(503));
}

#[tokio::test]
async fn test_health_reflects_connectivity() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;

    let (status, body) = send(&router, request(Method::GET, "/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["circuitBreaker"]["state"], json!("CLOSED"));
    assert_eq!(body["circuitBreaker"]["isConnected"], json!(true));

    broker.drop_connections();

    let (status, body) = send(&router, request(Method::GET, "/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], json!("unhealthy"));
}

#[tokio::test]
async fn test_breaker_status_endpoint() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;

    let (status, body) = send(
        &router,
        request(Method::GET, "/circuit-breaker/status")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["state"], json!("CLOSED"));
    assert_eq!(body["data"]["failureCount"], json!(0));
    assert_eq!(body["data"]["failureThreshold"], json!(5));

    broker.drop_connections();

    let (status, body) = send(
        &router,
        request(Method::GET, "/circuit-breaker/status")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn test_unknown_route_is_json_404_with_request_id() {
    let broker = MemoryBroker::new();
    let (router, _) = app(&broker, 5_000).await;

    let response = router
        .clone()
        .oneshot(request(Method::GET, "/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-request-id"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], json!("NOT_FOUND"));
}
