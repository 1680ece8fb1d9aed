//! HTTP gateway in front of the quiz services.
//!
//! # Data Flow
//! ```text
//! HTTP request
//!     → server.rs (axum router, request id, trace, limits, timeout)
//!     → caller.rs (identity headers on protected routes)
//!     → handlers.rs (route → queue + method + params)
//!     → response.rs (RpcTransport::call, envelope → status code)
//!     → HTTP response
//! ```
//!
//! # Route Table
//! ```text
//! POST /auth/register          auth_queue    register         201
//! POST /auth/login             auth_queue    login            200
//! POST /game/start             game_queue    startGame        201
//! POST /game/{gameId}/submit   game_queue    submitAnswer     200
//! PUT  /game/{gameId}/join     game_queue    joinGame         200
//! GET  /game/{gameId}/end      game_queue    endGame          200
//! GET  /result/me/{gameId}     players_queue getPlayerResult  200
//! GET  /player/all/{gameId}    players_queue getGameResult    200
//! ```

pub mod caller;
pub mod handlers;
pub mod response;
pub mod server;

pub use caller::{Caller, X_PLAYER_ID, X_PLAYER_NAME};
pub use response::{ApiError, RouteTarget};
pub use server::{build_router, AppState, GatewayServer};
