//! Caller identity for protected routes.
//!
//! Token verification happens upstream; by the time a request reaches the
//! gateway the authenticated player is carried in `x-player-id` and
//! `x-player-name`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::response::ApiError;

pub const X_PLAYER_ID: &str = "x-player-id";
pub const X_PLAYER_NAME: &str = "x-player-name";

/// The authenticated player making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub player_id: String,
    pub name: Option<String>,
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let player_id = header_value(parts, X_PLAYER_ID)
            .ok_or_else(|| ApiError::unauthorized("Access token required"))?;
        Ok(Caller {
            player_id,
            name: header_value(parts, X_PLAYER_NAME),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Caller, ApiError> {
        let (mut parts, _) = request.into_parts();
        Caller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_caller_from_headers() {
        let request = Request::builder()
            .header(X_PLAYER_ID, "p-1")
            .header(X_PLAYER_NAME, "Ada")
            .body(())
            .unwrap();
        let caller = extract(request).await.unwrap();
        assert_eq!(caller.player_id, "p-1");
        assert_eq!(caller.name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn test_missing_or_blank_identity_is_unauthorized() {
        let err = extract(Request::builder().body(()).unwrap()).await.unwrap_err();
        assert_eq!(err.code, "UNAUTHORIZED");

        let blank = Request::builder().header(X_PLAYER_ID, "  ").body(()).unwrap();
        assert!(extract(blank).await.is_err());
    }
}
