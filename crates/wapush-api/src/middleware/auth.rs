//! Bearer-token guard for the management API

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::server::AppState;

/// Reject `/api/*` requests without the configured bearer token.
/// With no `api.api_key` configured every request passes.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if validate_api_key(provided, state.config.api.api_key.as_deref()) {
        Ok(next.run(request).await)
    } else {
        debug!("Rejected {} {}: bad or missing API key", request.method(), request.uri());
        Err(StatusCode::UNAUTHORIZED)
    }
}

pub fn validate_api_key(provided: Option<&str>, expected: Option<&str>) -> bool {
    match (provided, expected) {
        (Some(p), Some(e)) => p == e,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key(None, None));
        assert!(validate_api_key(Some("any"), None));
        assert!(!validate_api_key(None, Some("secret")));
        assert!(!validate_api_key(Some("wrong"), Some("secret")));
        assert!(validate_api_key(Some("secret"), Some("secret")));
    }
}
