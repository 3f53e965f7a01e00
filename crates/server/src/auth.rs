//! Bearer-token authentication middleware

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Uri},
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller, inserted as a request extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
}

/// Token from `Authorization: Bearer ...`, or from `?access_token=` for
/// EventSource clients that cannot set headers
fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    from_header
        .or_else(|| {
            uri.query()?
                .split('&')
                .find_map(|pair| pair.strip_prefix("access_token="))
                .map(str::to_string)
        })
        .filter(|t| !t.is_empty())
}

/// Reject requests without a valid token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers(), request.uri()).ok_or(ApiError::Unauthorized)?;
    let user_id = state
        .authenticator
        .authenticate(&token)
        .await
        .ok_or(ApiError::InvalidToken)?;

    request.extensions_mut().insert(AuthUser { user_id });
    Ok(next.run(request).await)
}

/// Attach the caller if a valid token is present; anonymous requests pass through
pub async fn optional_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = extract_token(request.headers(), request.uri()) {
        match state.authenticator.authenticate(&token).await {
            Some(user_id) => {
                request.extensions_mut().insert(AuthUser { user_id });
            }
            None => {
                tracing::debug!("Ignoring invalid token on optional-auth route");
            }
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_token_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        let uri: Uri = "/api/realtime/join".parse().unwrap();
        assert_eq!(extract_token(&headers, &uri).as_deref(), Some("abc"));
    }

    #[test]
    fn test_extract_token_from_query() {
        let uri: Uri = "/api/realtime/connect?x=1&access_token=abc".parse().unwrap();
        assert_eq!(extract_token(&HeaderMap::new(), &uri).as_deref(), Some("abc"));
    }

    #[test]
    fn test_missing_or_malformed_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let uri: Uri = "/api/realtime/connect?access_token=".parse().unwrap();
        assert!(extract_token(&headers, &uri).is_none());
    }
}
