//! API routes

pub mod health;
pub mod realtime;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    auth::{optional_auth, require_auth},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Anonymous callers may open a stream; a valid token links it to the user
    let stream_routes = Router::new()
        .route("/connect", get(realtime::connect))
        .route_layer(middleware::from_fn_with_state(state.clone(), optional_auth));

    let public_routes = Router::new().route("/online", get(realtime::online));

    let protected_routes = Router::new()
        .route("/join", post(realtime::join))
        .route("/leave", post(realtime::leave))
        .route("/send", post(realtime::send))
        .route("/poke", post(realtime::poke))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let realtime_routes = Router::new()
        .merge(stream_routes)
        .merge(public_routes)
        .merge(protected_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/realtime", realtime_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::directory::StaticDirectory;
    use crate::state::connect_realtime;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use serial_test::serial;
    use tower::ServiceExt;

    async fn app() -> Router {
        for var in ["BACKPLANE", "REDIS_URL", "SSE_KEEP_ALIVE_SECS", "AUTH_TOKENS", "USER_NAMES"] {
            std::env::remove_var(var);
        }
        let config = Config::from_env().unwrap();
        let registry = connect_realtime(&config).await.unwrap();
        let directory = StaticDirectory::new()
            .with_token("secret", "user-1")
            .with_user("user-1", "Alice")
            .with_room("lobby");
        create_router(AppState::new(config, registry, directory))
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn test_health_reports_local_backplane() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["backplane"], "local");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_protected_routes_require_token() {
        let app = app().await;
        let body = json!({"connectionId": "abc", "group": "lobby"});

        let response = app
            .clone()
            .oneshot(post_json("/api/realtime/join", None, body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post_json("/api/realtime/join", Some("wrong"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "INVALID_TOKEN");
    }

    #[tokio::test]
    #[serial]
    async fn test_join_unknown_room_is_rejected() {
        let response = app()
            .await
            .oneshot(post_json(
                "/api/realtime/join",
                Some("secret"),
                json!({"connectionId": "abc", "group": "attic"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["message"], "Room does not exist");
    }

    #[tokio::test]
    #[serial]
    async fn test_join_with_unopened_connection_is_rejected() {
        let response = app()
            .await
            .oneshot(post_json(
                "/api/realtime/join",
                Some("secret"),
                json!({"connectionId": "never-opened", "group": "lobby"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    #[serial]
    async fn test_poke_to_absent_connection_is_accepted() {
        let response = app()
            .await
            .oneshot(post_json(
                "/api/realtime/poke",
                Some("secret"),
                json!({"connectionIdToPoke": "nobody"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    #[serial]
    async fn test_online_requires_group() {
        let response = app()
            .await
            .oneshot(
                Request::get("/api/realtime/online?groupId=%20")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
