//! End-to-end fanout over real HTTP connections

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use groupcast_client::{ClientConfig, EventBody, Multiplexer};
use groupcast_server::config::Config;
use groupcast_server::directory::StaticDirectory;
use groupcast_server::realtime::{BackplaneKind, ConnectionRegistry};
use groupcast_server::routes::create_router;
use groupcast_server::state::connect_realtime;
use groupcast_server::AppState;
use serde_json::json;
use tokio::sync::mpsc;

struct TestServer {
    base: String,
    registry: Arc<ConnectionRegistry>,
    http: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            sse_keep_alive: Duration::from_millis(200),
            backplane: BackplaneKind::Local,
            redis_url: None,
            redis_key_prefix: "groupcast-test".to_string(),
            rooms: vec!["lobby".to_string()],
            auth_tokens: HashMap::new(),
            user_names: HashMap::new(),
            log_json: false,
        };
        let registry = connect_realtime(&config).await.unwrap();
        let directory = StaticDirectory::new()
            .with_token("alice-token", "alice")
            .with_token("bob-token", "bob")
            .with_user("alice", "Alice")
            .with_user("bob", "Bob")
            .with_room("lobby");

        let state = AppState::new(config, Arc::clone(&registry), directory);
        state.chat.spawn_disconnect_listener();
        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            registry,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/realtime{}", self.base, path)
    }

    async fn client(&self, token: &str) -> Multiplexer {
        let mux = Multiplexer::new(ClientConfig::new().token(token));
        mux.connect(&self.url("/connect")).await.unwrap();
        mux
    }

    async fn post(&self, path: &str, token: &str, body: serde_json::Value) -> reqwest::StatusCode {
        self.http
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn wait_for_connections(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.registry.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("connection count never settled");
    }
}

fn collect(mux: &Multiplexer, group: &str, event_type: &str) -> mpsc::UnboundedReceiver<EventBody> {
    let (tx, rx) = mpsc::unbounded_channel();
    mux.on(group, event_type, move |body| {
        let _ = tx.send(body.clone());
    })
    .unwrap();
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<EventBody>) -> EventBody {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("handler dropped")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<EventBody>) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra event");
}

#[tokio::test]
async fn test_group_message_delivered_exactly_once() {
    let server = TestServer::start().await;
    let alice = server.client("alice-token").await;
    let mut messages = collect(&alice, "lobby", "MessageResponseDto");
    let id = alice.wait_for_connection_id().await.unwrap();

    let status = server
        .post("/join", "alice-token", json!({"connectionId": id, "group": "lobby"}))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);

    let status = server
        .post("/send", "alice-token", json!({"groupId": "lobby", "message": "hello"}))
        .await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);

    let body = next(&mut messages).await;
    assert_eq!(body.data()["user"], "Alice");
    assert_eq!(body.data()["message"], "hello");
    assert_quiet(&mut messages).await;

    alice.disconnect();
}

#[tokio::test]
async fn test_disconnected_member_is_removed_from_fanout() {
    let server = TestServer::start().await;

    let alice = server.client("alice-token").await;
    let alice_id = alice.wait_for_connection_id().await.unwrap();
    let bob = server.client("bob-token").await;
    let mut bob_messages = collect(&bob, "lobby", "MessageResponseDto");
    let mut bob_departures = collect(&bob, "lobby", "UserLeftResponseDto");
    let bob_id = bob.wait_for_connection_id().await.unwrap();

    for (token, id) in [("alice-token", &alice_id), ("bob-token", &bob_id)] {
        let status = server
            .post("/join", token, json!({"connectionId": id, "group": "lobby"}))
            .await;
        assert_eq!(status, reqwest::StatusCode::OK);
    }
    server.wait_for_connections(2).await;

    alice.disconnect();
    server.wait_for_connections(1).await;

    let departure = next(&mut bob_departures).await;
    assert_eq!(departure.data()["connectionId"], alice_id.as_str());
    assert_eq!(departure.data()["message"], "Someone disconnected!");
    assert!(server.registry.groups_of(&alice_id).await.unwrap().is_empty());

    let status = server
        .post("/send", "bob-token", json!({"groupId": "lobby", "message": "still here"}))
        .await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);

    let body = next(&mut bob_messages).await;
    assert_eq!(body.data()["message"], "still here");
    assert_quiet(&mut bob_messages).await;

    bob.disconnect();
}

#[tokio::test]
async fn test_poke_reaches_only_its_target() {
    let server = TestServer::start().await;

    let alice = server.client("alice-token").await;
    let mut alice_pokes = collect(&alice, "message", "PokeResponseDto");
    alice.wait_for_connection_id().await.unwrap();
    let bob = server.client("bob-token").await;
    let mut bob_pokes = collect(&bob, "message", "PokeResponseDto");
    let bob_id = bob.wait_for_connection_id().await.unwrap();

    let status = server
        .post("/poke", "alice-token", json!({"connectionIdToPoke": bob_id}))
        .await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);

    let poke = next(&mut bob_pokes).await;
    assert_eq!(poke.data()["pokedBy"], "Alice");
    assert_quiet(&mut alice_pokes).await;

    // Nobody holds this id; accepted and dropped
    let status = server
        .post("/poke", "alice-token", json!({"connectionIdToPoke": "gone"}))
        .await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    assert_quiet(&mut bob_pokes).await;

    alice.disconnect();
    bob.disconnect();
}

#[tokio::test]
async fn test_anonymous_stream_can_be_opened() {
    let server = TestServer::start().await;

    let mux = Multiplexer::new(ClientConfig::new());
    mux.connect(&server.url("/connect")).await.unwrap();
    let id = mux.wait_for_connection_id().await.unwrap();

    let connection = server.registry.get(&id).unwrap();
    assert!(connection.user_id.is_none());

    mux.disconnect();
    server.wait_for_connections(0).await;
}
