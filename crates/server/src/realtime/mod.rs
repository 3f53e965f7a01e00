//! Real-time group fanout over Server-Sent Events
//!
//! # Architecture
//!
//! - **Registry**: owns open connections and mints their ids
//! - **Membership**: connection <-> group mapping, local or Redis-backed
//! - **Backplane**: resolves a publish to the connections that receive it
//! - **Transport**: per-connection SSE stream with disconnect detection
//! - **Chat**: reacts to disconnects on behalf of the chat routes

pub mod backplane;
pub mod chat;
pub mod hosted;
pub mod membership;
pub mod registry;
pub mod transport;

pub use backplane::{Backplane, BackplaneKind, LocalBackplane, RedisBackplane};
pub use chat::Chat;
pub use hosted::{FrameSink, HostedConnections};
pub use membership::{LocalMembership, MembershipStore, RedisMembership};
pub use registry::{Connection, ConnectionRegistry, DisconnectNotice};
pub use transport::FrameStream;

use groupcast_shared::EventError;

/// Errors from the membership store and the backplane
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;
