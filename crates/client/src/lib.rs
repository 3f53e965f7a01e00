//! Groupcast Client
//!
//! Multiplexes one server-sent event stream into many
//! `(group, eventType)` subscriptions.
//!
//! ```no_run
//! use groupcast_client::{ClientConfig, Multiplexer};
//!
//! # async fn run() -> groupcast_client::Result<()> {
//! let mux = Multiplexer::new(ClientConfig::new().token("secret"));
//! let sub = mux.on("lobby", "MessageResponseDto", |body| {
//!     println!("{}", body.to_json());
//! })?;
//!
//! mux.connect("http://localhost:5000/api/realtime/connect").await?;
//! let id = mux.wait_for_connection_id().await?;
//! println!("connected as {}", id);
//!
//! sub.unsubscribe();
//! mux.disconnect();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod multiplexer;
pub mod sse;
pub mod transport;

pub use config::ClientConfig;
pub use error::{MuxError, Result};
pub use multiplexer::{ConnectionState, Handler, Multiplexer, Subscription, SubscriptionKey};
pub use sse::{SseDecoder, SseFrame};
pub use transport::{decode_stream, FrameStream, HttpTransport, Transport};

pub use groupcast_shared::{ConnectionId, EventBody};
