//! Groupcast server library
//!
//! Group-addressed real-time fanout over Server-Sent Events.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod realtime;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
