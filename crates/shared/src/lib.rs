//! Groupcast Shared Types
//!
//! Identifiers, event envelopes and wire frames shared by the groupcast
//! server and client.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod events;
pub mod types;

pub use error::*;
pub use events::*;
pub use types::*;
