//! Common types used across groupcast

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Opaque identity of one open push connection.
///
/// Minted by the server as a UUIDv4 string, but treated as an opaque string
/// everywhere else: clients echo back whatever they were handed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh, globally unique id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Reserved names
// =============================================================================

/// SSE event name of the first frame on every connection
pub const CONNECTION_RESPONSE_CHANNEL: &str = "ConnectionResponse";

/// SSE event name used for frames addressed to a single connection
pub const DIRECT_CHANNEL: &str = "message";

/// Pseudo-connection prefix under which a connection's display name is kept
/// in the membership store (`nickname/<connectionId>` joins a group named
/// after the display name).
pub const NICKNAME_PREFIX: &str = "nickname/";

/// Pseudo-connection id holding the display name of `id`
pub fn nickname_key(id: &ConnectionId) -> ConnectionId {
    ConnectionId(format!("{NICKNAME_PREFIX}{id}"))
}

/// Returns true if the name is blank (empty or whitespace only)
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
