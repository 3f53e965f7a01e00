//! Fanout backplanes
//!
//! A backplane turns "publish this body to group G" (or "to connection C")
//! into writes on the transports of the connections that should receive it.
//! Group publishes use a membership snapshot taken at publish time, so a
//! connection joining afterwards does not see that event and no connection
//! receives it twice.

mod distributed;
mod local;

pub use self::distributed::RedisBackplane;
pub use self::local::LocalBackplane;

use async_trait::async_trait;
use groupcast_shared::{ConnectionId, Event, EventBody, Target};
use std::fmt;
use std::str::FromStr;

use super::{FrameSink, RealtimeResult};

/// Which fanout strategy is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackplaneKind {
    /// Single process, in-memory dispatch
    Local,
    /// Redis pub/sub shared by every server process
    Redis,
}

impl fmt::Display for BackplaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackplaneKind::Local => write!(f, "local"),
            BackplaneKind::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for BackplaneKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" | "in-memory" => Ok(BackplaneKind::Local),
            "redis" => Ok(BackplaneKind::Redis),
            other => Err(format!("unknown backplane '{}'", other)),
        }
    }
}

/// Delivery contract shared by both variants.
///
/// Delivery is at-most-once and ephemeral. Publishing to a group with no
/// members, or to a connection that is not open, is a no-op rather than an
/// error.
#[async_trait]
pub trait Backplane: Send + Sync {
    fn kind(&self) -> BackplaneKind;

    /// Register the transport sink of a connection hosted by this process
    fn attach(&self, id: &ConnectionId, sink: FrameSink);

    /// Forget a hosted connection's sink
    fn detach(&self, id: &ConnectionId);

    /// Number of connections hosted by this process
    fn hosted_count(&self) -> usize;

    /// Deliver to every member of `group`; returns the size of the membership snapshot
    async fn publish_to_group(&self, group: &str, body: &EventBody) -> RealtimeResult<usize>;

    /// Deliver to one connection; returns whether a process hosting it took the frame
    async fn publish_to_connection(&self, id: &ConnectionId, body: &EventBody)
        -> RealtimeResult<bool>;

    /// Publish an addressed event
    async fn publish(&self, event: &Event) -> RealtimeResult<usize> {
        match &event.target {
            Target::Group(group) => self.publish_to_group(group, &event.body).await,
            Target::Connection(id) => Ok(usize::from(
                self.publish_to_connection(id, &event.body).await?,
            )),
        }
    }

    /// Check the backplane's external dependencies
    async fn ready(&self) -> RealtimeResult<()> {
        Ok(())
    }

    /// Stop background work and release hosted sinks
    async fn shutdown(&self) {}
}
