//! SSE transport for one connection
//!
//! The response body owns a [`CloseGuard`]. Hyper drops the body when the
//! client hangs up, a write fails or the server shuts down, and the guard
//! turns that drop into a registry close.

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use groupcast_shared::{ConnectionId, Frame};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ConnectionRegistry, RealtimeResult};

/// Closes its connection when dropped
pub struct CloseGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        tracing::debug!(connection_id = %self.id, "Transport dropped");
        self.registry.close_in_background(&self.id);
    }
}

/// Frames queued for one connection, in delivery order.
///
/// Ends when the connection's sink is detached.
pub struct FrameStream {
    frames: mpsc::UnboundedReceiver<Frame>,
    guard: CloseGuard,
}

impl FrameStream {
    /// Open a connection in `registry` and return its outbound frames
    pub async fn open(
        registry: &Arc<ConnectionRegistry>,
        user_id: Option<String>,
    ) -> RealtimeResult<Self> {
        let (sink, frames) = mpsc::unbounded_channel();
        let id = registry.open(sink, user_id).await?;

        Ok(Self {
            frames,
            guard: CloseGuard {
                registry: Arc::clone(registry),
                id,
            },
        })
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.guard.id
    }

    /// Wrap into an SSE response body with periodic keep-alive comments
    pub fn into_sse(
        self,
        keep_alive: Duration,
    ) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
        use futures::StreamExt;

        Sse::new(self.map(|frame| Ok(to_sse_event(frame))))
            .keep_alive(KeepAlive::new().interval(keep_alive))
    }
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().frames.poll_recv(cx)
    }
}

/// `event: <channel>` followed by the JSON text as `data:`
pub fn to_sse_event(frame: Frame) -> SseEvent {
    SseEvent::default().event(frame.channel).data(frame.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{Backplane, LocalBackplane, LocalMembership, MembershipStore};
    use futures::StreamExt;
    use groupcast_shared::{EventBody, CONNECTION_RESPONSE_CHANNEL};
    use serde_json::json;

    fn registry() -> Arc<ConnectionRegistry> {
        let membership: Arc<dyn MembershipStore> = Arc::new(LocalMembership::new());
        let backplane = Arc::new(LocalBackplane::new(Arc::clone(&membership)));
        Arc::new(ConnectionRegistry::new(membership, backplane))
    }

    #[tokio::test]
    async fn test_stream_yields_greeting_then_published_frames() {
        let registry = registry();
        let mut stream = FrameStream::open(&registry, None).await.unwrap();
        let id = stream.connection_id().clone();

        registry.add_to_group(&id, "room1").await.unwrap();
        let body = EventBody::new("Msg", json!({"text": "hi"})).unwrap();
        registry.backplane().publish_to_group("room1", &body).await.unwrap();

        assert_eq!(stream.next().await.unwrap().channel, CONNECTION_RESPONSE_CHANNEL);
        let frame = stream.next().await.unwrap();
        assert_eq!(frame.channel, "room1");
        assert_eq!(frame.data, body.to_json());
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_connection() {
        let registry = registry();
        let mut disconnects = registry.subscribe_disconnects();
        let stream = FrameStream::open(&registry, None).await.unwrap();
        let id = stream.connection_id().clone();
        registry.add_to_group(&id, "room1").await.unwrap();

        drop(stream);
        assert!(!registry.exists(&id));

        let notice = disconnects.recv().await.unwrap();
        assert_eq!(notice.connection_id, id);
        assert!(registry.membership().members("room1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_ends_on_shutdown() {
        let registry = registry();
        let mut stream = FrameStream::open(&registry, None).await.unwrap();
        stream.next().await.unwrap();

        registry.shutdown().await;
        assert!(stream.next().await.is_none());
    }
}
