//! Frame sinks of the connections hosted by this process

use dashmap::DashMap;
use groupcast_shared::{ConnectionId, Frame};
use tokio::sync::mpsc;

/// Write half of a connection's transport
pub type FrameSink = mpsc::UnboundedSender<Frame>;

/// Dispatch table from connection id to its transport sink.
///
/// Both backplanes keep one: the local variant writes into it directly, the
/// Redis variant writes into it from its relay task and resubscribes its ids
/// after a reconnect.
#[derive(Default)]
pub struct HostedConnections {
    sinks: DashMap<ConnectionId, FrameSink>,
}

impl HostedConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, id: &ConnectionId, sink: FrameSink) {
        self.sinks.insert(id.clone(), sink);
    }

    pub fn detach(&self, id: &ConnectionId) -> bool {
        self.sinks.remove(id).is_some()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sinks.contains_key(id)
    }

    /// Ids of every hosted connection, in no particular order
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sinks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write a frame to one hosted connection.
    ///
    /// Returns false if the connection is not hosted here. A sink whose
    /// receiver is gone is detached; the transport's close guard handles the
    /// rest of the cleanup.
    pub fn deliver(&self, id: &ConnectionId, frame: &Frame) -> bool {
        let sent = match self.sinks.get(id) {
            Some(sink) => sink.send(frame.clone()).is_ok(),
            None => return false,
        };

        if !sent {
            self.sinks.remove(id);
            tracing::warn!(
                connection_id = %id,
                "Failed to send frame to connection (likely closed)"
            );
        }

        sent
    }

    /// Write a frame to every hosted connection among `ids`, returning how many took it
    pub fn deliver_many<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ConnectionId>,
        frame: &Frame,
    ) -> usize {
        ids.into_iter().filter(|id| self.deliver(id, frame)).count()
    }

    /// Drop every sink, ending all hosted transports
    pub fn clear(&self) {
        self.sinks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_to_hosted_connection() {
        let hosted = HostedConnections::new();
        let id = ConnectionId::generate();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hosted.attach(&id, tx);

        assert!(hosted.deliver(&id, &Frame::new("room1", "{}")));
        assert_eq!(rx.try_recv().unwrap(), Frame::new("room1", "{}"));
    }

    #[test]
    fn test_deliver_to_unknown_connection_is_a_miss() {
        let hosted = HostedConnections::new();
        assert!(!hosted.deliver(&ConnectionId::generate(), &Frame::new("room1", "{}")));
    }

    #[test]
    fn test_closed_sink_is_detached() {
        let hosted = HostedConnections::new();
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        hosted.attach(&id, tx);
        drop(rx);

        assert!(!hosted.deliver(&id, &Frame::new("room1", "{}")));
        assert!(!hosted.contains(&id));
    }

    #[test]
    fn test_deliver_many_counts_only_hosted() {
        let hosted = HostedConnections::new();
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        let (tx, _rx) = mpsc::unbounded_channel();
        hosted.attach(&a, tx);

        let delivered = hosted.deliver_many([&a, &b], &Frame::new("room1", "{}"));
        assert_eq!(delivered, 1);
    }

    #[test]
    fn test_ids_lists_attached_connections() {
        let hosted = HostedConnections::new();
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        let (tx, _rx) = mpsc::unbounded_channel();
        hosted.attach(&a, tx.clone());
        hosted.attach(&b, tx);
        hosted.detach(&b);

        assert_eq!(hosted.ids(), vec![a]);
    }
}
