//! Open connection registry
//!
//! Owns the record of every connection hosted by this process, mints their
//! ids and is the only place a connection is torn down.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use groupcast_shared::{is_blank, ChatEvent, ConnectionId, Frame, CONNECTION_RESPONSE_CHANNEL};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use super::{Backplane, FrameSink, MembershipStore, RealtimeError, RealtimeResult};

/// Disconnect notifications buffered per subscriber before it starts lagging
const DISCONNECT_CHANNEL_CAPACITY: usize = 1024;

/// An open push connection hosted by this process
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    /// User the connection was opened by, if the request was authenticated
    pub user_id: Option<String>,
    pub opened_at: OffsetDateTime,
}

/// Fired once per closed connection, after its memberships are gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    /// Groups the connection was a member of when it closed
    pub groups: HashSet<String>,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    membership: Arc<dyn MembershipStore>,
    backplane: Arc<dyn Backplane>,
    disconnects: broadcast::Sender<DisconnectNotice>,
}

impl ConnectionRegistry {
    pub fn new(membership: Arc<dyn MembershipStore>, backplane: Arc<dyn Backplane>) -> Self {
        let (disconnects, _) = broadcast::channel(DISCONNECT_CHANNEL_CAPACITY);
        Self {
            connections: DashMap::new(),
            membership,
            backplane,
            disconnects,
        }
    }

    pub fn membership(&self) -> &Arc<dyn MembershipStore> {
        &self.membership
    }

    pub fn backplane(&self) -> &Arc<dyn Backplane> {
        &self.backplane
    }

    /// Register a new connection writing into `sink`.
    ///
    /// The `ConnectionResponse` frame is queued on the sink before the sink
    /// becomes reachable by any publish, so it is always the first frame.
    pub async fn open(
        &self,
        sink: FrameSink,
        user_id: Option<String>,
    ) -> RealtimeResult<ConnectionId> {
        let connection = loop {
            let id = ConnectionId::generate();
            match self.connections.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let connection = Connection {
                        id,
                        user_id: user_id.clone(),
                        opened_at: OffsetDateTime::now_utc(),
                    };
                    slot.insert(connection.clone());
                    break connection;
                }
            }
        };
        let id = connection.id.clone();

        let greeting = ChatEvent::ConnectionResponse {
            connection_id: id.clone(),
        }
        .body()?;
        // A closed sink here means the client is already gone; the transport
        // guard will close the record.
        let _ = sink.send(Frame::new(CONNECTION_RESPONSE_CHANNEL, greeting.to_json()));

        if let Err(e) = self.register(&connection).await {
            self.connections.remove(&id);
            // Best effort: clears a half-written open mark or user link
            let _ = self.membership.remove_connection(&id).await;
            return Err(e);
        }

        self.backplane.attach(&id, sink);

        tracing::info!(
            connection_id = %id,
            user_id = ?connection.user_id,
            total_connections = self.connections.len(),
            "Connection opened"
        );

        Ok(id)
    }

    /// Make the connection visible to every process sharing the store
    async fn register(&self, connection: &Connection) -> RealtimeResult<()> {
        self.membership.mark_open(&connection.id).await?;
        if let Some(user_id) = &connection.user_id {
            self.membership.link_user(&connection.id, user_id).await?;
        }
        Ok(())
    }

    /// Close a connection, removing it from every group.
    ///
    /// Returns `None` if the connection was not open.
    pub async fn close(&self, id: &ConnectionId) -> Option<DisconnectNotice> {
        let connection = self.detach(id)?;
        Some(self.finish_close(connection).await)
    }

    /// Close from a synchronous context such as a `Drop` impl.
    ///
    /// The record and the sink are gone when this returns; membership
    /// cleanup and the notification run on the current runtime.
    pub fn close_in_background(self: &Arc<Self>, id: &ConnectionId) {
        let Some(connection) = self.detach(id) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = Arc::clone(self);
                handle.spawn(async move {
                    registry.finish_close(connection).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = %connection.id,
                    "No runtime available - membership cleanup skipped"
                );
            }
        }
    }

    fn detach(&self, id: &ConnectionId) -> Option<Connection> {
        let (_, connection) = self.connections.remove(id)?;
        self.backplane.detach(id);
        Some(connection)
    }

    async fn finish_close(&self, connection: Connection) -> DisconnectNotice {
        let groups = match self.membership.remove_connection(&connection.id).await {
            Ok(groups) => groups,
            Err(e) => {
                tracing::error!(
                    connection_id = %connection.id,
                    error = %e,
                    "Failed to remove closed connection from its groups"
                );
                HashSet::new()
            }
        };

        tracing::info!(
            connection_id = %connection.id,
            user_id = ?connection.user_id,
            groups = groups.len(),
            remaining_connections = self.connections.len(),
            "Connection closed"
        );

        let notice = DisconnectNotice {
            connection_id: connection.id,
            user_id: connection.user_id,
            groups,
        };
        // No subscribers is fine
        let _ = self.disconnects.send(notice.clone());
        notice
    }

    pub fn exists(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).map(|c| c.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Add a connection to a group.
    ///
    /// The connection may be hosted by any process sharing the membership
    /// store. The join is applied only while the store still has it marked
    /// open, so a connection that has closed can never gain a membership that
    /// nothing would clean up.
    pub async fn add_to_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        validate(id, group)?;

        if !self.membership.add_to_group_if_open(id, id, group).await? {
            return Err(RealtimeError::Validation(format!(
                "connection '{}' is not open",
                id
            )));
        }

        tracing::debug!(connection_id = %id, group = %group, "Joined group");
        Ok(())
    }

    pub async fn remove_from_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        validate(id, group)?;
        self.membership.remove_from_group(id, group).await?;
        tracing::debug!(connection_id = %id, group = %group, "Left group");
        Ok(())
    }

    pub async fn groups_of(&self, id: &ConnectionId) -> RealtimeResult<HashSet<String>> {
        self.membership.groups_of(id).await
    }

    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<DisconnectNotice> {
        self.disconnects.subscribe()
    }

    /// Close every open connection
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.key().clone()).collect();
        let count = ids.len();
        for id in ids {
            self.close(&id).await;
        }
        tracing::info!(closed = count, "Connection registry shut down");
    }
}

fn validate(id: &ConnectionId, group: &str) -> RealtimeResult<()> {
    if is_blank(id.as_str()) {
        return Err(RealtimeError::Validation("connection id is required".into()));
    }
    if is_blank(group) {
        return Err(RealtimeError::Validation("group name is required".into()));
    }
    // Group names become SSE event names
    if group.contains(['\n', '\r']) {
        return Err(RealtimeError::Validation(
            "group name must not contain line breaks".into(),
        ));
    }
    Ok(())
}
