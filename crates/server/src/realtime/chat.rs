//! Chat-room operations built on the registry and backplane

use groupcast_shared::{
    nickname_key, ChatEvent, ConnectedUser, ConnectionId, EventBody, NICKNAME_PREFIX,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{ConnectionRegistry, DisconnectNotice, RealtimeError, RealtimeResult};

/// Display name used when a user has none
pub const ANONYMOUS: &str = "Anonymous";

/// Text of the notice sent to a closed connection's groups
pub const DISCONNECT_MESSAGE: &str = "Someone disconnected!";

/// Result of a join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub connected_users: Vec<ConnectedUser>,
    /// Members the `JoinGroupBroadcast` was addressed to
    pub recipients: usize,
}

#[derive(Clone)]
pub struct Chat {
    registry: Arc<ConnectionRegistry>,
}

impl Chat {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Join `group` under `user_name` and tell the group who is in it now
    pub async fn join(
        &self,
        id: &ConnectionId,
        group: &str,
        user_name: &str,
    ) -> RealtimeResult<JoinOutcome> {
        self.registry.add_to_group(id, group).await?;
        // The display name is a pseudo-membership: `nickname/<id>` joins a
        // group named after the user, guarded by the real connection
        let named = self
            .registry
            .membership()
            .add_to_group_if_open(id, &nickname_key(id), user_name)
            .await?;
        if !named {
            return Err(RealtimeError::Validation(format!(
                "connection '{}' closed while joining",
                id
            )));
        }

        let connected_users = self.connected_users(group).await?;
        let body = ChatEvent::JoinGroupBroadcast {
            connected_users: connected_users.clone(),
        }
        .body()?;
        let recipients = self.publish_to_group(group, &body).await?;

        tracing::info!(
            connection_id = %id,
            group = %group,
            user_name = %user_name,
            members = connected_users.len(),
            "Joined chat group"
        );

        Ok(JoinOutcome {
            connected_users,
            recipients,
        })
    }

    pub async fn leave(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        self.registry.remove_from_group(id, group).await
    }

    /// Members of `group` paired with their display names
    pub async fn connected_users(&self, group: &str) -> RealtimeResult<Vec<ConnectedUser>> {
        let membership = self.registry.membership();
        let mut members: Vec<ConnectionId> = membership
            .members(group)
            .await?
            .into_iter()
            .filter(|m| !m.as_str().starts_with(NICKNAME_PREFIX))
            .collect();
        members.sort();

        let mut users = Vec::with_capacity(members.len());
        for connection_id in members {
            let user_name = membership
                .groups_of(&nickname_key(&connection_id))
                .await?
                .into_iter()
                .min()
                .unwrap_or_else(|| ANONYMOUS.to_string());
            users.push(ConnectedUser {
                connection_id,
                user_name,
            });
        }
        Ok(users)
    }

    /// User ids linked to the current members of `group`, sorted and deduplicated
    pub async fn online_users(&self, group: &str) -> RealtimeResult<Vec<String>> {
        let membership = self.registry.membership();
        let mut users = Vec::new();
        for connection_id in membership.members(group).await? {
            if let Some(user_id) = membership.linked_user(&connection_id).await? {
                users.push(user_id);
            }
        }
        users.sort();
        users.dedup();
        Ok(users)
    }

    pub async fn send_message(
        &self,
        group: &str,
        user: &str,
        message: &str,
    ) -> RealtimeResult<usize> {
        let body = ChatEvent::MessageResponseDto {
            user: user.to_string(),
            message: message.to_string(),
        }
        .body()?;
        self.publish_to_group(group, &body).await
    }

    /// Direct message to one connection; a connection that is not open is a no-op
    pub async fn poke(&self, target: &ConnectionId, poked_by: &str) -> RealtimeResult<bool> {
        let body = ChatEvent::PokeResponseDto {
            poked_by: poked_by.to_string(),
        }
        .body()?;
        self.registry
            .backplane()
            .publish_to_connection(target, &body)
            .await
    }

    async fn publish_to_group(&self, group: &str, body: &EventBody) -> RealtimeResult<usize> {
        self.registry.backplane().publish_to_group(group, body).await
    }

    async fn handle_disconnect(&self, notice: &DisconnectNotice) -> RealtimeResult<()> {
        self.registry
            .membership()
            .remove_connection(&nickname_key(&notice.connection_id))
            .await?;

        let body = ChatEvent::UserLeftResponseDto {
            connection_id: notice.connection_id.clone(),
            message: DISCONNECT_MESSAGE.to_string(),
        }
        .body()?;

        for group in &notice.groups {
            self.publish_to_group(group, &body).await?;
        }
        Ok(())
    }

    /// React to every closed connection until the registry goes away
    pub fn spawn_disconnect_listener(&self) -> JoinHandle<()> {
        let chat = self.clone();
        let mut disconnects = self.registry.subscribe_disconnects();

        tokio::spawn(async move {
            loop {
                match disconnects.recv().await {
                    Ok(notice) => {
                        if let Err(e) = chat.handle_disconnect(&notice).await {
                            tracing::warn!(
                                connection_id = %notice.connection_id,
                                error = %e,
                                "Failed to announce disconnect"
                            );
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Disconnect listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
