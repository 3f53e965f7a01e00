//! Group membership storage
//!
//! Many-to-many mapping between connection ids and group names, with a
//! reverse index so a closing connection can be removed from every group it
//! joined. Two implementations share one contract:
//!
//! - [`LocalMembership`]: process-local, sharded maps
//! - [`RedisMembership`]: Redis sets, shared by every server process

use async_trait::async_trait;
use dashmap::DashMap;
use groupcast_shared::{ConnectionId, NICKNAME_PREFIX};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;

use super::RealtimeResult;

/// Shared membership contract used by the registry and the backplanes
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Record that a connection is open. Cleared by `remove_connection`.
    async fn mark_open(&self, id: &ConnectionId) -> RealtimeResult<()>;

    /// Whether `mark_open` was called for a connection that has not been removed since
    async fn is_open(&self, id: &ConnectionId) -> RealtimeResult<bool>;

    /// Add a connection to a group (no-op if already a member)
    async fn add_to_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()>;

    /// Add `member` to `group` only while `owner` is open, in one atomic step.
    ///
    /// `member` is usually `owner` itself; the chat layer also uses it for
    /// the `nickname/<owner>` pseudo-connection. Returns false, writing
    /// nothing, once `owner` has been removed.
    async fn add_to_group_if_open(
        &self,
        owner: &ConnectionId,
        member: &ConnectionId,
        group: &str,
    ) -> RealtimeResult<bool>;

    /// Remove a connection from a group
    async fn remove_from_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()>;

    /// Snapshot of the group's current members
    async fn members(&self, group: &str) -> RealtimeResult<HashSet<ConnectionId>>;

    /// Groups a connection currently belongs to
    async fn groups_of(&self, id: &ConnectionId) -> RealtimeResult<HashSet<String>>;

    /// Remove a connection from every group at once, returning the groups it was in.
    /// Also forgets the connection's linked user and its open mark.
    async fn remove_connection(&self, id: &ConnectionId) -> RealtimeResult<HashSet<String>>;

    /// Remember which user opened a connection
    async fn link_user(&self, id: &ConnectionId, user_id: &str) -> RealtimeResult<()>;

    /// User linked to a connection, if any
    async fn linked_user(&self, id: &ConnectionId) -> RealtimeResult<Option<String>>;

    /// Number of non-empty groups, where the store can count them cheaply.
    ///
    /// Groups whose only members are `nickname/` pseudo-connections are not counted.
    async fn group_count(&self) -> RealtimeResult<Option<usize>>;
}

// =============================================================================
// Local
// =============================================================================

/// In-memory membership for single-process deployments.
///
/// Both maps are sharded, so joins and leaves on unrelated groups do not
/// contend. Writers always lock the connection entry before the group entry.
/// A guarded join reads the open mark while holding the member's connection
/// entry, and `remove_connection` clears the mark before taking that entry.
#[derive(Default)]
pub struct LocalMembership {
    /// group -> member connection ids
    groups: DashMap<String, HashSet<ConnectionId>>,
    /// connection id -> joined groups
    connections: DashMap<ConnectionId, HashSet<String>>,
    /// connection id -> linked user id
    users: DashMap<ConnectionId, String>,
    /// connections marked open
    open: DashMap<ConnectionId, ()>,
}

impl LocalMembership {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipStore for LocalMembership {
    async fn mark_open(&self, id: &ConnectionId) -> RealtimeResult<()> {
        self.open.insert(id.clone(), ());
        Ok(())
    }

    async fn is_open(&self, id: &ConnectionId) -> RealtimeResult<bool> {
        Ok(self.open.contains_key(id))
    }

    async fn add_to_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        let mut joined = self.connections.entry(id.clone()).or_default();
        if joined.insert(group.to_string()) {
            self.groups
                .entry(group.to_string())
                .or_default()
                .insert(id.clone());
            tracing::debug!(connection_id = %id, group = %group, "Connection joined group");
        }
        Ok(())
    }

    async fn add_to_group_if_open(
        &self,
        owner: &ConnectionId,
        member: &ConnectionId,
        group: &str,
    ) -> RealtimeResult<bool> {
        let mut joined = self.connections.entry(member.clone()).or_default();
        if !self.open.contains_key(owner) {
            let empty = joined.is_empty();
            drop(joined);
            if empty {
                self.connections.remove_if(member, |_, joined| joined.is_empty());
            }
            return Ok(false);
        }

        if joined.insert(group.to_string()) {
            self.groups
                .entry(group.to_string())
                .or_default()
                .insert(member.clone());
            tracing::debug!(connection_id = %member, group = %group, "Connection joined group");
        }
        Ok(true)
    }

    async fn remove_from_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        let Some(mut joined) = self.connections.get_mut(id) else {
            return Ok(());
        };
        if !joined.remove(group) {
            return Ok(());
        }

        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(id);
        }
        // Clean up empty groups
        if self.groups.remove_if(group, |_, members| members.is_empty()).is_some() {
            tracing::debug!(group = %group, "Removed empty group");
        }

        let now_empty = joined.is_empty();
        drop(joined);
        if now_empty {
            self.connections.remove_if(id, |_, joined| joined.is_empty());
        }

        tracing::debug!(connection_id = %id, group = %group, "Connection left group");
        Ok(())
    }

    async fn members(&self, group: &str) -> RealtimeResult<HashSet<ConnectionId>> {
        Ok(self
            .groups
            .get(group)
            .map(|members| members.clone())
            .unwrap_or_default())
    }

    async fn groups_of(&self, id: &ConnectionId) -> RealtimeResult<HashSet<String>> {
        Ok(self
            .connections
            .get(id)
            .map(|joined| joined.clone())
            .unwrap_or_default())
    }

    async fn remove_connection(&self, id: &ConnectionId) -> RealtimeResult<HashSet<String>> {
        self.open.remove(id);
        self.users.remove(id);

        let Some((_, joined)) = self.connections.remove(id) else {
            return Ok(HashSet::new());
        };

        for group in &joined {
            if let Some(mut members) = self.groups.get_mut(group) {
                members.remove(id);
            }
            self.groups.remove_if(group, |_, members| members.is_empty());
        }

        if !joined.is_empty() {
            tracing::debug!(
                connection_id = %id,
                group_count = joined.len(),
                "Removed connection from groups"
            );
        }

        Ok(joined)
    }

    async fn link_user(&self, id: &ConnectionId, user_id: &str) -> RealtimeResult<()> {
        self.users.insert(id.clone(), user_id.to_string());
        Ok(())
    }

    async fn linked_user(&self, id: &ConnectionId) -> RealtimeResult<Option<String>> {
        Ok(self.users.get(id).map(|user| user.clone()))
    }

    async fn group_count(&self) -> RealtimeResult<Option<usize>> {
        let count = self
            .groups
            .iter()
            .filter(|entry| entry.value().iter().any(|id| !is_pseudo(id)))
            .count();
        Ok(Some(count))
    }
}

// =============================================================================
// Redis
// =============================================================================

/// Removes a connection from all of its groups in one round trip.
///
/// KEYS[1] = connection's group set, KEYS[2] = connection's user key,
/// KEYS[3] = connection's open mark,
/// ARGV[1] = connection id, ARGV[2] = group key prefix
const REMOVE_CONNECTION_SCRIPT: &str = r#"
local groups = redis.call('SMEMBERS', KEYS[1])
for _, group in ipairs(groups) do
    redis.call('SREM', ARGV[2] .. group, ARGV[1])
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
return groups
"#;

/// Joins a group only while the owning connection is marked open.
///
/// KEYS[1] = owner's open mark, KEYS[2] = group set, KEYS[3] = member's group set,
/// ARGV[1] = member id, ARGV[2] = group name
const JOIN_IF_OPEN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[2])
return 1
"#;

/// Membership kept in Redis so every server process sees the same groups.
///
/// Key layout (Redis drops empty sets on its own):
/// - `{prefix}:group:{group}`: SET of connection ids
/// - `{prefix}:conn:{id}:groups`: SET of group names
/// - `{prefix}:conn:{id}:user`: linked user id
/// - `{prefix}:conn:{id}:alive`: present while the connection is open
#[derive(Clone)]
pub struct RedisMembership {
    conn: ConnectionManager,
    prefix: String,
    remove_script: redis::Script,
    join_script: redis::Script,
}

impl RedisMembership {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            remove_script: redis::Script::new(REMOVE_CONNECTION_SCRIPT),
            join_script: redis::Script::new(JOIN_IF_OPEN_SCRIPT),
        }
    }

    fn group_prefix(&self) -> String {
        format!("{}:group:", self.prefix)
    }

    fn group_key(&self, group: &str) -> String {
        format!("{}{}", self.group_prefix(), group)
    }

    fn groups_key(&self, id: &ConnectionId) -> String {
        format!("{}:conn:{}:groups", self.prefix, id)
    }

    fn user_key(&self, id: &ConnectionId) -> String {
        format!("{}:conn:{}:user", self.prefix, id)
    }

    fn alive_key(&self, id: &ConnectionId) -> String {
        format!("{}:conn:{}:alive", self.prefix, id)
    }

    /// Round-trip check used by readiness probes
    pub async fn ping(&self) -> RealtimeResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for RedisMembership {
    async fn mark_open(&self, id: &ConnectionId) -> RealtimeResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.alive_key(id), 1).await?;
        Ok(())
    }

    async fn is_open(&self, id: &ConnectionId) -> RealtimeResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.alive_key(id)).await?)
    }

    async fn add_to_group_if_open(
        &self,
        owner: &ConnectionId,
        member: &ConnectionId,
        group: &str,
    ) -> RealtimeResult<bool> {
        let mut conn = self.conn.clone();
        let joined: i64 = self
            .join_script
            .key(self.alive_key(owner))
            .key(self.group_key(group))
            .key(self.groups_key(member))
            .arg(member.as_str())
            .arg(group)
            .invoke_async(&mut conn)
            .await?;

        if joined == 1 {
            tracing::debug!(connection_id = %member, group = %group, "Connection joined group");
        }
        Ok(joined == 1)
    }

    async fn add_to_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(self.group_key(group), id.as_str())
            .ignore()
            .sadd(self.groups_key(id), group)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(connection_id = %id, group = %group, "Connection joined group");
        Ok(())
    }

    async fn remove_from_group(&self, id: &ConnectionId, group: &str) -> RealtimeResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .srem(self.group_key(group), id.as_str())
            .ignore()
            .srem(self.groups_key(id), group)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(connection_id = %id, group = %group, "Connection left group");
        Ok(())
    }

    async fn members(&self, group: &str) -> RealtimeResult<HashSet<ConnectionId>> {
        let mut conn = self.conn.clone();
        let members: HashSet<String> = conn.smembers(self.group_key(group)).await?;
        Ok(members.into_iter().map(ConnectionId::from).collect())
    }

    async fn groups_of(&self, id: &ConnectionId) -> RealtimeResult<HashSet<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.groups_key(id)).await?)
    }

    async fn remove_connection(&self, id: &ConnectionId) -> RealtimeResult<HashSet<String>> {
        let mut conn = self.conn.clone();
        let groups: Vec<String> = self
            .remove_script
            .key(self.groups_key(id))
            .key(self.user_key(id))
            .key(self.alive_key(id))
            .arg(id.as_str())
            .arg(self.group_prefix())
            .invoke_async(&mut conn)
            .await?;

        if !groups.is_empty() {
            tracing::debug!(
                connection_id = %id,
                group_count = groups.len(),
                "Removed connection from groups"
            );
        }

        Ok(groups.into_iter().collect())
    }

    async fn link_user(&self, id: &ConnectionId, user_id: &str) -> RealtimeResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.user_key(id), user_id).await?;
        Ok(())
    }

    async fn linked_user(&self, id: &ConnectionId) -> RealtimeResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.user_key(id)).await?)
    }

    async fn group_count(&self) -> RealtimeResult<Option<usize>> {
        // Counting would need a keyspace scan
        Ok(None)
    }
}

/// `nickname/<id>` entries hold display names, not real connections
fn is_pseudo(id: &ConnectionId) -> bool {
    id.as_str().starts_with(NICKNAME_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_join_and_leave() {
        let store = LocalMembership::new();
        let id = ConnectionId::generate();

        // Initially group doesn't exist
        assert!(store.members("room1").await.unwrap().is_empty());

        store.add_to_group(&id, "room1").await.unwrap();
        assert!(store.members("room1").await.unwrap().contains(&id));
        assert_eq!(store.group_count().await.unwrap(), Some(1));

        store.remove_from_group(&id, "room1").await.unwrap();
        assert!(store.members("room1").await.unwrap().is_empty());
        assert!(store.groups_of(&id).await.unwrap().is_empty());
        assert_eq!(store.group_count().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = LocalMembership::new();
        let id = ConnectionId::generate();

        store.add_to_group(&id, "room1").await.unwrap();
        store.add_to_group(&id, "room1").await.unwrap();

        assert_eq!(store.members("room1").await.unwrap().len(), 1);
        assert_eq!(store.groups_of(&id).await.unwrap().len(), 1);

        // A single leave is enough after a double join
        store.remove_from_group(&id, "room1").await.unwrap();
        assert!(store.members("room1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_connection_from_all_groups() {
        let store = LocalMembership::new();
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();

        store.add_to_group(&a, "room1").await.unwrap();
        store.add_to_group(&a, "room2").await.unwrap();
        store.add_to_group(&b, "room1").await.unwrap();
        store.link_user(&a, "user-a").await.unwrap();

        let removed = store.remove_connection(&a).await.unwrap();
        assert_eq!(
            removed,
            HashSet::from(["room1".to_string(), "room2".to_string()])
        );

        assert!(store.groups_of(&a).await.unwrap().is_empty());
        assert_eq!(store.members("room1").await.unwrap(), HashSet::from([b.clone()]));
        assert!(store.members("room2").await.unwrap().is_empty());
        assert_eq!(store.linked_user(&a).await.unwrap(), None);
        assert_eq!(store.group_count().await.unwrap(), Some(1));

        // Removing an unknown connection is harmless
        assert!(store.remove_connection(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guarded_join_requires_open_owner() {
        let store = LocalMembership::new();
        let id = ConnectionId::generate();

        // Never opened
        assert!(!store.add_to_group_if_open(&id, &id, "room1").await.unwrap());
        assert!(store.members("room1").await.unwrap().is_empty());

        store.mark_open(&id).await.unwrap();
        assert!(store.is_open(&id).await.unwrap());
        assert!(store.add_to_group_if_open(&id, &id, "room1").await.unwrap());

        store.remove_connection(&id).await.unwrap();
        assert!(!store.is_open(&id).await.unwrap());

        // Closed: nothing may be written for it any more
        assert!(!store.add_to_group_if_open(&id, &id, "room1").await.unwrap());
        assert!(store.groups_of(&id).await.unwrap().is_empty());
        assert!(store.members("room1").await.unwrap().is_empty());
        assert_eq!(store.group_count().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_guarded_join_for_pseudo_member_follows_owner() {
        let store = LocalMembership::new();
        let id = ConnectionId::generate();
        let nickname = groupcast_shared::nickname_key(&id);

        store.mark_open(&id).await.unwrap();
        assert!(store.add_to_group_if_open(&id, &nickname, "Alice").await.unwrap());
        assert_eq!(store.groups_of(&nickname).await.unwrap(), HashSet::from(["Alice".to_string()]));

        store.remove_connection(&id).await.unwrap();
        store.remove_connection(&nickname).await.unwrap();
        assert!(!store.add_to_group_if_open(&id, &nickname, "Alice").await.unwrap());
        assert!(store.members("Alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_count_ignores_nickname_groups() {
        let store = LocalMembership::new();
        let id = ConnectionId::generate();
        store.mark_open(&id).await.unwrap();

        store.add_to_group(&id, "room1").await.unwrap();
        store
            .add_to_group_if_open(&id, &groupcast_shared::nickname_key(&id), "Alice")
            .await
            .unwrap();

        assert_eq!(store.group_count().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_members_is_a_snapshot() {
        let store = LocalMembership::new();
        let a = ConnectionId::generate();
        store.add_to_group(&a, "room1").await.unwrap();

        let snapshot = store.members("room1").await.unwrap();
        store.add_to_group(&ConnectionId::generate(), "room1").await.unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.members("room1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_joins_do_not_lose_updates() {
        let store = Arc::new(LocalMembership::new());
        let mut handles = vec![];

        for _ in 0..200 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = ConnectionId::generate();
                store.add_to_group(&id, "busy").await.unwrap();
                id
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }

        assert_eq!(store.members("busy").await.unwrap(), ids);
    }

    #[tokio::test]
    async fn test_concurrent_leaves_leave_no_empty_group() {
        let store = Arc::new(LocalMembership::new());
        let ids: Vec<ConnectionId> = (0..100).map(|_| ConnectionId::generate()).collect();
        for id in &ids {
            store.add_to_group(id, "churn").await.unwrap();
        }

        let mut handles = vec![];
        for id in ids {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.remove_connection(&id).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(store.members("churn").await.unwrap().is_empty());
        assert_eq!(store.group_count().await.unwrap(), Some(0));
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_redis_membership_round_trip() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for redis tests");
        let client = redis::Client::open(url).unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let prefix = format!("groupcast-test-{}", uuid::Uuid::new_v4());
        let store = RedisMembership::new(conn, prefix);

        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        store.mark_open(&a).await.unwrap();
        assert!(store.add_to_group_if_open(&a, &a, "room1").await.unwrap());
        store.add_to_group(&a, "room2").await.unwrap();
        store.add_to_group(&b, "room1").await.unwrap();
        store.link_user(&a, "user-a").await.unwrap();

        // b was never marked open
        assert!(!store.add_to_group_if_open(&b, &b, "room3").await.unwrap());
        assert_eq!(store.members("room1").await.unwrap().len(), 2);
        assert_eq!(store.linked_user(&a).await.unwrap().as_deref(), Some("user-a"));

        let removed = store.remove_connection(&a).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.groups_of(&a).await.unwrap().is_empty());
        assert_eq!(store.members("room1").await.unwrap(), HashSet::from([b.clone()]));
        assert_eq!(store.linked_user(&a).await.unwrap(), None);
        assert!(!store.is_open(&a).await.unwrap());
        assert!(!store.add_to_group_if_open(&a, &a, "room1").await.unwrap());
        assert!(store.groups_of(&a).await.unwrap().is_empty());

        store.remove_connection(&b).await.unwrap();
    }
}
