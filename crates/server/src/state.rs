//! Shared application state

use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::config::Config;
use crate::directory::{Authenticator, RoomDirectory, StaticDirectory, UserDirectory};
use crate::realtime::{
    Backplane, BackplaneKind, Chat, ConnectionRegistry, LocalBackplane, LocalMembership,
    MembershipStore, RealtimeError, RealtimeResult, RedisBackplane, RedisMembership,
};

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub chat: Chat,
    pub authenticator: Arc<dyn Authenticator>,
    pub users: Arc<dyn UserDirectory>,
    pub rooms: Arc<dyn RoomDirectory>,
}

impl AppState {
    /// State backed by one directory serving all three collaborator roles
    pub fn new(config: Config, registry: Arc<ConnectionRegistry>, directory: StaticDirectory) -> Self {
        let directory = Arc::new(directory);
        Self {
            config: Arc::new(config),
            chat: Chat::new(Arc::clone(&registry)),
            registry,
            authenticator: directory.clone(),
            users: directory.clone(),
            rooms: directory,
        }
    }

    pub fn backplane(&self) -> &Arc<dyn Backplane> {
        self.registry.backplane()
    }
}

/// Build the membership store and backplane selected by `config`
pub async fn connect_realtime(config: &Config) -> RealtimeResult<Arc<ConnectionRegistry>> {
    match config.backplane {
        BackplaneKind::Local => {
            let membership: Arc<dyn MembershipStore> = Arc::new(LocalMembership::new());
            let backplane = Arc::new(LocalBackplane::new(Arc::clone(&membership)));

            tracing::info!(backplane = %BackplaneKind::Local, "Realtime layer ready");
            Ok(Arc::new(ConnectionRegistry::new(membership, backplane)))
        }
        BackplaneKind::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                RealtimeError::Validation("REDIS_URL is required for the redis backplane".into())
            })?;
            let client = redis::Client::open(url)?;
            let conn = ConnectionManager::new(client.clone()).await?;

            let membership = RedisMembership::new(conn.clone(), config.redis_key_prefix.clone());
            membership.ping().await?;

            let backplane = Arc::new(RedisBackplane::start(
                client,
                conn,
                membership.clone(),
                config.redis_key_prefix.clone(),
            ));

            tracing::info!(
                backplane = %BackplaneKind::Redis,
                prefix = %config.redis_key_prefix,
                "Realtime layer ready"
            );
            Ok(Arc::new(ConnectionRegistry::new(Arc::new(membership), backplane)))
        }
    }
}
