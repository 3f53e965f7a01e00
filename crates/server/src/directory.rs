//! Narrow interfaces to the systems that own users, credentials and rooms

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::config::Config;

/// Resolves a bearer credential to a user id
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<String>;
}

/// Resolves a user id to the name shown to other members
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Option<String>;
}

/// Answers whether a chat room exists
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn room_exists(&self, room: &str) -> bool;
}

/// Fixed tables loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    tokens: HashMap<String, String>,
    names: HashMap<String, String>,
    rooms: HashSet<String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            tokens: config.auth_tokens.clone(),
            names: config.user_names.clone(),
            rooms: config.rooms.iter().cloned().collect(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(user_id.into(), name.into());
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.rooms.insert(room.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticDirectory {
    async fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn display_name(&self, user_id: &str) -> Option<String> {
        self.names.get(user_id).cloned()
    }
}

#[async_trait]
impl RoomDirectory for StaticDirectory {
    async fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains(room)
    }
}
