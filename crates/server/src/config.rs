//! Application configuration

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::realtime::BackplaneKind;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub sse_keep_alive: Duration,

    // Fanout
    pub backplane: BackplaneKind,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,

    // Directories
    pub rooms: Vec<String>,
    pub auth_tokens: HashMap<String, String>, // token -> user id
    pub user_names: HashMap<String, String>,  // user id -> display name

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let backplane = match env::var("BACKPLANE") {
            Ok(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                var: "BACKPLANE",
                reason,
            })?,
            Err(_) => BackplaneKind::Local,
        };

        let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty());
        if backplane == BackplaneKind::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            sse_keep_alive: Duration::from_secs(match env::var("SSE_KEEP_ALIVE_SECS") {
                Ok(value) => match value.trim().parse::<u64>() {
                    Ok(secs) if secs > 0 => secs,
                    _ => {
                        return Err(ConfigError::Invalid {
                            var: "SSE_KEEP_ALIVE_SECS",
                            reason: format!("expected a positive number of seconds, got '{}'", value),
                        })
                    }
                },
                Err(_) => 15,
            }),

            // Fanout
            backplane,
            redis_url,
            redis_key_prefix: env::var("REDIS_KEY_PREFIX")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| "groupcast".to_string()),

            // Directories
            rooms: env::var("ROOMS")
                .map(|value| parse_list(&value))
                .unwrap_or_default(),
            auth_tokens: match env::var("AUTH_TOKENS") {
                Ok(value) => parse_pairs("AUTH_TOKENS", &value)?,
                Err(_) => HashMap::new(),
            },
            user_names: match env::var("USER_NAMES") {
                Ok(value) => parse_pairs("USER_NAMES", &value)?,
                Err(_) => HashMap::new(),
            },

            // Logging
            log_json: env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

/// Comma-separated list, blanks dropped
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comma-separated `key:value` pairs
fn parse_pairs(var: &'static str, value: &str) -> Result<HashMap<String, String>, ConfigError> {
    parse_list(value)
        .into_iter()
        .map(|pair| match pair.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                var,
                reason: format!("expected 'key:value', got '{}'", pair),
            }),
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
