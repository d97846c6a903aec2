//! Environment-driven configuration, parsed once at startup.

use std::env;

use thiserror::Error;

use crate::identity::OAuthConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    /// Allowed WebSocket origins; empty allows any.
    pub allowed_origins: Vec<String>,
    pub oauth: OAuthConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: optional("BIND_ADDR", "0.0.0.0:8080"),
            database_url: required("DATABASE_URL")?,
            redis_url: optional("REDIS_URL", "redis://127.0.0.1:6379"),
            jwt_secret: required("JWT_SECRET")?,
            allowed_origins: parse_origins(&env::var("ALLOWED_ORIGINS").unwrap_or_default()),
            oauth: OAuthConfig {
                google_client_id: optional("GOOGLE_CLIENT_ID", ""),
                google_client_secret: optional("GOOGLE_CLIENT_SECRET", ""),
                github_client_id: optional("GITHUB_CLIENT_ID", ""),
                github_client_secret: optional("GITHUB_CLIENT_SECRET", ""),
                redirect_url: optional("OAUTH_REDIRECT_URL", ""),
            },
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
