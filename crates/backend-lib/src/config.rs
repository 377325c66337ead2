// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Shared secret used to sign session tokens (HS512)
    pub signer_key: String,
    /// Session token lifetime in seconds
    pub token_ttl_secs: u64,
    /// Expiry leeway applied when refreshing an expired token, in seconds
    pub refresh_grace_secs: u64,
    /// Length of generated meeting codes
    pub meeting_code_length: usize,
    /// Default meeting window in minutes when no end is given
    pub meeting_default_duration_mins: i64,
    /// Log level
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().expect("valid default addr"),
            signer_key: String::new(),
            token_ttl_secs: 60 * 60,
            refresh_grace_secs: 60 * 60,
            meeting_code_length: 10,
            meeting_default_duration_mins: 30,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `config.toml` and `PARLEY_`-prefixed
    /// environment variables, on top of the defaults.
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load settings from an explicit config file path.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PARLEY_"))
            .extract()?;
        Ok(settings)
    }
}
