//! Client settings: built-in defaults, then an optional TOML file, then
//! `SECURECHAT_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::chat_api::parse_base_url;
use crate::crypto::{KeyDerivation, ParticipantPair};
use crate::error::{ChatError, Result};

const CONFIG_FILE_NAME: &str = "securechat.toml";
const CONFIG_PATH_ENV: &str = "SECURECHAT_CONFIG";
const ENV_PREFIX: &str = "SECURECHAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDerivationKind {
    Sha256,
    Pbkdf2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub server_url: String,
    pub user_id: String,
    /// Sent to the face verification endpoint; falls back to `user_id`.
    pub username: String,
    /// The other participant of the conversation this client shows.
    pub recipient_id: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_message_length: usize,
    pub encrypt_by_default: bool,
    pub face_lock_by_default: bool,
    pub push_enabled: bool,
    pub key_derivation: KeyDerivationKind,
    pub pbkdf2_iterations: u32,
    /// Raw `Cookie` header value from a logged-in browser session.
    pub session_cookie: Option<String>,
    pub log_level: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000/".to_string(),
            user_id: String::new(),
            username: String::new(),
            recipient_id: String::new(),
            poll_interval_secs: 5,
            request_timeout_secs: 10,
            max_message_length: 1000,
            encrypt_by_default: true,
            face_lock_by_default: false,
            push_enabled: true,
            key_derivation: KeyDerivationKind::Sha256,
            pbkdf2_iterations: crate::crypto::key_store::DEFAULT_PBKDF2_ITERATIONS,
            session_cookie: None,
            log_level: "info".to_string(),
        }
    }
}

impl ChatSettings {
    /// Load from `$SECURECHAT_CONFIG`, else `./securechat.toml`, else the user
    /// config dir, then apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let path = explicit.clone().or_else(Self::discover_file);
        let settings = Self::load_from(path.as_deref(), explicit.is_some())?;
        settings.validate()?;
        Ok(settings)
    }

    fn discover_file() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("securechat").join(CONFIG_FILE_NAME))
            .filter(|p| p.is_file())
    }

    /// Build settings from an optional file plus the environment. Not validated.
    pub fn load_from(path: Option<&Path>, required: bool) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            log::info!("Loading settings from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(required));
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| ChatError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        ParticipantPair::new(&self.user_id, &self.recipient_id).map_err(|e| {
            ChatError::ConfigError(format!("user_id / recipient_id: {}", e))
        })?;
        if self.poll_interval_secs == 0 {
            return Err(ChatError::ConfigError(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ChatError::ConfigError(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.max_message_length == 0 {
            return Err(ChatError::ConfigError(
                "max_message_length must be at least 1".to_string(),
            ));
        }
        if self.key_derivation == KeyDerivationKind::Pbkdf2 && self.pbkdf2_iterations == 0 {
            return Err(ChatError::ConfigError(
                "pbkdf2_iterations must be at least 1".to_string(),
            ));
        }
        parse_base_url(&self.server_url)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn key_derivation(&self) -> KeyDerivation {
        match self.key_derivation {
            KeyDerivationKind::Sha256 => KeyDerivation::Sha256,
            KeyDerivationKind::Pbkdf2 => KeyDerivation::pbkdf2(self.pbkdf2_iterations),
        }
    }

    pub fn effective_username(&self) -> &str {
        if self.username.trim().is_empty() {
            &self.user_id
        } else {
            &self.username
        }
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
