use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::credentials::{EnvCredential, FallbackCredential, FileCredential};

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [server]
//                    ws_endpoint = "wss://chat.example.com/ws-chat/websocket"
//
//   env var:         LIVE_CHAT_SERVER__WS_ENDPOINT=...   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Where the chat backend lives (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_ws_endpoint")]
    pub ws_endpoint: String,
    #[serde(default = "default_http_base_url")]
    pub http_base_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: default_ws_endpoint(),
            http_base_url: default_http_base_url(),
        }
    }
}

/// Session timing (`[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_history_timeout_secs")]
    pub history_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// 0 disables automatic reconnects.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            history_timeout_secs: default_history_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Credential lookup (`[auth]`). Both sources are read on every send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Defaults to `<data_dir>/jwt-token`.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            token_file: None,
        }
    }
}

impl AuthFileConfig {
    /// Env var first, then the token file.
    pub fn credential_source(&self, data_dir: &Path) -> FallbackCredential {
        let token_file = self
            .token_file
            .clone()
            .unwrap_or_else(|| data_dir.join(TOKEN_FILE_NAME));
        FallbackCredential::new(vec![
            Box::new(EnvCredential::new(self.token_env.clone())),
            Box::new(FileCredential::new(token_file)),
        ])
    }
}

const TOKEN_FILE_NAME: &str = "jwt-token";

fn default_ws_endpoint() -> String {
    "ws://localhost:8083/ws-chat/websocket".to_string()
}
fn default_http_base_url() -> String {
    "http://localhost:8083".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_history_timeout_secs() -> u64 {
    10
}
fn default_reconnect_delay_secs() -> u64 {
    3
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_token_env() -> String {
    "LIVE_CHAT_TOKEN".to_string()
}

/// Build a figment that layers: defaults → config.toml → LIVE_CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `LIVE_CHAT_SESSION__RECONNECT_DELAY_SECS=1`  →  `session.reconnect_delay_secs = 1`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("LIVE_CHAT_").split("__"))
}

// =============================================================================
// Runtime views
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub history_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs.max(1)),
            history_timeout: Duration::from_secs(fc.history_timeout_secs.max(1)),
            reconnect_delay: Duration::from_secs(fc.reconnect_delay_secs),
            max_reconnect_attempts: fc.max_reconnect_attempts,
        }
    }
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct LiveChatConfig {
    pub data_dir: PathBuf,
}

impl LiveChatConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".live-chat"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE_NAME)
    }
}
