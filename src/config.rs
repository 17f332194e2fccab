//! Configuration file parser for ~/.config/feedsweep/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level refresh configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Follow redirects that switch between http and https.
    pub follow_http_https_redirects: bool,

    /// Stop parsing a feed at the first entry that is not newer than the
    /// feed's last update.
    pub efficient_feed_parsing: bool,

    /// Record an image URL for each entry when the feed provides one.
    pub fetch_images: bool,

    /// Attach the unread-entry count to the completion event.
    pub notifications_enabled: bool,

    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,

    /// Upper bound for a buffered feed body.
    pub max_feed_bytes: usize,

    pub proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            follow_http_https_redirects: false,
            efficient_feed_parsing: true,
            fetch_images: false,
            notifications_enabled: false,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "follow_http_https_redirects",
                "efficient_feed_parsing",
                "fetch_images",
                "notifications_enabled",
                "connect_timeout_secs",
                "read_timeout_secs",
                "max_feed_bytes",
                "proxy",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            follow_http_https_redirects = config.follow_http_https_redirects,
            proxy = config.proxy.enabled,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Proxy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Http,
    Socks,
}

/// Optional outbound proxy.
///
/// Custom Debug impl masks `password`.
#[derive(Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    /// Only use the proxy while on Wi-Fi.
    pub wifi_only: bool,
    pub username: Option<String>,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: ProxyKind::Http,
            host: String::new(),
            port: 8080,
            wifi_only: false,
            username: None,
            password: None,
        }
    }
}

impl ProxyConfig {
    /// Whether the proxy applies to a batch on the given network.
    pub fn applies(&self, on_wifi: bool) -> bool {
        self.enabled && (on_wifi || !self.wifi_only)
    }

    /// Proxy URL in the form reqwest expects.
    pub fn url(&self) -> String {
        match self.kind {
            ProxyKind::Http => format!("http://{}:{}", self.host, self.port),
            ProxyKind::Socks => format!("socks5://{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("wifi_only", &self.wifi_only)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(SecretString::from))
}

// ============================================================================
// Tests
// ============================================================================
