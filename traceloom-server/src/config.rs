// Copyright 2025 Traceloom Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Traceloom server configuration. Precedence: file > env > defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub attachments: AttachmentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP listen address (e.g. "127.0.0.1:8090")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Request timeout in seconds, propagated into the analytics driver.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Enable CORS (development convenience).
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyticsConfig {
    /// ClickHouse HTTP endpoint.
    #[serde(default = "default_clickhouse_url")]
    pub url: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Remote policy service that validates api keys and session cookies.
    /// When unset the server runs in local mode: every request is accepted
    /// and scoped by the workspace header alone.
    #[serde(default)]
    pub policy_url: Option<String>,

    /// Seconds a policy decision stays cached in memory.
    #[serde(default = "default_auth_cache_ttl")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachmentConfig {
    /// Directory attachment blobs are written to.
    #[serde(default = "default_attachment_dir")]
    pub data_dir: PathBuf,

    /// Minimum string length before the stripper probes for base64 media.
    #[serde(default = "default_strip_threshold")]
    pub strip_threshold_chars: usize,

    /// Hard limit on a single JSON string; longer is a deserialization
    /// error.
    #[serde(default = "default_max_string_bytes")]
    pub max_string_bytes: usize,

    /// Byte budget applied to each JSON tree when `truncate=true`.
    #[serde(default = "default_truncate_bytes")]
    pub truncate_bytes: usize,
}

fn default_http_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_enable_cors() -> bool {
    true
}

fn default_clickhouse_url() -> String {
    "http://127.0.0.1:8123".to_string()
}

fn default_database() -> String {
    "traceloom".to_string()
}

fn default_auth_cache_ttl() -> u64 {
    60
}

fn default_attachment_dir() -> PathBuf {
    PathBuf::from("./traceloom-data/attachments")
}

fn default_strip_threshold() -> usize {
    5_000
}

fn default_max_string_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_truncate_bytes() -> usize {
    10 * 1024
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            request_timeout_secs: default_request_timeout(),
            enable_cors: default_enable_cors(),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_database(),
            username: None,
            password: None,
        }
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_attachment_dir(),
            strip_threshold_chars: default_strip_threshold(),
            max_string_bytes: default_max_string_bytes(),
            truncate_bytes: default_truncate_bytes(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: HttpServerConfig::default(),
            analytics: AnalyticsConfig::default(),
            auth: AuthConfig::default(),
            attachments: AttachmentConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Supported environment variables:
    /// - TRACELOOM_HTTP_ADDR
    /// - TRACELOOM_CLICKHOUSE_URL / TRACELOOM_CLICKHOUSE_DATABASE
    /// - TRACELOOM_CLICKHOUSE_USER / TRACELOOM_CLICKHOUSE_PASSWORD
    /// - TRACELOOM_AUTH_POLICY_URL
    /// - TRACELOOM_ATTACHMENT_DIR
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TRACELOOM_HTTP_ADDR") {
            config.server.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("TRACELOOM_CLICKHOUSE_URL") {
            config.analytics.url = url;
        }
        if let Ok(db) = std::env::var("TRACELOOM_CLICKHOUSE_DATABASE") {
            config.analytics.database = db;
        }
        if let Ok(user) = std::env::var("TRACELOOM_CLICKHOUSE_USER") {
            config.analytics.username = Some(user);
        }
        if let Ok(password) = std::env::var("TRACELOOM_CLICKHOUSE_PASSWORD") {
            config.analytics.password = Some(password);
        }
        if let Ok(url) = std::env::var("TRACELOOM_AUTH_POLICY_URL") {
            config.auth.policy_url = Some(url);
        }
        if let Ok(dir) = std::env::var("TRACELOOM_ATTACHMENT_DIR") {
            config.attachments.data_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("loading configuration from {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("config file {:?} not found, using env/defaults", path);
                Self::from_env()
            }
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.attachments.strip_threshold_chars == 0 {
            anyhow::bail!("attachments.strip_threshold_chars must be positive");
        }
        if !self.attachments.data_dir.exists() {
            std::fs::create_dir_all(&self.attachments.data_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_and_validate() {
        let config = ServerConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8090");
        assert!(config.auth.policy_url.is_none());
        assert_eq!(config.attachments.strip_threshold_chars, 5_000);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: ServerConfig = toml::from_str(
            r#"
            [analytics]
            url = "http://clickhouse:8123"

            [auth]
            policy_url = "http://policy:3000/auth"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.analytics.url, "http://clickhouse:8123");
        assert_eq!(parsed.analytics.database, "traceloom");
        assert_eq!(
            parsed.auth.policy_url.as_deref(),
            Some("http://policy:3000/auth")
        );
        assert_eq!(parsed.server.listen_addr, "127.0.0.1:8090");
    }
}
