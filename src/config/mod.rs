pub mod secrets;
pub use secrets::Secrets;

use crate::oauth::ProviderConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Complete broker configuration. Read once at startup, immutable thereafter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP surface configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where to send the user after a successful callback. JSON body if unset.
    #[serde(default)]
    pub post_authorize_redirect: Option<String>,
    /// Browser origin allowed to call the token endpoints
    #[serde(default)]
    pub cors_origin: Option<String>,
    #[serde(default = "default_state_expiry")]
    pub state_expiry_seconds: i64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_state_expiry() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            post_authorize_redirect: None,
            cors_origin: None,
            state_expiry_seconds: default_state_expiry(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
        }
    }
}

/// Non-secret provider settings. Client credentials come from [`Secrets`].
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Upper bound on each token endpoint exchange
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_auth_url() -> String {
    "https://accounts.spotify.com/authorize".to_string()
}

fn default_token_url() -> String {
    "https://accounts.spotify.com/api/token".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/auth/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    ["streaming", "user-read-email", "user-read-private"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_timeout() -> u64 {
    10
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Token store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "storage/tokens.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl BrokerConfig {
    /// Join the provider settings with the client credential pair.
    pub fn provider_config(&self, secrets: &Secrets) -> ProviderConfig {
        ProviderConfig {
            auth_url: self.provider.auth_url.clone(),
            token_url: self.provider.token_url.clone(),
            redirect_uri: self.provider.redirect_uri.clone(),
            scopes: self.provider.scopes.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Load configuration from a TOML file, falling back to defaults when the file
/// does not exist.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    let path = path.as_ref();
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        Ok(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.state_expiry_seconds, 600);
        assert_eq!(config.provider.token_url, "https://accounts.spotify.com/api/token");
        assert_eq!(config.provider.scopes.join(" "), "streaming user-read-email user-read-private");
        assert_eq!(config.provider.timeout(), Duration::from_secs(10));
        assert_eq!(config.store.path, "storage/tokens.db");
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            port = 9090
            post_authorize_redirect = "http://localhost:1420/"
            cors_origin = "http://localhost:1420"

            [provider]
            auth_url = "https://auth.example.com/authorize"
            token_url = "https://auth.example.com/token"
            redirect_uri = "http://localhost:9090/auth/callback"
            scopes = ["read", "write"]
            timeout_seconds = 3

            [store]
            path = "/var/lib/tokenbroker/tokens.db"
        "#;

        let config: BrokerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(
            config.server.post_authorize_redirect.as_deref(),
            Some("http://localhost:1420/")
        );
        assert_eq!(config.provider.scopes, vec!["read", "write"]);
        assert_eq!(config.provider.timeout_seconds, 3);
        assert_eq!(config.store.path, "/var/lib/tokenbroker/tokens.db");
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [provider]
            timeout_seconds = 5
        "#;

        let config: BrokerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.provider.timeout_seconds, 5);
        assert_eq!(config.provider.auth_url, "https://accounts.spotify.com/authorize"); // Default
        assert_eq!(config.server.port, 8080); // Default
    }

    #[test]
    fn test_load_config_or_default() {
        let dir = tempfile::tempdir().unwrap();

        let missing = load_config_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(missing.server.port, 8080);

        let path = dir.path().join("tokenbroker.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[server]\nport = 7000").unwrap();
        assert_eq!(load_config_or_default(&path).unwrap().server.port, 7000);

        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(load_config_or_default(&path).is_err());
    }

    #[test]
    fn test_provider_config_joins_secrets() {
        let secrets = Secrets {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            encryption_key: "key".to_string(),
        };

        let provider = BrokerConfig::default().provider_config(&secrets);
        assert_eq!(provider.client_id, "id");
        assert_eq!(provider.client_secret, "secret");
        assert_eq!(provider.redirect_uri, "http://localhost:8080/auth/callback");
    }
}
