use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::auth::session::PersistenceMode;
use crate::error::CorpregError;

// Default configuration values
pub const DEFAULT_EMULATOR_HOST: &str = "http://localhost:9099";
const DEFAULT_CONFIG_FILE: &str = "corpreg.json";
const DEFAULT_SESSION_STORE: &str = "corpreg-session.json";
const DEFAULT_SESSION_NAMESPACE: &str = "corpreg";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity provider project settings
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Session persistence settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// Project settings for the hosted identity provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub auth_domain: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub storage_bucket: String,
    #[serde(default)]
    pub messaging_sender_id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub measurement_id: Option<String>,
    /// Auth emulator to talk to instead of the hosted endpoints
    #[serde(default)]
    pub emulator_host: Option<String>,
    /// Production deployments never fall back to the emulator
    #[serde(default)]
    pub production: bool,
}

/// Where durable sessions are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Key prefix inside the store file
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Persistence used when the caller does not choose one
    #[serde(default)]
    pub default_persistence: PersistenceMode,
}

fn default_store_path() -> PathBuf {
    std::env::var("CORPREG_SESSION_STORE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SESSION_STORE))
}

fn default_namespace() -> String {
    DEFAULT_SESSION_NAMESPACE.to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            namespace: default_namespace(),
            default_persistence: PersistenceMode::default(),
        }
    }
}

impl ProviderConfig {
    /// Check that every field the provider needs is present.
    ///
    /// The error names the first missing field.
    pub fn validate(&self) -> Result<(), CorpregError> {
        let required = [
            ("api_key", &self.api_key),
            ("auth_domain", &self.auth_domain),
            ("project_id", &self.project_id),
            ("storage_bucket", &self.storage_bucket),
            ("messaging_sender_id", &self.messaging_sender_id),
            ("app_id", &self.app_id),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CorpregError::ConfigMissing { field });
            }
        }

        if let Some(host) = &self.emulator_host {
            if !host.starts_with("http://") && !host.starts_with("https://") {
                return Err(CorpregError::config_invalid(format!(
                    "emulator host '{host}' must be an http(s) URL"
                )));
            }
        }

        Ok(())
    }

    /// Emulator the provider should use, if any.
    ///
    /// An explicit host always wins; otherwise non-production configs use the
    /// local default.
    pub fn emulator(&self) -> Option<String> {
        match &self.emulator_host {
            Some(host) => Some(host.clone()),
            None if !self.production => Some(DEFAULT_EMULATOR_HOST.to_string()),
            None => None,
        }
    }

    /// Apply environment overrides using `lookup` to read variables
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields: [(&str, &mut String); 6] = [
            ("FIREBASE_API_KEY", &mut self.api_key),
            ("FIREBASE_AUTH_DOMAIN", &mut self.auth_domain),
            ("FIREBASE_PROJECT_ID", &mut self.project_id),
            ("FIREBASE_STORAGE_BUCKET", &mut self.storage_bucket),
            ("FIREBASE_MESSAGING_SENDER_ID", &mut self.messaging_sender_id),
            ("FIREBASE_APP_ID", &mut self.app_id),
        ];

        for (var, field) in fields {
            if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
                *field = value;
            }
        }

        if let Some(value) = lookup("FIREBASE_MEASUREMENT_ID").filter(|v| !v.is_empty()) {
            self.measurement_id = Some(value);
        }
        if let Some(value) = lookup("CORPREG_AUTH_EMULATOR").filter(|v| !v.is_empty()) {
            self.emulator_host = Some(value);
        }
        if let Some(value) = lookup("CORPREG_PRODUCTION").and_then(|v| v.parse().ok()) {
            self.production = value;
        }
    }
}

impl Config {
    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.provider.apply_overrides(|var| std::env::var(var).ok());

        if let Ok(path) = std::env::var("CORPREG_SESSION_STORE") {
            self.session.store_path = PathBuf::from(path);
        }
    }
}

/// Load the application configuration
pub async fn load_config() -> Result<Config> {
    let config_path = get_config_path();
    let mut config = load_or_create_config(&config_path).await?;
    config.apply_env_overrides();
    Ok(config)
}

/// Get the path to the configuration file
fn get_config_path() -> PathBuf {
    std::env::var("CORPREG_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load configuration from file or create default
pub async fn load_or_create_config(path: &Path) -> Result<Config> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        let default_config = Config::default();
        save_config(path, &default_config).await?;
        info!("Created default configuration at {}", path.display());
        return Ok(default_config);
    }

    let config_str = fs::read_to_string(path).await?;
    let config: Config =
        serde_json::from_str(&config_str).map_err(CorpregError::config_invalid)?;
    debug!("Loaded configuration from {}", path.display());

    Ok(config)
}

/// Save configuration to file
pub async fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str).await?;
    debug!("Saved configuration to {}", path.display());

    Ok(())
}
