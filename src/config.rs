use std::{fmt::Debug, path::PathBuf, time::Duration};

use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_LISTEN: &str = "0.0.0.0:8000";

/// Default embedding model (768 dimensions)
const DEFAULT_EMBEDDING_MODEL: &str = "bge-base-en-v1.5";
const DEFAULT_EMBEDDING_DIMENSION: usize = 768;
const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 300;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_FLUSH_EVERY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("couldnt find home dir")]
    NoHomeDir,

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStrategy {
    /// In-process fastembed model
    #[default]
    Local,
    /// Delegate to another instance's `POST /embeddings`
    Remote,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub strategy: EmbeddingStrategy,

    /// Model name for the local strategy (e.g. "bge-base-en-v1.5")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Model cache directory, defaults to `<base_path>/models`
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Width of every embedding row. Must match the model.
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Base url of the embedding delegate for the remote strategy
    #[serde(default)]
    pub remote_url: Option<String>,

    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            strategy: EmbeddingStrategy::Local,
            model: default_embedding_model(),
            cache_dir: None,
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            remote_url: None,
            timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Token lifetime used when the login response carries no expiry
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ReferenceConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Debug for ReferenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReferenceConfig {{ url: {:?}, username: {:?}, password: [REDUCTED], max_retries: {}, retry_delay_ms: {}, token_ttl_secs: {}, timeout_secs: {} }}", self.url, self.username, self.max_retries, self.retry_delay_ms, self.token_ttl_secs, self.timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Notes fetched per page during a full repopulation
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Store commit interval (in notes) during bulk rebuilds
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            reference: ReferenceConfig::default(),
            embedding: EmbeddingConfig::default(),
            sync: SyncConfig::default(),
            base_path: String::new(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_embedding_timeout_secs() -> u64 {
    DEFAULT_EMBEDDING_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_flush_every() -> usize {
    DEFAULT_FLUSH_EVERY
}

/// `NOTES_INDEX_BASE_PATH`, or `~/.local/share/notes-index`.
pub fn default_base_path() -> Result<String, ConfigError> {
    if let Ok(path) = std::env::var("NOTES_INDEX_BASE_PATH") {
        return Ok(path);
    }

    let home = my_home()
        .map_err(|_| ConfigError::NoHomeDir)?
        .ok_or(ConfigError::NoHomeDir)?;

    Ok(format!("{}/.local/share/notes-index", home.to_string_lossy()))
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimension must be greater than 0".to_string(),
            ));
        }

        if self.embedding.strategy == EmbeddingStrategy::Remote
            && self.embedding.remote_url.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::Invalid(
                "embedding.remote_url is required for the remote strategy".to_string(),
            ));
        }

        if self.sync.page_size == 0 {
            return Err(ConfigError::Invalid(
                "sync.page_size must be greater than 0".to_string(),
            ));
        }

        if self.sync.flush_every == 0 {
            return Err(ConfigError::Invalid(
                "sync.flush_every must be greater than 0".to_string(),
            ));
        }

        if self.reference.url.is_empty() {
            return Err(ConfigError::Invalid(
                "reference.url is not set (set NOTES_BE_URL)".to_string(),
            ));
        }

        Ok(())
    }

    /// Overlay deployment environment variables on top of the file config.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("NOTES_BE_URL") {
            self.reference.url = url;
        }
        if let Some(login) = lookup("NOTES_BE_LOGIN") {
            self.reference.username = login;
        }
        if let Some(password) = lookup("NOTES_BE_PASSWORD") {
            self.reference.password = password;
        }
        if let Some(cache) = lookup("MODELS_CACHE") {
            self.embedding.cache_dir = Some(cache);
        }
        if let Some(remote) = lookup("EMBEDDINGS_URL") {
            self.embedding.remote_url = Some(remote);
        }
    }

    pub fn load_with(base_path: &str) -> Result<Self, ConfigError> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8_lossy(&store.read(CONFIG_FILE)?).to_string();
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_string();
        config.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));

        config.validate()?;

        Ok(config)
    }

    /// Directory the local model files are cached in.
    pub fn models_dir(&self) -> PathBuf {
        match &self.embedding.cache_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&self.base_path).join("models"),
        }
    }

    pub fn notes_path(&self) -> PathBuf {
        PathBuf::from(&self.base_path).join("notes.csv")
    }

    pub fn embeddings_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_path).join("embeddings")
    }

    #[cfg(test)]
    pub fn for_tests(base_path: &str) -> Self {
        Self {
            base_path: base_path.to_string(),
            ..Default::default()
        }
    }
}
