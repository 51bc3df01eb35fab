//! TOML configuration parsing.
//!
//! ```toml
//! [db]
//! path = "./data/dossier.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8787"
//! # api_token_env = "DOSSIER_API_TOKEN"
//! # callback_token_env = "DOSSIER_CALLBACK_TOKEN"
//!
//! [storage]
//! bucket = "dossiers"
//! endpoint_url = "https://<account>.r2.cloudflarestorage.com"
//! public_base_url = "https://files.example.com"
//!
//! [pipelines]
//! notifier_url = "https://hook.make.com/..."
//! generation_url = "https://n8n.example.com/webhook/generate"
//! chat_url = "https://n8n.example.com/webhook/chat"
//! analysis_url = "https://n8n.example.com/webhook/analysis"
//! ```
//!
//! Every section except `[db]` and `[server]` is optional and has defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub pipelines: PipelinesConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Env var holding the bearer token required by `POST /upload-url`.
    #[serde(default)]
    pub api_token_env: Option<String>,
    /// Env var holding the bearer token required by the status callback.
    #[serde(default)]
    pub callback_token_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub endpoint_url: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub public_base_url: String,
    #[serde(default = "default_url_expiry_secs")]
    pub url_expiry_secs: u64,
}

fn default_region() -> String {
    "auto".to_string()
}
fn default_url_expiry_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelinesConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub notifier_url: Option<String>,
    #[serde(default)]
    pub generation_url: Option<String>,
    #[serde(default = "default_generation_auth_env")]
    pub generation_auth_env: String,
    #[serde(default)]
    pub chat_url: Option<String>,
    #[serde(default)]
    pub analysis_url: Option<String>,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            notifier_url: None,
            generation_url: None,
            generation_auth_env: default_generation_auth_env(),
            chat_url: None,
            analysis_url: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_generation_auth_env() -> String {
    "GENERATION_AUTH".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Pause between creating the first source of a batch and the rest.
    #[serde(default = "default_batch_stagger_ms")]
    pub batch_stagger_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_stagger_ms: default_batch_stagger_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_batch_stagger_ms() -> u64 {
    150
}
fn default_max_concurrent() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub batch_size: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_outbox_batch_size(),
        }
    }
}

fn default_max_attempts() -> u32 {
    6
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_outbox_batch_size() -> i64 {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Seconds a source may stay `processing` before the sweeper fails it.
    /// Zero disables the sweeper.
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            processing_timeout_secs: default_processing_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_processing_timeout_secs() -> u64 {
    86_400
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl LifecycleConfig {
    pub fn sweeper_enabled(&self) -> bool {
        self.processing_timeout_secs > 0
    }
}

impl Config {
    /// Read an optional secret from the environment variable named by `var`.
    pub fn secret(var: Option<&str>) -> Option<String> {
        var.and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if let Some(ref storage) = config.storage {
        if storage.bucket.trim().is_empty() {
            anyhow::bail!("storage.bucket must not be empty");
        }
        // SigV4 presigned URLs are valid for at most seven days.
        if !(1..=604_800).contains(&storage.url_expiry_secs) {
            anyhow::bail!("storage.url_expiry_secs must be in [1, 604800]");
        }
        for (name, url) in [
            ("storage.endpoint_url", &storage.endpoint_url),
            ("storage.public_base_url", &storage.public_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must be an http(s) URL, got '{}'", name, url);
            }
        }
    }

    if config.pipelines.timeout_secs == 0 {
        anyhow::bail!("pipelines.timeout_secs must be > 0");
    }

    if config.upload.max_concurrent == 0 {
        anyhow::bail!("upload.max_concurrent must be >= 1");
    }

    if config.outbox.max_attempts == 0 {
        anyhow::bail!("outbox.max_attempts must be >= 1");
    }
    if config.outbox.batch_size < 1 {
        anyhow::bail!("outbox.batch_size must be >= 1");
    }

    if config.lifecycle.sweeper_enabled() && config.lifecycle.sweep_interval_secs == 0 {
        anyhow::bail!("lifecycle.sweep_interval_secs must be > 0 when the sweeper is enabled");
    }

    Ok(())
}
