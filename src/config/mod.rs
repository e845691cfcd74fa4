// Configuration for the gateway. Loaded once from YAML, then read through a
// global handle; the only runtime-mutable routing state (default backend,
// smart-routing flag) lives in the control plane, not here.

use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::envelope::Dialect;

static CONFIG: OnceCell<RwLock<AppConfig>> = OnceCell::new();
static CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default)]
    pub backends: Vec<BackendDesc>,

    #[serde(default)]
    pub default_backend: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    /// API key for the premium backend; overridden by the environment.
    #[serde(default)]
    pub premium_api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendDesc {
    pub name: String,
    pub url: String,
    pub dialect: Dialect,
    #[serde(default)]
    pub specialties: Vec<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    #[serde(default = "default_speed")]
    pub speed: String,
    #[serde(default)]
    pub premium: bool,
}

impl BackendDesc {
    pub fn has_specialty(&self, tag: &str) -> bool {
        self.specialties.iter().any(|s| s == tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub capture_bodies: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            capture_bodies: true,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Backend used for the structured LLM classification tier.
    #[serde(default)]
    pub classifier_backend: String,
    /// Smallest backend, used for the yes/no realtime probe.
    #[serde(default)]
    pub fast_backend: String,
    #[serde(default = "default_history_file")]
    pub history_file: String,
    /// Persist router history every N decisions.
    #[serde(default = "default_persist_every")]
    pub persist_every: usize,
    /// Re-dispatch with search results when a model answers that it has no
    /// real-time access. Aggressive; off unless the operator opts in.
    #[serde(default)]
    pub auto_search: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            enabled: true,
            classifier_backend: String::new(),
            fast_backend: String::new(),
            history_file: default_history_file(),
            persist_every: default_persist_every(),
            auto_search: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_archive_path")]
    pub path: String,
    /// Privacy toggles, enforced at write time.
    #[serde(default = "default_true")]
    pub store_queries: bool,
    #[serde(default = "default_true")]
    pub store_responses: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_max_entries")]
    pub max_entries: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            enabled: false,
            path: default_archive_path(),
            store_queries: true,
            store_responses: true,
            retention_days: default_retention_days(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_port() -> u16 {
    8742
}

fn default_metrics_port() -> u16 {
    9107
}

fn default_context_window() -> u64 {
    32768
}

fn default_speed() -> String {
    "medium".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_body_bytes() -> usize {
    4096
}

fn default_history_file() -> String {
    "~/.llm-proxy/router-history.json".to_string()
}

fn default_persist_every() -> usize {
    10
}

fn default_archive_path() -> String {
    "~/.llm-proxy/archive.db".to_string()
}

fn default_retention_days() -> i64 {
    30
}

fn default_max_entries() -> i64 {
    100_000
}

fn default_true() -> bool {
    true
}

pub fn init_config(path: Option<PathBuf>) -> Result<()> {
    let config_path = path
        .or_else(|| std::env::var("LLM_PROXY_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    CONFIG_PATH.set(config_path.clone()).ok();

    let mut config: AppConfig = if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        serde_yaml::from_str(&content)?
    } else {
        tracing::warn!("Config file {:?} not found, using defaults", config_path);
        AppConfig::default()
    };

    if let Ok(port) = std::env::var("LLM_PROXY_PORT") {
        if let Ok(port) = port.parse() {
            config.port = port;
        }
    }
    if let Ok(port) = std::env::var("LLM_PROXY_METRICS_PORT") {
        if let Ok(port) = port.parse() {
            config.metrics_port = port;
        }
    }
    if let Ok(key) = std::env::var("LLM_PROXY_PREMIUM_KEY") {
        if !key.trim().is_empty() {
            config.premium_api_key = key;
        }
    }

    validate(&config)?;

    CONFIG.set(RwLock::new(config)).ok();
    tracing::info!("Config initialized from {:?}", config_path);
    Ok(())
}

/// Install a config directly, bypassing the filesystem.
#[cfg(test)]
pub fn init_for_tests(config: AppConfig) {
    if let Some(lock) = CONFIG.get() {
        *lock.write() = config;
    } else {
        CONFIG.set(RwLock::new(config)).ok();
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.backends.is_empty() {
        anyhow::bail!("No backends configured");
    }
    if !config.default_backend.is_empty()
        && !config.backends.iter().any(|b| b.name == config.default_backend)
    {
        anyhow::bail!(
            "default-backend '{}' is not a configured backend",
            config.default_backend
        );
    }
    let mut seen = std::collections::HashSet::new();
    for backend in &config.backends {
        if !seen.insert(backend.name.clone()) {
            anyhow::bail!("Duplicate backend name '{}'", backend.name);
        }
    }
    Ok(())
}

pub fn get_config() -> Option<AppConfig> {
    CONFIG.get().map(|c| c.read().clone())
}

pub fn get_config_path() -> Option<PathBuf> {
    CONFIG_PATH.get().cloned()
}

pub fn get_backend(name: &str) -> Option<BackendDesc> {
    let config = get_config()?;
    config.backends.into_iter().find(|b| b.name == name)
}

pub fn backend_names() -> Vec<String> {
    get_config()
        .map(|c| c.backends.iter().map(|b| b.name.clone()).collect())
        .unwrap_or_default()
}

/// Premium backend, if one is configured.
pub fn premium_backend() -> Option<BackendDesc> {
    let config = get_config()?;
    config.backends.into_iter().find(|b| b.premium)
}

/// Backend with the smallest context window, used for the cheap probe tier.
pub fn smallest_backend() -> Option<BackendDesc> {
    let config = get_config()?;
    if !config.router.fast_backend.is_empty() {
        if let Some(backend) = config
            .backends
            .iter()
            .find(|b| b.name == config.router.fast_backend)
        {
            return Some(backend.clone());
        }
    }
    config.backends.into_iter().min_by_key(|b| b.context_window)
}

/// The configured fallback default; the live slot is owned by the control
/// plane and seeded from this at startup.
pub fn configured_default() -> String {
    get_config()
        .map(|c| {
            if c.default_backend.is_empty() {
                c.backends.first().map(|b| b.name.clone()).unwrap_or_default()
            } else {
                c.default_backend
            }
        })
        .unwrap_or_default()
}

pub fn resolve_path(raw: &str) -> PathBuf {
    if let Some(stripped) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
pub fn test_config() -> AppConfig {
    let yaml = r#"
host: 127.0.0.1
port: 8742
default-backend: general
backends:
  - name: general
    url: http://localhost:11434
    dialect: chat-completions
    specialties: [conversation, greetings]
    context-window: 32768
    speed: fast
  - name: coder
    url: http://localhost:11435
    dialect: chat-completions
    specialties: [code]
    context-window: 65536
    speed: medium
  - name: scout
    url: http://localhost:11436
    dialect: chat-completions
    specialties: [realtime, research]
    context-window: 8192
    speed: fast
  - name: archivist
    url: http://localhost:11437
    dialect: responses
    specialties: [research, complex]
    context-window: 200000
    speed: slow
  - name: premium
    url: https://api.example.com/v1
    dialect: messages
    specialties: [complex, code, research]
    context-window: 200000
    speed: medium
    premium: true
router:
  enabled: true
  classifier-backend: general
  fast-backend: scout
  history-file: /tmp/llm-proxy-test-history.json
"#;
    serde_yaml::from_str(yaml).expect("test config parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_yaml() {
        let config = test_config();
        assert_eq!(config.port, 8742);
        assert_eq!(config.backends.len(), 5);
        assert_eq!(config.backends[4].dialect, Dialect::Messages);
        assert!(config.backends[4].premium);
        assert_eq!(config.router.classifier_backend, "general");
    }

    #[test]
    fn validate_rejects_unknown_default() {
        let mut config = test_config();
        config.default_backend = "nonexistent".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut config = test_config();
        let duplicate = config.backends[0].clone();
        config.backends.push(duplicate);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn smallest_backend_prefers_configured_probe() {
        init_for_tests(test_config());
        let backend = smallest_backend().unwrap();
        assert_eq!(backend.name, "scout");
    }

    #[test]
    fn defaults_are_sane() {
        let config: AppConfig = serde_yaml::from_str("backends: []").unwrap();
        assert_eq!(config.logging.max_body_bytes, 4096);
        assert!(config.router.enabled);
        assert!(!config.router.auto_search);
        assert_eq!(config.archive.retention_days, 30);
    }
}
