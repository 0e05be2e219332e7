use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::proxy::error::RelayError;

/// Default request body cap: 10 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional shared bearer token for inbound requests.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub router: RouterRules,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(skip)]
    pub config_source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_base: String,
    #[serde(default)]
    pub api_key: KeyEntry,
    #[serde(default)]
    pub models: Vec<String>,
    /// When set, only these models may be selected for this provider.
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub model_metadata: HashMap<String, serde_json::Value>,
}

impl ProviderConfig {
    pub fn allows(&self, model: &str) -> bool {
        match &self.whitelist {
            Some(list) => list.iter().any(|m| m == model),
            None => true,
        }
    }

    /// Models this provider advertises through `GET /v1/models`.
    pub fn advertised_models(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for m in self.models.iter().chain(self.whitelist.iter().flatten()) {
            if seen.insert(m.as_str()) {
                out.push(m.as_str());
            }
        }
        out
    }
}

/// API key material: a single key or a pool rotated round-robin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyEntry {
    Single(String),
    Pool(Vec<String>),
}

impl Default for KeyEntry {
    fn default() -> Self {
        KeyEntry::Single(String::new())
    }
}

impl KeyEntry {
    pub fn keys(&self) -> Vec<String> {
        match self {
            KeyEntry::Single(s) if s.is_empty() => Vec::new(),
            KeyEntry::Single(s) => vec![s.clone()],
            KeyEntry::Pool(v) => v.iter().filter(|k| !k.is_empty()).cloned().collect(),
        }
    }
}

/// Round-robin key selector shared by all in-flight requests of one adapter.
#[derive(Debug, Default)]
pub struct KeyPool {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl KeyPool {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn from_entry(entry: &KeyEntry) -> Self {
        Self::new(entry.keys())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn next(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(self.keys[i].clone())
    }
}

/// Route class -> "provider/model" mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRules {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub think: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub long_context: Option<String>,
    #[serde(default)]
    pub web_search: Option<String>,
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: usize,
}

impl Default for RouterRules {
    fn default() -> Self {
        Self {
            default: None,
            think: None,
            background: None,
            long_context: None,
            web_search: None,
            long_context_threshold: default_long_context_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default)]
    pub token_counter: TokenCounterSettings,
    #[serde(default)]
    pub system_prompt: SystemPromptSettings,
    #[serde(default)]
    pub response_filter: ResponseFilterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCounterSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for TokenCounterSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemPromptSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseFilterSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub replacement: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3456
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_long_context_threshold() -> usize {
    60_000
}

fn default_enabled() -> bool {
    true
}

const CONFIG_FILE_NAME: &str = "ccrelay.toml";

impl RelayConfig {
    /// Global config path (~/.config/ccrelay/config.toml).
    pub fn global_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("cannot determine config directory")?
            .join("ccrelay");
        Ok(config_dir.join("config.toml"))
    }

    /// Discover a config file: explicit path, $CCRELAY_CONFIG, ./ccrelay.toml,
    /// then the global path.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        if let Ok(env_path) = std::env::var("CCRELAY_CONFIG") {
            return Self::load_from(Path::new(&env_path));
        }

        if let Ok(cwd) = std::env::current_dir() {
            let local = cwd.join(CONFIG_FILE_NAME);
            if local.exists() {
                return Self::load_from(&local);
            }
        }

        let global = Self::global_path()?;
        if global.exists() {
            return Self::load_from(&global);
        }

        anyhow::bail!(
            "no config found (searched ./{CONFIG_FILE_NAME} and {})",
            global.display()
        )
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let mut config: RelayConfig =
            toml::from_str(&content).with_context(|| "failed to parse config")?;
        config.config_source = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Startup invariant checks. A failing config refuses to serve.
    pub fn validate(&self) -> std::result::Result<(), RelayError> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(RelayError::Config("provider with empty name".to_string()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
            let url = reqwest::Url::parse(&provider.api_base).map_err(|e| {
                RelayError::Config(format!(
                    "provider '{}' has invalid api_base '{}': {e}",
                    provider.name, provider.api_base
                ))
            })?;
            if url.host_str().is_none() {
                return Err(RelayError::Config(format!(
                    "provider '{}' api_base has no host",
                    provider.name
                )));
            }
        }

        if self.router.default.is_none() {
            return Err(RelayError::Config(
                "router.default route is not configured".to_string(),
            ));
        }
        for (class, rule) in self.router.entries() {
            let Some((provider, model)) = rule.split_once('/') else {
                return Err(RelayError::Config(format!(
                    "router.{class} must be '<provider>/<model>', got '{rule}'"
                )));
            };
            let Some(cfg) = self.find_provider(provider) else {
                return Err(RelayError::Config(format!(
                    "router.{class} references unknown provider '{provider}'"
                )));
            };
            if !cfg.allows(model) {
                return Err(RelayError::Config(format!(
                    "router.{class} model '{model}' is not in provider '{provider}' whitelist"
                )));
            }
        }

        Ok(())
    }

    pub fn find_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

impl RouterRules {
    /// Configured (class name, rule) pairs, for validation and diagnostics.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(r) = &self.default {
            out.push(("default", r.as_str()));
        }
        if let Some(r) = &self.think {
            out.push(("think", r.as_str()));
        }
        if let Some(r) = &self.background {
            out.push(("background", r.as_str()));
        }
        if let Some(r) = &self.long_context {
            out.push(("long_context", r.as_str()));
        }
        if let Some(r) = &self.web_search {
            out.push(("web_search", r.as_str()));
        }
        out
    }
}
