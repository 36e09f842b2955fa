use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CrewlineError, Result};
use crate::types::AgentProfile;

/// Top-level Crewline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    /// Agent directory used to resolve `assignedAgentIds`.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

/// Editor session coalescing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    /// Quiet period after the last edit before the graph is flushed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    100
}

/// Auto-layout spacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Vertical distance between ranks.
    #[serde(default = "default_row_height")]
    pub row_height: f64,
    /// Horizontal distance between nodes sharing a rank.
    #[serde(default = "default_column_width")]
    pub column_width: f64,
    #[serde(default)]
    pub origin_x: f64,
    #[serde(default)]
    pub origin_y: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            row_height: default_row_height(),
            column_width: default_column_width(),
            origin_x: 0.0,
            origin_y: 0.0,
        }
    }
}

fn default_row_height() -> f64 {
    150.0
}

fn default_column_width() -> f64 {
    260.0
}

/// Mission execution tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Entry stages start `active` when an execution is created.
    #[serde(default = "default_auto_activate_entries")]
    pub auto_activate_entries: bool,
    /// Per-stage log cap (0 = unbounded).
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            auto_activate_entries: default_auto_activate_entries(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

fn default_auto_activate_entries() -> bool {
    true
}

fn default_max_log_entries() -> usize {
    500
}

/// Pipeline store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.crewline/crewline.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every API route except health.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CrewlineError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| CrewlineError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let path = &self.store.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
