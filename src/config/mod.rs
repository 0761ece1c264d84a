//! Configuration system
//!
//! Handles loading configuration from multiple sources:
//! - Global config (~/.config/rlm-engine/config.toml)
//! - Project config (./rlm.toml or .rlm/config.toml)
//! - Environment variables (RLM_*)

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

use crate::rlm::RlmError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlmConfig {
    /// Model reference for the root invocation
    #[serde(default)]
    pub root_model: Option<String>,

    /// Model reference for sub-queries (falls back to `root_model`)
    #[serde(default)]
    pub subcall_model: Option<String>,

    /// Maximum model turns per invocation
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Deepest level a sub-query may run at (root is 0)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Wall-clock limit for one sandbox run
    #[serde(default = "default_sandbox_timeout_ms")]
    pub sandbox_timeout_ms: u64,

    /// Advisory memory ceiling for scripts
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,

    /// Estimated spend at which a run stops with a partial result
    #[serde(default)]
    pub cost_ceiling: Option<f64>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Concurrent sub-queries in one batch
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Cap on captured and rendered script output
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,

    /// Input lines shown in the system prompt
    #[serde(default = "default_preview_lines")]
    pub preview_lines: usize,

    /// Use the streaming completion endpoint
    #[serde(default)]
    pub streaming: bool,
}

fn default_max_iterations() -> usize {
    15
}

fn default_max_depth() -> usize {
    1
}

fn default_sandbox_timeout_ms() -> u64 {
    30_000
}

fn default_memory_limit_mb() -> usize {
    64
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> usize {
    2000
}

fn default_model_timeout_secs() -> u64 {
    60
}

fn default_max_parallel() -> usize {
    8
}

fn default_max_output_chars() -> usize {
    20_000
}

fn default_preview_lines() -> usize {
    25
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            root_model: None,
            subcall_model: None,
            max_iterations: default_max_iterations(),
            max_depth: default_max_depth(),
            sandbox_timeout_ms: default_sandbox_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            cost_ceiling: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            model_timeout_secs: default_model_timeout_secs(),
            max_parallel: default_max_parallel(),
            max_output_chars: default_max_output_chars(),
            preview_lines: default_preview_lines(),
            streaming: false,
        }
    }
}

/// One config file; unset keys leave earlier sources alone
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigLayer {
    root_model: Option<String>,
    subcall_model: Option<String>,
    max_iterations: Option<usize>,
    max_depth: Option<usize>,
    sandbox_timeout_ms: Option<u64>,
    memory_limit_mb: Option<usize>,
    cost_ceiling: Option<f64>,
    temperature: Option<f32>,
    max_tokens: Option<usize>,
    model_timeout_secs: Option<u64>,
    max_parallel: Option<usize>,
    max_output_chars: Option<usize>,
    preview_lines: Option<usize>,
    streaming: Option<bool>,
}

impl RlmConfig {
    /// Load configuration from all sources (global, project, env)
    pub async fn load() -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(global) = Self::global_config_path() {
            paths.push(global);
        }
        paths.extend(["rlm.toml", ".rlm/config.toml"].map(PathBuf::from));

        let mut config = Self::load_from_paths(&paths).await?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Merge existing files in order, later files taking precedence
    pub async fn load_from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut config = Self::default();
        for path in paths {
            if path.exists() {
                let layer = read_layer(path).await?;
                tracing::debug!(path = %path.display(), "Loaded config layer");
                config = config.merge(layer);
            }
        }
        Ok(config)
    }

    /// Parse a complete config from TOML
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let layer: ConfigLayer = toml::from_str(content)?;
        Ok(Self::default().merge(layer))
    }

    /// Get the global config path
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("ai", "rlm", "rlm-engine")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check limits are usable
    pub fn validate(&self) -> std::result::Result<(), RlmError> {
        if self.max_iterations == 0 {
            return Err(RlmError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.sandbox_timeout_ms == 0 {
            return Err(RlmError::InvalidConfig(
                "sandbox_timeout_ms must be positive".to_string(),
            ));
        }
        if self.memory_limit_mb == 0 {
            return Err(RlmError::InvalidConfig(
                "memory_limit_mb must be at least 1".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(RlmError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.max_output_chars == 0 {
            return Err(RlmError::InvalidConfig(
                "max_output_chars must be positive".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RlmError::InvalidConfig(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if let Some(ceiling) = self.cost_ceiling {
            if !ceiling.is_finite() || ceiling < 0.0 {
                return Err(RlmError::InvalidConfig(format!(
                    "cost_ceiling {} must be a non-negative number",
                    ceiling
                )));
            }
        }
        Ok(())
    }

    /// Model used for sub-queries
    pub fn subcall_model(&self) -> Option<&str> {
        self.subcall_model
            .as_deref()
            .or(self.root_model.as_deref())
    }

    /// Merge a layer (layer takes precedence)
    fn merge(mut self, other: ConfigLayer) -> Self {
        if other.root_model.is_some() {
            self.root_model = other.root_model;
        }
        if other.subcall_model.is_some() {
            self.subcall_model = other.subcall_model;
        }
        if other.cost_ceiling.is_some() {
            self.cost_ceiling = other.cost_ceiling;
        }
        self.max_iterations = other.max_iterations.unwrap_or(self.max_iterations);
        self.max_depth = other.max_depth.unwrap_or(self.max_depth);
        self.sandbox_timeout_ms = other.sandbox_timeout_ms.unwrap_or(self.sandbox_timeout_ms);
        self.memory_limit_mb = other.memory_limit_mb.unwrap_or(self.memory_limit_mb);
        self.temperature = other.temperature.unwrap_or(self.temperature);
        self.max_tokens = other.max_tokens.unwrap_or(self.max_tokens);
        self.model_timeout_secs = other.model_timeout_secs.unwrap_or(self.model_timeout_secs);
        self.max_parallel = other.max_parallel.unwrap_or(self.max_parallel);
        self.max_output_chars = other.max_output_chars.unwrap_or(self.max_output_chars);
        self.preview_lines = other.preview_lines.unwrap_or(self.preview_lines);
        self.streaming = other.streaming.unwrap_or(self.streaming);
        self
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("RLM_ROOT_MODEL") {
            self.root_model = Some(val);
        }
        if let Some(val) = lookup("RLM_SUBCALL_MODEL") {
            self.subcall_model = Some(val);
        }
        if let Some(val) = lookup("RLM_COST_CEILING") {
            match val.trim().parse::<f64>() {
                Ok(ceiling) => self.cost_ceiling = Some(ceiling),
                Err(_) => tracing::warn!(value = %val, "Invalid RLM_COST_CEILING value; expected a number"),
            }
        }
        if let Some(val) = lookup("RLM_STREAMING") {
            match parse_bool(&val) {
                Ok(enabled) => self.streaming = enabled,
                Err(_) => tracing::warn!(value = %val, "Invalid RLM_STREAMING value; expected true/false"),
            }
        }
        env_number(&lookup, "RLM_MAX_ITERATIONS", &mut self.max_iterations);
        env_number(&lookup, "RLM_MAX_DEPTH", &mut self.max_depth);
        env_number(&lookup, "RLM_SANDBOX_TIMEOUT_MS", &mut self.sandbox_timeout_ms);
        env_number(&lookup, "RLM_MEMORY_LIMIT_MB", &mut self.memory_limit_mb);
        env_number(&lookup, "RLM_TEMPERATURE", &mut self.temperature);
        env_number(&lookup, "RLM_MAX_TOKENS", &mut self.max_tokens);
        env_number(&lookup, "RLM_MODEL_TIMEOUT_SECS", &mut self.model_timeout_secs);
        env_number(&lookup, "RLM_MAX_PARALLEL", &mut self.max_parallel);
        env_number(&lookup, "RLM_MAX_OUTPUT_CHARS", &mut self.max_output_chars);
        env_number(&lookup, "RLM_PREVIEW_LINES", &mut self.preview_lines);
    }
}

async fn read_layer(path: &Path) -> Result<ConfigLayer> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn env_number<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(val) = lookup(key) {
        match val.trim().parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %val, "Invalid numeric environment override, ignored"),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid boolean value: {}", value),
    }
}
