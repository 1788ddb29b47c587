//! Configuration module.
//!
//! Loads typed configuration from `~/.hermitbot/config.json`.
//! All fields use `serde` defaults so a partial file (or none at all)
//! still yields a working configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agent::compress::CompressorConfig;
use crate::agent::context::ContextConfig;
use crate::agent::guard::ContextGuardConfig;
use crate::agent::AgentConfig;
use crate::router::OnboardingConfig;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub agent: AgentSettings,
    pub session: SessionSettings,
    pub compression: CompressionSettings,
    pub guard: GuardSettings,
    pub cron: CronSettings,
    pub scanner: ScannerSettings,
    pub onboarding: OnboardingSettings,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// `~/.hermitbot/config.json`.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// `~/.hermitbot`.
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hermitbot")
    }

    /// Resolved session data directory.
    pub fn session_dir(&self) -> PathBuf {
        resolve_path(&self.session.data_dir)
    }

    /// Resolved cron data directory.
    pub fn cron_dir(&self) -> PathBuf {
        resolve_path(&self.cron.data_dir)
    }

    /// Write the default config template to disk.
    pub fn write_default_template() -> anyhow::Result<PathBuf> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = serde_json::json!({
            "agent": {
                "model": "anthropic/claude-sonnet-4-5",
                "maxIterations": 10
            },
            "session": {
                "dataDir": "~/.hermitbot/sessions"
            },
            "cron": {
                "dataDir": "~/.hermitbot/cron"
            }
        });

        std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
        Ok(path)
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            id: self.agent.id.clone(),
            max_iterations: self.agent.max_iterations,
            memory_top_k: self.agent.memory_top_k,
        }
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            system_prompt: self.agent.system_prompt.clone(),
            model: self.agent.model.clone(),
            max_tokens: self.agent.max_tokens,
            temperature: self.agent.temperature,
            message_budget: self.session.message_budget,
            thinking_budget: self.agent.thinking_budget,
        }
    }

    pub fn compressor_config(&self) -> CompressorConfig {
        CompressorConfig {
            threshold: self.compression.threshold,
            keep_recent: self.compression.keep_recent,
        }
    }

    pub fn guard_config(&self) -> ContextGuardConfig {
        ContextGuardConfig {
            max_tokens: self.guard.max_tokens,
            reserve_tokens: self.guard.reserve_tokens,
            safety_margin: self.guard.safety_margin,
        }
    }

    pub fn onboarding_config(&self) -> OnboardingConfig {
        OnboardingConfig {
            welcome: self.onboarding.welcome.clone(),
            milestone_hint: self.onboarding.milestone_hint.clone(),
        }
    }
}

/// Expand a leading `~/` against the home directory.
fn resolve_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(raw)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSettings {
    pub id: String,
    pub model: Option<String>,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_iterations: u32,
    pub memory_top_k: usize,
    pub thinking_budget: Option<u32>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            id: "main".into(),
            model: None,
            system_prompt: "You are hermitbot, a concise and capable assistant.".into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_iterations: 10,
            memory_top_k: 5,
            thinking_budget: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    pub data_dir: String,
    pub message_budget: usize,
    pub reap_after_days: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.hermitbot/sessions".into(),
            message_budget: 50,
            reap_after_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionSettings {
    pub threshold: usize,
    pub keep_recent: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            threshold: 30,
            keep_recent: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardSettings {
    pub max_tokens: usize,
    pub reserve_tokens: usize,
    pub safety_margin: f64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            reserve_tokens: 1_000,
            safety_margin: 0.15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronSettings {
    pub data_dir: String,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.hermitbot/cron".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScannerSettings {
    pub enabled: bool,
    /// Block matching messages instead of redacting them.
    pub block: bool,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            block: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OnboardingSettings {
    pub welcome: HashMap<String, String>,
    pub milestone_hint: String,
}
