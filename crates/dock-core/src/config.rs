use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dock_backend::client::{ClientOptions, DEFAULT_ASK_PATH, DEFAULT_STREAM_PATH};
use thiserror::Error;

use crate::conversation::Notices;
use crate::dock::DockOptions;
use crate::pacer::{PacerConfig, MIN_CHARS_PER_SECOND};

/// Overrides `agent.base_url`.
pub const BASE_URL_ENV: &str = "AGENT_API_BASE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub pacer: PacerSection,
    pub notices: Notices,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub base_url: String,
    pub stream_path: String,
    pub ask_path: String,
    /// Extra instructions sent with every question.
    pub system_prompt: Option<String>,
    pub connect_timeout_secs: u64,
    /// Ceiling for the single-shot fallback request.
    pub request_timeout_secs: u64,
    /// Longest silence tolerated from the stream.
    pub idle_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            ask_path: DEFAULT_ASK_PATH.to_string(),
            system_prompt: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
            idle_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PacerSection {
    pub chars_per_second: f64,
    pub max_chars_per_tick: usize,
    pub tick_ms: u64,
    pub queue_capacity: usize,
}

impl Default for PacerSection {
    fn default() -> Self {
        let defaults = PacerConfig::default();
        Self {
            chars_per_second: defaults.chars_per_second,
            max_chars_per_tick: defaults.max_chars_per_tick,
            tick_ms: defaults.tick.as_millis() as u64,
            queue_capacity: defaults.queue_capacity,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directives. `RUST_LOG` wins.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the user config, falling back to defaults on any error.
    pub fn load_or_default() -> Self {
        Self::load(&config_path()).unwrap_or_else(|e| {
            eprintln!("warning: {e}");
            Config::default()
        })
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base_url) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.agent.base_url = base_url.trim().to_string();
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.agent.base_url.clone(),
            stream_path: self.agent.stream_path.clone(),
            ask_path: self.agent.ask_path.clone(),
            connect_timeout: Duration::from_secs(self.agent.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.agent.request_timeout_secs),
        }
    }

    pub fn pacer_config(&self) -> PacerConfig {
        PacerConfig {
            chars_per_second: self.pacer.chars_per_second.max(MIN_CHARS_PER_SECOND),
            max_chars_per_tick: self.pacer.max_chars_per_tick.max(1),
            tick: Duration::from_millis(self.pacer.tick_ms.max(1)),
            queue_capacity: self.pacer.queue_capacity,
        }
    }

    pub fn dock_options(&self) -> DockOptions {
        DockOptions {
            idle_timeout: Duration::from_secs(self.agent.idle_timeout_secs.max(1)),
        }
    }

    /// System prompt, if one is configured and not blank.
    pub fn system_prompt(&self) -> Option<String> {
        self.agent
            .system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }
}

pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("agentdock").join("config.toml")
}
