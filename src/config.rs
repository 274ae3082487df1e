//! Configuration types for the conversation orchestrator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Rate-paced speech emitter settings.
    pub emitter: EmitterConfig,
    /// Idle watchdog settings.
    pub idle: IdleConfig,
    /// Bot-sentiment sampling loop settings.
    pub sentiment: SentimentConfig,
    /// Goodbye-detection race settings.
    pub goodbye: GoodbyeConfig,
    /// Synthesizer request behaviour.
    pub synthesizer: SynthesizerConfig,
    /// Structured logging settings.
    pub logging: LoggingConfig,
}

/// Rate-paced speech emitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Granularity, in seconds, of one synthesized audio chunk.
    pub text_to_speech_chunk_size_seconds: f64,
    /// Scheduling slack subtracted from each paced sleep to keep the
    /// output device's backlog near empty without starving it.
    pub per_chunk_allowance_seconds: f64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            text_to_speech_chunk_size_seconds: 0.25,
            per_chunk_allowance_seconds: 0.01,
        }
    }
}

/// Idle watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Seconds of inactivity after which the conversation is terminated.
    pub allowed_idle_time_seconds: u64,
    /// How often the watchdog checks `last_action_timestamp`.
    pub tick_seconds: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            allowed_idle_time_seconds: 1800,
            tick_seconds: 15,
        }
    }
}

/// Bot-sentiment sampling loop configuration. Whether the loop runs at all
/// is an agent-level decision (`AgentConfig::track_bot_sentiment`); this
/// struct only carries the sampling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentConfig {
    /// How often the transcript is re-sampled for a sentiment change.
    pub tick_seconds: u64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self { tick_seconds: 1 }
    }
}

/// Goodbye-detection race configuration. Whether a detected goodbye ends
/// the conversation at all is an agent-level decision
/// (`AgentConfig::end_conversation_on_goodbye`); this struct only carries
/// the race's time budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoodbyeConfig {
    /// Budget for the goodbye-detection race, in milliseconds.
    pub race_budget_ms: u64,
}

impl Default for GoodbyeConfig {
    fn default() -> Self {
        Self { race_budget_ms: 100 }
    }
}

/// Synthesizer request behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    /// Per-request synthesizer timeout, in seconds.
    pub request_timeout_seconds: u64,
    /// Chunk size, in samples, requested from the synthesizer.
    pub chunk_size: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 15,
            chunk_size: 2048,
        }
    }
}

/// Structured logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, e.g. `"info"` or `"parley=debug"`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber with an `EnvFilter` built from
    /// [`Self::filter`]. Intended to be called once, by a host binary, near
    /// the start of `main`.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber has already been installed.
    pub fn init_tracing(&self) -> crate::error::Result<()> {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.filter)
            .map_err(|e| crate::error::ConversationError::Config(e.to_string()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::error::ConversationError::Config(e.to_string()))
    }
}

impl ConversationConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::ConversationError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ConversationError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/parley/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("parley").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("parley")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/parley-config/config.toml")
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        let config = ConversationConfig::default();
        assert!(config.emitter.text_to_speech_chunk_size_seconds > 0.0);
        assert!(config.idle.allowed_idle_time_seconds > 0);
        assert!(config.sentiment.tick_seconds > 0);
        assert!(config.goodbye.race_budget_ms > 0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut config = ConversationConfig::default();
        config.idle.allowed_idle_time_seconds = 900;
        config.goodbye.race_budget_ms = 250;

        config.save_to_file(&path).expect("save");
        assert!(path.exists());

        let loaded = ConversationConfig::from_file(&path).expect("load");
        assert_eq!(loaded.idle.allowed_idle_time_seconds, 900);
        assert_eq!(loaded.goodbye.race_budget_ms, 250);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result =
            ConversationConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        let result = ConversationConfig::from_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = ConversationConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("parley"));
    }

    #[test]
    fn default_logging_filter_is_a_valid_env_filter() {
        let config = LoggingConfig::default();
        assert!(tracing_subscriber::EnvFilter::try_new(&config.filter).is_ok());
    }

    #[test]
    fn config_serializes_to_toml() {
        let config = ConversationConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let round_tripped: ConversationConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(
            round_tripped.emitter.text_to_speech_chunk_size_seconds,
            config.emitter.text_to_speech_chunk_size_seconds
        );
    }
}
