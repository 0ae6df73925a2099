//! Configuration file parser for ~/.config/gleaner/config.toml.
//!
//! The config file is optional — a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields`
//! off), though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file. Empty = `<config dir>/gleaner.db`.
    pub database_path: String,

    pub fetch: FetchConfig,
    pub summarize: SummarizeConfig,
    pub retention: RetentionConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Feed polling knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Maximum concurrent feed fetches.
    pub concurrency: usize,
    /// Attempts per feed per run before the feed enters backoff.
    pub max_attempts: u32,
    /// Base of the linear retry delay: attempt N waits N * base seconds.
    pub retry_base_delay_secs: u64,
    /// Per-attempt request timeout.
    pub request_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            retry_base_delay_secs: 1,
            request_timeout_secs: 30,
        }
    }
}

/// One inference endpoint entry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EndpointConfig {
    pub url: String,
    pub model: String,
    /// Relative share of the round-robin rotation. 0 is treated as 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Summarization worker pool and endpoint knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizeConfig {
    /// Number of worker units in the pool.
    pub workers: usize,
    /// Maximum queued tasks before submissions are rejected.
    pub queue_capacity: usize,
    /// Wall-clock deadline per task. The assigned worker is forcibly
    /// terminated and respawned when it expires.
    pub task_timeout_secs: u64,
    /// Timeout for one inference HTTP request. Kept below the task deadline
    /// so an endpoint timeout surfaces as a retryable call failure before
    /// the worker itself is declared stuck.
    pub request_timeout_secs: u64,
    /// Input cap in characters after markup stripping.
    pub max_input_chars: usize,
    /// Output cap in words.
    pub max_summary_words: usize,
    /// Endpoint health probe cadence.
    pub probe_interval_secs: u64,
    /// Configured inference endpoints.
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 32,
            task_timeout_secs: 60,
            request_timeout_secs: 55,
            max_input_chars: 8_000,
            max_summary_words: 200,
            probe_interval_secs: 300,
            endpoints: vec![EndpointConfig {
                url: "http://localhost:11434".to_string(),
                model: "llama3.2".to_string(),
                weight: 1,
            }],
        }
    }
}

/// Archive retention windows.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age in days past which read-or-failed articles are archived.
    pub active_days: u32,
    /// Age in days past which archived articles are permanently deleted.
    pub archive_days: u32,
    /// Maximum articles archived per sweep.
    pub sweep_batch: usize,
    /// Run the retention sweep every N orchestrator cycles.
    pub sweep_every_cycles: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            active_days: 30,
            archive_days: 180,
            sweep_batch: 200,
            sweep_every_cycles: 12,
        }
    }
}

/// Cycle cadence for the fetch → summarize → retention loop.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause between cycles. The next cycle starts this long after the
    /// previous one finishes, so cycles never overlap.
    pub cycle_interval_secs: u64,
    /// Maximum articles claimed for summarization per cycle.
    pub summarize_batch: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 900,
            summarize_batch: 32,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: String::new(),
            fetch: FetchConfig::default(),
            summarize: SummarizeConfig::default(),
            retention: RetentionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion from a
        // maliciously large or corrupted config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {} // Size is within limits, proceed
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse the TOML content first as a raw table to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "database_path",
                "fetch",
                "summarize",
                "retention",
                "orchestrator",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            endpoints = config.summarize.endpoints.len(),
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
