//! Configuration loading for patchbay.
//!
//! Everything here is fixed for the lifetime of a process: the engine's
//! sample rate and block size, poller cadence, log level and the sandbox
//! prefix handed to the plugin host.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/patchbay/config.toml` (system)
//! 2. `~/.config/patchbay/config.toml` (user)
//! 3. `./patchbay.toml` (local override, or a path given on the command line)
//! 4. Environment variables (`PATCHBAY_*`)
//!
//! # Example Config
//!
//! ```toml
//! [engine]
//! sample_rate = 48000
//! buffer_size = 256
//!
//! [polling]
//! transport_interval_ms = 120
//! diagnostics_interval_ms = 1500
//!
//! [telemetry]
//! log_level = "info"
//!
//! [plugins]
//! sandbox_prefix = "patchbay"
//! ```

pub mod loader;

pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Render engine geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sample rate the engine renders at; clip buffers are resampled to it.
    /// Default: 48000
    #[serde(default = "EngineConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Engine block size in frames. Scheduled frames snap up to a multiple of it.
    /// Default: 256
    #[serde(default = "EngineConfig::default_buffer_size")]
    pub buffer_size: u32,
}

impl EngineConfig {
    fn default_sample_rate() -> u32 {
        48_000
    }

    fn default_buffer_size() -> u32 {
        256
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: Self::default_sample_rate(),
            buffer_size: Self::default_buffer_size(),
        }
    }
}

/// Poll cadence for live engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Default: 120
    #[serde(default = "PollingConfig::default_transport_interval_ms")]
    pub transport_interval_ms: u64,

    /// Default: 1500
    #[serde(default = "PollingConfig::default_diagnostics_interval_ms")]
    pub diagnostics_interval_ms: u64,
}

impl PollingConfig {
    fn default_transport_interval_ms() -> u64 {
        120
    }

    fn default_diagnostics_interval_ms() -> u64 {
        1500
    }

    pub fn transport_interval(&self) -> Duration {
        Duration::from_millis(self.transport_interval_ms)
    }

    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_millis(self.diagnostics_interval_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            transport_interval_ms: Self::default_transport_interval_ms(),
            diagnostics_interval_ms: Self::default_diagnostics_interval_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or full `EnvFilter` directive.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Plugin host settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Prefix of the sandbox identifier passed to the host on load.
    /// Default: patchbay
    #[serde(default = "PluginsConfig::default_sandbox_prefix")]
    pub sandbox_prefix: String,
}

impl PluginsConfig {
    fn default_sandbox_prefix() -> String {
        "patchbay".to_string()
    }

    /// Sandbox identifier for one session-level plugin instance.
    pub fn sandbox_identifier(&self, instance_id: &str) -> String {
        format!("{}.{}", self.sandbox_prefix, instance_id)
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            sandbox_prefix: Self::default_sandbox_prefix(),
        }
    }
}

/// Complete patchbay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PatchConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl PatchConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local
    /// `./patchbay.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = PatchConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::layer_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources, |key| std::env::var(key).ok());
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.sample_rate == 0 {
            return Err(ConfigError::Invalid {
                key: "engine.sample_rate".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.engine.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                key: "engine.buffer_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.polling.transport_interval_ms == 0 || self.polling.diagnostics_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "polling".to_string(),
                message: "poll intervals must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# patchbay configuration\n\n");

        output.push_str("[engine]\n");
        output.push_str(&format!("sample_rate = {}\n", self.engine.sample_rate));
        output.push_str(&format!("buffer_size = {}\n", self.engine.buffer_size));

        output.push_str("\n[polling]\n");
        output.push_str(&format!(
            "transport_interval_ms = {}\n",
            self.polling.transport_interval_ms
        ));
        output.push_str(&format!(
            "diagnostics_interval_ms = {}\n",
            self.polling.diagnostics_interval_ms
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output.push_str("\n[plugins]\n");
        output.push_str(&format!(
            "sandbox_prefix = \"{}\"\n",
            self.plugins.sandbox_prefix
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PatchConfig::default();
        assert_eq!(config.engine.sample_rate, 48_000);
        assert_eq!(config.engine.buffer_size, 256);
        assert_eq!(config.polling.transport_interval(), Duration::from_millis(120));
        assert_eq!(config.polling.diagnostics_interval(), Duration::from_millis(1500));
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = PatchConfig::default();
        config.engine.buffer_size = 512;
        config.telemetry.log_level = "debug".to_string();

        let parsed: PatchConfig = toml::from_str(&config.to_toml()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = PatchConfig::default();
        config.engine.buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_sandbox_identifier() {
        let plugins = PluginsConfig::default();
        assert_eq!(plugins.sandbox_identifier("reverb-1"), "patchbay.reverb-1");
    }
}
