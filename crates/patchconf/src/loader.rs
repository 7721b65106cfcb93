//! Config file discovery, layering, and environment variable overlay.

use crate::{ConfigError, PatchConfig};
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only returns
/// files that exist.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/patchbay/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("patchbay/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("patchbay.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and layer the keys it sets onto `config`.
pub fn layer_file(config: &mut PatchConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    layer_toml(config, &contents, path)
}

/// Layer a TOML document onto `config`. Keys absent from the document keep
/// whatever value earlier layers gave them.
pub(crate) fn layer_toml(
    config: &mut PatchConfig,
    contents: &str,
    path: &Path,
) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let integer = |section: &toml::Table, key: &str| -> Result<Option<i64>, ConfigError> {
        match section.get(key) {
            None => Ok(None),
            Some(value) => value.as_integer().map(Some).ok_or_else(|| ConfigError::Parse {
                path: path.to_path_buf(),
                message: format!("{} must be an integer", key),
            }),
        }
    };

    // Integer that must fit the target field; negative or oversized values
    // are rejected rather than wrapped.
    fn fit<T: TryFrom<i64>>(section: &str, key: &str, value: i64) -> Result<T, ConfigError> {
        T::try_from(value).map_err(|_| ConfigError::Invalid {
            key: format!("{}.{}", section, key),
            message: format!("{} is out of range", value),
        })
    }

    if let Some(engine) = table.get("engine").and_then(|v| v.as_table()) {
        if let Some(v) = integer(engine, "sample_rate")? {
            config.engine.sample_rate = fit("engine", "sample_rate", v)?;
        }
        if let Some(v) = integer(engine, "buffer_size")? {
            config.engine.buffer_size = fit("engine", "buffer_size", v)?;
        }
    }

    if let Some(polling) = table.get("polling").and_then(|v| v.as_table()) {
        if let Some(v) = integer(polling, "transport_interval_ms")? {
            config.polling.transport_interval_ms = fit("polling", "transport_interval_ms", v)?;
        }
        if let Some(v) = integer(polling, "diagnostics_interval_ms")? {
            config.polling.diagnostics_interval_ms = fit("polling", "diagnostics_interval_ms", v)?;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
    }

    if let Some(plugins) = table.get("plugins").and_then(|v| v.as_table()) {
        if let Some(v) = plugins.get("sandbox_prefix").and_then(|v| v.as_str()) {
            config.plugins.sandbox_prefix = v.to_string();
        }
    }

    Ok(())
}

/// Apply environment variable overrides to config.
///
/// `lookup` is `std::env::var` in production; tests pass a map.
pub fn apply_env_overrides(
    config: &mut PatchConfig,
    sources: &mut ConfigSources,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(rate) = lookup("PATCHBAY_SAMPLE_RATE").and_then(|v| v.parse().ok()) {
        config.engine.sample_rate = rate;
        sources.env_overrides.push("PATCHBAY_SAMPLE_RATE".to_string());
    }
    if let Some(size) = lookup("PATCHBAY_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
        config.engine.buffer_size = size;
        sources.env_overrides.push("PATCHBAY_BUFFER_SIZE".to_string());
    }
    if let Some(ms) = lookup("PATCHBAY_TRANSPORT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.polling.transport_interval_ms = ms;
        sources
            .env_overrides
            .push("PATCHBAY_TRANSPORT_INTERVAL_MS".to_string());
    }
    if let Some(ms) = lookup("PATCHBAY_DIAGNOSTICS_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.polling.diagnostics_interval_ms = ms;
        sources
            .env_overrides
            .push("PATCHBAY_DIAGNOSTICS_INTERVAL_MS".to_string());
    }
    if let Some(v) = lookup("PATCHBAY_SANDBOX_PREFIX") {
        config.plugins.sandbox_prefix = v;
        sources.env_overrides.push("PATCHBAY_SANDBOX_PREFIX".to_string());
    }
    if let Some(v) = lookup("PATCHBAY_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("PATCHBAY_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
