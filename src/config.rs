//! Configuration for autoload paths and reloading.
//!
//! [`ConfigLoader`] layers sources with increasing precedence: built-in
//! defaults, an optional file, `INTERLOCK_*` environment variables and finally
//! programmatic overrides. The file is a small `[section]` / `key = value`
//! format:
//!
//! ```text
//! [paths]
//! autoload = app/models, app/helpers, vendor/lib
//! autoload_once = vendor/lib
//! eager_load = app/models
//! extension = rb
//!
//! [reload]
//! enabled = true
//! ```
//!
//! Lists are comma-separated. Overrides use the environment key names.

use crate::tracing_compat::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Extension used when none is configured.
pub const DEFAULT_EXTENSION: &str = "rb";

const ENV_PREFIX: &str = "INTERLOCK_";

/// Paths and reload settings for a [`Dependencies`](crate::Dependencies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependenciesConfig {
    /// Roots searched, in order, for source files.
    pub autoload_paths: Vec<PathBuf>,
    /// Autoload roots whose code is never reloaded.
    pub autoload_once_paths: Vec<PathBuf>,
    /// Directories loaded up front.
    pub eager_load_paths: Vec<PathBuf>,
    /// Source extension, without the dot.
    pub extension: String,
    /// Whether the reloader may run.
    pub reloading_enabled: bool,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            autoload_paths: Vec::new(),
            autoload_once_paths: Vec::new(),
            eager_load_paths: Vec::new(),
            extension: DEFAULT_EXTENSION.to_string(),
            reloading_enabled: true,
        }
    }
}

impl DependenciesConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::OnceNotAutoload`] if an autoload-once path is not also an
    /// autoload path, [`ConfigError::InvalidExtension`] if the extension is
    /// empty or contains a path separator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = self
            .autoload_once_paths
            .iter()
            .find(|path| !self.autoload_paths.contains(path))
        {
            return Err(ConfigError::OnceNotAutoload(path.clone()));
        }
        if self.extension.is_empty() || self.extension.contains(['/', '\\']) {
            return Err(ConfigError::InvalidExtension(self.extension.clone()));
        }
        Ok(())
    }
}

/// Configuration loader with layered sources.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file_path: Option<PathBuf>,
    overrides: BTreeMap<String, String>,
}

impl ConfigLoader {
    /// Creates a loader that starts from the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a file path for config loading.
    #[must_use]
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Adds a programmatic override (highest precedence), keyed like the
    /// environment, e.g. `INTERLOCK_RELOAD_ENABLED`.
    #[must_use]
    pub fn override_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Loads configuration with precedence:
    /// 1. Defaults (lowest)
    /// 2. File config
    /// 3. Environment variables
    /// 4. Programmatic overrides (highest)
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, a key is
    /// unknown or malformed, or the result fails validation.
    pub fn load(&self) -> Result<DependenciesConfig, ConfigError> {
        let mut config = match &self.file_path {
            Some(path) => load_from_file(path)?,
            None => DependenciesConfig::default(),
        };

        apply_env_overrides(&mut config)?;
        apply_overrides(&mut config, &self.overrides)?;
        config.validate()?;
        debug!(
            autoload = config.autoload_paths.len(),
            eager_load = config.eager_load_paths.len(),
            reloading_enabled = config.reloading_enabled,
            "configuration loaded"
        );
        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading configuration.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Parse error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// An autoload-once path that is not an autoload path.
    #[error("autoload_once path is not an autoload path: {}", .0.display())]
    OnceNotAutoload(PathBuf),
    /// Empty extension, or one containing a path separator.
    #[error("invalid source extension: {0:?}")]
    InvalidExtension(String),
    /// Unknown override key.
    #[error("invalid override: {0}")]
    InvalidOverride(String),
}

fn load_from_file(path: &Path) -> Result<DependenciesConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents, DependenciesConfig::default())
}

fn apply_env_overrides(config: &mut DependenciesConfig) -> Result<(), ConfigError> {
    let overrides: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .collect();
    apply_overrides(config, &overrides)
}

fn apply_overrides(
    config: &mut DependenciesConfig,
    overrides: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    for (key, value) in overrides {
        apply_override(config, key, value)?;
    }
    Ok(())
}

fn apply_override(
    config: &mut DependenciesConfig,
    key: &str,
    value: &str,
) -> Result<(), ConfigError> {
    match key {
        "INTERLOCK_PATHS_AUTOLOAD" => config.autoload_paths = parse_list(value),
        "INTERLOCK_PATHS_AUTOLOAD_ONCE" => config.autoload_once_paths = parse_list(value),
        "INTERLOCK_PATHS_EAGER_LOAD" => config.eager_load_paths = parse_list(value),
        "INTERLOCK_PATHS_EXTENSION" => config.extension = value.trim().to_string(),
        "INTERLOCK_RELOAD_ENABLED" => config.reloading_enabled = parse_bool(value, key)?,
        _ => return Err(ConfigError::InvalidOverride(key.to_string())),
    }
    Ok(())
}

fn parse_config(
    contents: &str,
    base: DependenciesConfig,
) -> Result<DependenciesConfig, ConfigError> {
    let mut config = base;
    let mut section = String::new();

    for (line_idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            section = name.trim().to_lowercase();
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::Parse(format!("line {}: {}", line_idx + 1, line)))?;
        let key = key.trim();
        let value = value.trim().trim_matches('"');

        apply_section_kv(&mut config, &section, key, value)?;
    }

    Ok(config)
}

fn apply_section_kv(
    config: &mut DependenciesConfig,
    section: &str,
    key: &str,
    value: &str,
) -> Result<(), ConfigError> {
    match (section, key) {
        ("paths", "autoload") => config.autoload_paths = parse_list(value),
        ("paths", "autoload_once") => config.autoload_once_paths = parse_list(value),
        ("paths", "eager_load") => config.eager_load_paths = parse_list(value),
        ("paths", "extension") => config.extension = value.to_string(),
        ("reload", "enabled") => config.reloading_enabled = parse_bool(value, key)?,
        ("", _) => {
            return Err(ConfigError::Parse(format!(
                "missing section for key: {key}"
            )));
        }
        ("paths" | "reload", _) => {
            return Err(ConfigError::Parse(format!("unknown key: {section}.{key}")));
        }
        _ => return Err(ConfigError::Parse(format!("unknown section: {section}"))),
    }
    Ok(())
}

fn parse_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn parse_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Parse(format!(
            "invalid bool for {key}: {value}"
        ))),
    }
}
