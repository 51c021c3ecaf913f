//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, DroverConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files that
/// exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/drover/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("drover/config.toml");
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

    let local = PathBuf::from("drover.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<DroverConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge `overlay` into `base`: any section present in the overlay file wins
/// field by field.
fn merge_toml(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_toml(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Load all discovered files, merge, overlay environment variables.
pub fn load(cli_path: Option<&Path>) -> Result<(DroverConfig, ConfigSources), ConfigError> {
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();

    for path in discover_config_files_with_override(cli_path) {
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let table: toml::Table =
            contents
                .parse()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
        merge_toml(&mut merged, table);
        sources.files.push(path);
    }

    let mut config: DroverConfig =
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: PathBuf::from("<merged>"),
                message: e.to_string(),
            })?;

    apply_env(&mut config, &mut sources)?;
    Ok((config, sources))
}

/// Overlay recognized `DROVER_*` environment variables.
fn apply_env(
    config: &mut DroverConfig,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    if let Ok(v) = env::var("DROVER_BIND_IP") {
        config.net.bind_ip = v;
        sources.env_overrides.push("DROVER_BIND_IP".into());
    }
    if let Ok(v) = env::var("DROVER_SCHEME") {
        config.controller.scheme = v.parse()?;
        sources.env_overrides.push("DROVER_SCHEME".into());
    }
    if let Ok(v) = env::var("DROVER_HEARTBEAT_PERIOD_MS") {
        config.controller.heartbeat_period_ms =
            v.parse().map_err(|_| ConfigError::Invalid {
                field: "heartbeat_period_ms".into(),
                message: format!("not a number: {:?}", v),
            })?;
        sources
            .env_overrides
            .push("DROVER_HEARTBEAT_PERIOD_MS".into());
    }
    if let Ok(v) = env::var("DROVER_DB_BACKEND") {
        config.controller.db_backend = v.parse()?;
        sources.env_overrides.push("DROVER_DB_BACKEND".into());
    }
    if let Ok(v) = env::var("DROVER_EXEC_KEY") {
        config.controller.exec_key = PathBuf::from(v);
        sources.env_overrides.push("DROVER_EXEC_KEY".into());
    }
    if let Ok(v) = env::var("DROVER_LOG_LEVEL") {
        config.controller.log_level = v;
        sources.env_overrides.push("DROVER_LOG_LEVEL".into());
    }
    Ok(())
}
