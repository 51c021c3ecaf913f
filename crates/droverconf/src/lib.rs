//! Configuration loading for Drover.
//!
//! Configuration splits into two sections:
//!
//! - **Net** (`[net]`): bind interface, transport, and per-channel ports.
//!   Port `0` means "pick a free port at startup".
//! - **Controller** (`[controller]`): scheduling scheme, heartbeat tuning,
//!   storage backend, signing key, worker isolation.
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/drover/config.toml` (system)
//! 2. `~/.config/drover/config.toml` (user)
//! 3. `./drover.toml` (local override, or the `--config` path)
//! 4. Environment variables (`DROVER_*`)

pub mod loader;

pub use loader::{discover_config_files, discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Task assignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Leastload,
    Weighted,
    Lru,
    Twobin,
    Plainrandom,
    /// Dependency-blind router↔dealer relay.
    Pure,
    /// No task channel at all.
    None,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leastload => "leastload",
            Self::Weighted => "weighted",
            Self::Lru => "lru",
            Self::Twobin => "twobin",
            Self::Plainrandom => "plainrandom",
            Self::Pure => "pure",
            Self::None => "none",
        }
    }
}

impl std::str::FromStr for Scheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leastload" => Ok(Self::Leastload),
            "weighted" => Ok(Self::Weighted),
            "lru" => Ok(Self::Lru),
            "twobin" => Ok(Self::Twobin),
            "plainrandom" => Ok(Self::Plainrandom),
            "pure" => Ok(Self::Pure),
            "none" => Ok(Self::None),
            other => Err(ConfigError::Invalid {
                field: "scheme".into(),
                message: format!("unknown scheme {:?}", other),
            }),
        }
    }
}

/// Request record storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbBackendKind {
    #[default]
    Memory,
    Documents,
}

impl std::str::FromStr for DbBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "documents" | "document_store" => Ok(Self::Documents),
            other => Err(ConfigError::Invalid {
                field: "db_backend".into(),
                message: format!("unknown backend {:?}", other),
            }),
        }
    }
}

/// Bind interface and per-channel ports. Port 0 = random.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub bind_ip: String,
    pub transport: String,
    pub registration_port: u16,
    pub notification_port: u16,
    pub query_port: u16,
    pub monitor_port: u16,
    /// Beacon PUB, echo ROUTER.
    pub heartbeat_ports: [u16; 2],
    /// Client side, engine side.
    pub mux_ports: [u16; 2],
    pub task_ports: [u16; 2],
    pub control_ports: [u16; 2],
    pub iopub_ports: [u16; 2],
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_ip: "127.0.0.1".to_string(),
            transport: "tcp".to_string(),
            registration_port: 0,
            notification_port: 0,
            query_port: 0,
            monitor_port: 0,
            heartbeat_ports: [0, 0],
            mux_ports: [0, 0],
            task_ports: [0, 0],
            control_ports: [0, 0],
            iopub_ports: [0, 0],
        }
    }
}

/// Controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub scheme: Scheme,
    /// Dedicated OS thread per worker instead of tasks on the shared runtime.
    pub use_threads: bool,
    pub heartbeat_period_ms: u64,
    /// Heartbeat periods before a registered-but-silent engine is purged.
    pub registration_timeout_periods: u32,
    /// Default task timeout in milliseconds; 0 = none.
    pub task_timeout_default_ms: u64,
    pub db_backend: DbBackendKind,
    /// Directory for the documents backend.
    pub db_path: PathBuf,
    /// Signing key file; empty disables signing.
    pub exec_key: PathBuf,
    pub log_level: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::default(),
            use_threads: false,
            heartbeat_period_ms: 100,
            registration_timeout_periods: 10,
            task_timeout_default_ms: 0,
            db_backend: DbBackendKind::default(),
            db_path: PathBuf::new(),
            exec_key: PathBuf::new(),
            log_level: "info".to_string(),
        }
    }
}

/// Complete Drover configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DroverConfig {
    pub net: NetConfig,
    pub controller: ControllerConfig,
}

impl DroverConfig {
    /// Load from the standard file locations plus environment overlay.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_override(None).map(|(config, _)| config)
    }

    /// Load with an optional CLI config path; also returns provenance.
    pub fn load_with_override(
        cli_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        loader::load(cli_path)
    }

    pub fn signing_enabled(&self) -> bool {
        !self.controller.exec_key.as_os_str().is_empty()
    }
}
