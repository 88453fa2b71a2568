//! Connection manager configuration.
//!
//! Everything has a default, so a manager can run without any file. A TOML
//! file may override individual keys:
//!
//! ```toml
//! name = "example"
//! shutdown_grace_secs = 5
//! idle_timeout_secs = 60
//! manifest_dirs = ["/opt/share/telepathy/managers"]
//! debug = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tpcm_core::{BUS_BASE, LogConfig, LogFormat};

use crate::error::{ServerError, ServerResult};
use crate::registrar::{is_valid_bus_name, is_valid_manager_name};

/// Process-wide settings of a connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Manager name, the `<cm>` in bus names and the manifest file stem.
    pub name: String,

    /// Prefix for every bus name and object path.
    pub bus_base: String,

    /// Directories searched for the installed manifest, replacing the XDG
    /// data directories when set.
    pub manifest_dirs: Option<Vec<PathBuf>>,

    /// Time a connection gets to finish disconnecting at shutdown.
    pub shutdown_grace_secs: u64,

    /// Exit after this long with no connections. `None` keeps running.
    pub idle_timeout_secs: Option<u64>,

    /// Log at debug level with locations and span events.
    pub debug: bool,

    /// Emit JSON log lines.
    pub json_logs: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "example".to_string(),
            bus_base: BUS_BASE.to_string(),
            manifest_dirs: None,
            shutdown_grace_secs: 5,
            idle_timeout_secs: None,
            debug: false,
            json_logs: false,
        }
    }
}

impl ManagerConfig {
    /// Configuration for the manager called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_bus_base(mut self, base: impl Into<String>) -> Self {
        self.bus_base = base.into();
        self
    }

    pub fn with_manifest_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.manifest_dirs = Some(dirs);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_secs = grace.as_secs();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout_secs = timeout.map(|t| t.as_secs());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Loads and validates configuration from `path`.
    pub fn load_from(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ServerError::io(path, source))?;
        let config: Self = toml::from_str(&content).map_err(|source| ServerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise returns the defaults for `name`.
    pub fn load_or_default(name: &str, path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::new(name))
        }
    }

    /// Default configuration file location for the manager called `name`.
    pub fn default_path(name: &str) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("telepathy")
            .join(format!("{name}.toml"))
    }

    /// Checks that the names can be used on the bus.
    pub fn validate(&self) -> ServerResult<()> {
        if !is_valid_manager_name(&self.name) {
            return Err(ServerError::config(format!(
                "manager name {:?} must be a non-empty identifier of letters, digits and underscores",
                self.name
            )));
        }
        if !is_valid_bus_name(&self.bus_base) {
            return Err(ServerError::config(format!(
                "bus base {:?} is not a dotted name",
                self.bus_base
            )));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Where to look for this manager's installed manifest.
    pub fn manifest_search_dirs(&self) -> Vec<PathBuf> {
        self.manifest_dirs
            .clone()
            .unwrap_or_else(tpcm_protocol::search_dirs)
    }

    /// Subscriber settings derived from the logging keys.
    pub fn log_config(&self) -> LogConfig {
        let base = if self.debug {
            LogConfig::debug()
        } else {
            LogConfig::default()
        };
        let format = if self.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Compact
        };
        LogConfig {
            manager_target: Some(self.name.clone()),
            ..base.with_format(format)
        }
    }
}
