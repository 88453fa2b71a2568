//! Logging setup for connection managers.
//!
//! Every tpcm crate logs through `tracing`; a connection manager binary
//! installs a subscriber once at startup:
//!
//! ```ignore
//! use tpcm_core::tracing::{init_tracing, LogConfig};
//!
//! init_tracing(LogConfig::manager("gabble"))?;
//! ```
//!
//! `RUST_LOG` overrides the computed filter. Setting `TPCM_DEBUG` to a
//! comma-separated list of targets turns those targets up to `debug`.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Environment variable naming targets to log at debug level.
pub const DEBUG_ENV: &str = "TPCM_DEBUG";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LogInitError {
    /// A global subscriber is already installed.
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    /// The filter directive did not parse.
    #[error("failed to parse log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line human output.
    #[default]
    Compact,
    /// One JSON object per line, for bus-activated managers whose stderr
    /// ends up in the session journal.
    Json,
}

/// Subscriber configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level applied to the `tpcm` targets when neither `RUST_LOG` nor
    /// `TPCM_DEBUG` say otherwise.
    pub default_level: Level,
    /// Output rendering.
    pub format: LogFormat,
    /// Extra target that gets the default level, usually the manager's
    /// own crate name.
    pub manager_target: Option<String>,
    /// Include file and line numbers.
    pub include_location: bool,
    /// Emit span open/close events.
    pub include_span_events: bool,
    /// Explicit filter directive, overrides everything else.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            format: LogFormat::Compact,
            manager_target: None,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Configuration for a bus-activated connection manager process.
    #[must_use]
    pub fn manager(target: impl Into<String>) -> Self {
        Self {
            format: LogFormat::Json,
            manager_target: Some(target.into()),
            include_location: true,
            ..Self::default()
        }
    }

    /// Verbose single-line output, for running a manager by hand.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Self::default()
        }
    }

    /// Set the default level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Use an explicit filter directive.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Builds the filter directive string, without consulting `RUST_LOG`.
    ///
    /// `debug_targets` is the raw value of [`DEBUG_ENV`], if set.
    pub fn directive(&self, debug_targets: Option<&str>) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let mut parts = vec![format!("tpcm={}", self.default_level)];
        if let Some(target) = &self.manager_target {
            parts.push(format!("{target}={}", self.default_level));
        }
        for target in debug_targets
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            let target = if target == "all" { "tpcm" } else { target };
            parts.push(format!("{target}=debug"));
        }
        parts.join(",")
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a subscriber is already installed or the directive is invalid.
pub fn init_tracing(config: LogConfig) -> Result<(), LogInitError> {
    let filter = match (&config.filter, EnvFilter::try_from_default_env()) {
        (None, Ok(from_env)) => from_env,
        _ => {
            let debug = std::env::var(DEBUG_ENV).ok();
            EnvFilter::try_new(config.directive(debug.as_deref()))?
        }
    };

    let span_events = if config.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(span_events);
    let layer = match config.format {
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    };

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(filter).with(layer))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_logs_json_for_its_target() {
        let config = LogConfig::manager("example_cm");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directive(None), "tpcm=INFO,example_cm=INFO");
    }

    #[test]
    fn debug_targets_are_appended() {
        let config = LogConfig::default().with_level(Level::WARN);
        assert_eq!(
            config.directive(Some("tpcm_server::connection, all,")),
            "tpcm=WARN,tpcm_server::connection=debug,tpcm=debug"
        );
    }

    #[test]
    fn explicit_filter_wins() {
        let config = LogConfig::debug().with_filter("tpcm_protocol=trace");
        assert_eq!(config.directive(Some("all")), "tpcm_protocol=trace");
        assert_eq!(config.default_level, Level::DEBUG);
    }
}
