//! Tracing setup for meshctl
//!
//! Console output follows the operator's chosen level while a debug log of
//! the whole run is kept on disk for post-mortem analysis of schedule
//! installs and dispatch timeouts.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::{MeshError, Result};

/// File name of the per-run debug log, overwritten on every start.
pub const RUN_LOG_FILE: &str = "meshctl-last-run.log";

/// Installs the global subscriber: console at `level`, file at TRACE.
///
/// `RUST_LOG` overrides the console filter. Without it only meshctl crates
/// log at `level`; dependencies are limited to warnings.
///
/// Returns the path of the run log.
///
/// # Errors
///
/// - `MeshError::Configuration` - If the log directory or file cannot be created, or a subscriber is already installed
pub fn init_tracing(level: CliLogLevel, logs_dir: Option<&Path>) -> Result<PathBuf> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    let configuration = |reason: String| MeshError::Configuration { reason };

    create_dir_all(logs_path)
        .map_err(|e| configuration(format!("cannot create {}: {e}", logs_path.display())))?;
    let log_file_path = logs_path.join(RUN_LOG_FILE);
    let log_file = File::create(&log_file_path)
        .map_err(|e| configuration(format!("cannot open {}: {e}", log_file_path.display())))?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.console_directives()));
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| configuration(e.to_string()))?;

    tracing::info!(
        console = %level,
        debug_file = %log_file_path.display(),
        "Tracing initialized"
    );
    Ok(log_file_path)
}

/// Operator-selectable log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    /// Includes every dispatched request and retransmission
    Trace,
}

impl CliLogLevel {
    /// Converts the operator log level to the tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use meshctl_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }

    fn console_directives(self) -> String {
        let level = self.as_tracing_level();
        format!("warn,meshctl_core={level},meshctl_sim={level}")
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true).map_err(|_| format!("Invalid log level: {s}"))
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => write!(f, "{self:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARN".parse::<CliLogLevel>(), Ok(CliLogLevel::Warn));
        assert_eq!("trace".parse::<CliLogLevel>(), Ok(CliLogLevel::Trace));
        assert!("loud".parse::<CliLogLevel>().is_err());
        assert_eq!(CliLogLevel::Debug.to_string(), "debug");
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
    }

    #[test]
    fn test_console_directives_scope_meshctl_crates() {
        assert_eq!(
            CliLogLevel::Debug.console_directives(),
            "warn,meshctl_core=DEBUG,meshctl_sim=DEBUG"
        );
    }

    #[test]
    fn test_init_tracing_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        // Fails with Configuration when another test already installed a subscriber
        match init_tracing(CliLogLevel::Warn, Some(dir.path())) {
            Ok(path) => assert_eq!(path, dir.path().join(RUN_LOG_FILE)),
            Err(e) => assert_eq!(e.kind(), crate::ErrorKind::ConfigLoad),
        }
        assert!(dir.path().join(RUN_LOG_FILE).exists());
    }
}
