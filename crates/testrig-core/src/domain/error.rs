//! Error taxonomy for a test run.
//!
//! Only [`RunError::Configuration`] and [`RunError::ProcessLaunch`] end a run
//! early. Everything else is absorbed by the orchestrator into a fallback
//! path and surfaced as a warning.

use std::path::PathBuf;

use crate::settings::SettingsError;

/// Errors produced while preparing or executing a test run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid run configuration: {0}")]
    Configuration(String),

    #[error("failed to launch {}: {source}", program.display())]
    ProcessLaunch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transient tooling error: {0}")]
    TransientTooling(String),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Whether this error must abort the run instead of degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Configuration(_) | RunError::ProcessLaunch { .. })
    }

    /// Invalid input; fails the run before anything is launched.
    pub fn configuration(msg: impl Into<String>) -> Self {
        RunError::Configuration(msg.into())
    }

    /// Tooling hiccup the orchestrator turns into a fallback.
    pub fn transient(msg: impl Into<String>) -> Self {
        RunError::TransientTooling(msg.into())
    }
}

/// Result type for run operations.
pub type Result<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_display() {
        let err = RunError::configuration("test sources cannot be empty");
        assert!(err.to_string().contains("invalid run configuration"));

        let err = RunError::transient("helper exited with code 3");
        assert!(err.to_string().contains("transient tooling error"));
        assert!(err.to_string().contains("code 3"));
    }

    #[test]
    fn test_launch_error_names_program() {
        let err = RunError::ProcessLaunch {
            program: PathBuf::from("/opt/engine/vstest.console"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let msg = err.to_string();
        assert!(msg.contains("vstest.console"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_only_configuration_and_launch_are_fatal() {
        assert!(RunError::configuration("x").is_fatal());
        assert!(RunError::ProcessLaunch {
            program: PathBuf::from("engine"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        }
        .is_fatal());
        assert!(!RunError::transient("x").is_fatal());
        assert!(!RunError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).is_fatal());
        assert!(!RunError::Settings(SettingsError::MissingRoot).is_fatal());
    }
}
