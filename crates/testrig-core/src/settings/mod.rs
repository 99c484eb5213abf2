//! Runtime settings documents for the test engine.
//!
//! Submodules:
//! - `node`: owned XML tree that round-trips unknown content
//! - `document`: [`SettingsDocument`] and its feature mutations
//! - `collector`: data collector templates
//! - `params`: override-parameter string parsing
//! - `error`: [`SettingsError`]

pub mod collector;
pub mod document;
pub mod error;
pub mod node;
pub mod params;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use collector::{CollectorKind, DataCollector};
pub use document::{MutationOutcome, PersistedSettings, SettingsContent, SettingsDocument};
pub use error::{SettingsError, SettingsResult};
pub use node::{XmlContent, XmlNode};
pub use params::parse_override_parameters;

/// The two settings dialects the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsKind {
    RunSettings,
    TestSettings,
}

impl SettingsKind {
    /// Element name of the document root.
    pub fn root_name(&self) -> &'static str {
        match self {
            SettingsKind::RunSettings => "RunSettings",
            SettingsKind::TestSettings => "TestSettings",
        }
    }

    /// File extension used when persisting.
    pub fn extension(&self) -> &'static str {
        match self {
            SettingsKind::RunSettings => ".runsettings",
            SettingsKind::TestSettings => ".testsettings",
        }
    }

    /// `.testsettings` files are test settings; anything else is run settings.
    pub fn from_path(path: &Path) -> Self {
        let is_test_settings = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("testsettings"));
        if is_test_settings {
            SettingsKind::TestSettings
        } else {
            SettingsKind::RunSettings
        }
    }
}

impl std::fmt::Display for SettingsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.root_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_path() {
        assert_eq!(
            SettingsKind::from_path(Path::new("a/b.TestSettings")),
            SettingsKind::TestSettings
        );
        assert_eq!(
            SettingsKind::from_path(Path::new("a/b.runsettings")),
            SettingsKind::RunSettings
        );
        assert_eq!(
            SettingsKind::from_path(Path::new("settings.xml")),
            SettingsKind::RunSettings
        );
    }
}
