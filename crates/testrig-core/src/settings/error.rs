//! Settings document errors.

use super::SettingsKind;

/// Errors raised while reading, editing or writing a settings document.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed settings document: {0}")]
    Malformed(String),

    #[error("settings document has no root element")]
    MissingRoot,

    #[error("expected a {expected} document, found root element <{found}>")]
    UnexpectedRoot {
        expected: SettingsKind,
        found: String,
    },

    #[error("document is already {active}, cannot switch to {requested}")]
    KindConflict {
        active: SettingsKind,
        requested: SettingsKind,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for settings operations.
pub type SettingsResult<T> = std::result::Result<T, SettingsError>;
