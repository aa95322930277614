//! Error types for the proxy-router crate.
//!
//! Resolution itself never fails: malformed settings are filtered during
//! normalization and bad request URLs resolve to a direct connection.
//! The variants here surface at the boundaries only (configuration files,
//! the settings store, and administrative edits).

use thiserror::Error;

/// Main error type for the proxy-router crate.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// The settings store could not be read or written.
    #[error("Settings storage error: {message}")]
    Storage { message: String },

    /// A profile submitted for saving is incomplete or out of range.
    #[error("Invalid proxy profile: {message}")]
    InvalidProfile { message: String },

    /// An edit referenced a profile id that does not exist.
    #[error("Proxy profile not found: {id}")]
    ProfileNotFound { id: String },

    /// Another profile already uses this name.
    #[error("A proxy profile named {name:?} already exists")]
    DuplicateProfileName { name: String },

    /// A host mapping was submitted with a blank host.
    #[error("Host cannot be empty")]
    EmptyHost,

    /// A host mapping for this host already exists.
    #[error("Host {host:?} is already mapped")]
    HostExists { host: String },

    /// A URL given to take a host from did not parse.
    #[error("Invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Export was requested while every setting still has its default.
    #[error("No settings to export")]
    NothingToExport,

    /// An imported document does not look like exported settings.
    #[error("Invalid settings import: {message}")]
    ImportFormat { message: String },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn invalid_profile(message: impl Into<String>) -> Self {
        Self::InvalidProfile {
            message: message.into(),
        }
    }

    pub fn import_format(message: impl Into<String>) -> Self {
        Self::ImportFormat {
            message: message.into(),
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
