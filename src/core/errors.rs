//! VGL-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Top-level error type for the check scheduler.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("[VGL-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[VGL-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[VGL-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[VGL-2001] check setup failure for {object}: {details}")]
    CheckSetup { object: String, details: String },

    #[error("[VGL-2002] check of {object} is not viable now")]
    CheckViability {
        object: String,
        preferred_time: Option<i64>,
    },

    #[error("[VGL-2003] check of {object} cancelled by broker")]
    BrokerCancelled {
        object: String,
        preferred_time: Option<i64>,
    },

    #[error("[VGL-2101] execution of {command:?} failed: {details}")]
    Execution { command: String, details: String },

    #[error("[VGL-2102] execution of {command:?} interrupted")]
    Interrupted { command: String },

    #[error("[VGL-2201] result rejected by {object}: {details}")]
    Domain { object: String, details: String },

    #[error("[VGL-2202] unknown object: {details}")]
    UnknownObject { details: String },

    #[error("[VGL-2301] check result file {path} rejected: {details}")]
    ResultFile { path: PathBuf, details: String },

    #[error("[VGL-3101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[VGL-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[VGL-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[VGL-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl VigilError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "VGL-1001",
            Self::MissingConfig { .. } => "VGL-1002",
            Self::ConfigParse { .. } => "VGL-1003",
            Self::CheckSetup { .. } => "VGL-2001",
            Self::CheckViability { .. } => "VGL-2002",
            Self::BrokerCancelled { .. } => "VGL-2003",
            Self::Execution { .. } => "VGL-2101",
            Self::Interrupted { .. } => "VGL-2102",
            Self::Domain { .. } => "VGL-2201",
            Self::UnknownObject { .. } => "VGL-2202",
            Self::ResultFile { .. } => "VGL-2301",
            Self::Serialization { .. } => "VGL-3101",
            Self::Io { .. } => "VGL-3002",
            Self::ChannelClosed { .. } => "VGL-3003",
            Self::Runtime { .. } => "VGL-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::CheckViability { .. }
                | Self::BrokerCancelled { .. }
                | Self::Interrupted { .. }
                | Self::Runtime { .. }
        )
    }

    /// Retry time suggested by a viability failure or broker cancel.
    #[must_use]
    pub const fn preferred_time(&self) -> Option<i64> {
        match self {
            Self::CheckViability { preferred_time, .. }
            | Self::BrokerCancelled { preferred_time, .. } => *preferred_time,
            _ => None,
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for VigilError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
