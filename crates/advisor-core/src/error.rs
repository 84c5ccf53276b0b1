//! Unified Error Model
//!
//! Every backend failure is mapped at its call site onto one of these
//! variants. `ErrorKind` collapses them into the five classes the HTTP
//! layer turns into status codes.
use std::fmt;
use thiserror::Error;

/// Backend services the gateway talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Results aggregator (system of record for hits and overrides)
    Aggregator,
    /// Static rule content service
    ContentService,
    /// Role based access control service
    Rbac,
    /// Account management service
    Ams,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Aggregator => "Aggregator service",
            Backend::ContentService => "Content service",
            Backend::Rbac => "RBAC service",
            Backend::Ams => "AMS API",
        };
        f.write_str(name)
    }
}

impl Backend {
    /// Lower-case name used in upstream status messages
    pub fn short_name(&self) -> &'static str {
        match self {
            Backend::Aggregator => "aggregator",
            Backend::ContentService => "content service",
            Backend::Rbac => "rbac",
            Backend::Ams => "ams",
        }
    }
}

/// Classes of failure surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    NotFound,
    BadRequest,
    ServiceUnavailable,
    Internal,
}

#[derive(Error, Debug)]
pub enum AdvisorError {
    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("Item with ID {0} was not found in the storage")]
    NotFound(String),

    #[error("Rule was not found")]
    RuleNotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("Error during parsing param '{param}' with value '{value}'. Error: '{reason}'")]
    Parsing {
        param: String,
        value: String,
        reason: String,
    },

    #[error("{0} is unreachable")]
    ServiceUnavailable(Backend),

    #[error("Content directory is not ready: timed out waiting for rule content")]
    ContentDirectoryTimeout,

    #[error("{} responded with improper HTTP code: {status}", .backend.short_name())]
    ImproperStatus { backend: Backend, status: u16 },

    #[error("unexpected payload from {backend}: {reason}")]
    Decode { backend: Backend, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AdvisorError {
    /// Map the error onto the client-facing class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) | Self::Authorization(_) => ErrorKind::Authentication,
            Self::NotFound(_) | Self::RuleNotFound => ErrorKind::NotFound,
            Self::BadRequest(_) | Self::Parsing { .. } => ErrorKind::BadRequest,
            Self::ServiceUnavailable(_) | Self::ContentDirectoryTimeout => {
                ErrorKind::ServiceUnavailable
            }
            Self::ImproperStatus { .. } | Self::Decode { .. } | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Shorthand for a parameter parsing failure
    pub fn parsing(
        param: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Parsing {
            param: param.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn improper_status(backend: Backend, status: u16) -> Self {
        Self::ImproperStatus { backend, status }
    }

    pub fn decode(backend: Backend, reason: impl fmt::Display) -> Self {
        Self::Decode {
            backend,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AdvisorError>;
