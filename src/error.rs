//! Error types for the application monitoring webhook

use thiserror::Error;

/// Main error type for webhook operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A platform token outside the supported set reached the mutation catalog
    #[error("unsupported platform in {function}(): {platform}")]
    UnsupportedPlatform {
        /// Catalog function that rejected the platform
        function: &'static str,
        /// The offending platform value
        platform: String,
    },

    /// Pod template annotations name more than one instrumentation resource
    #[error("conflicting instrumentation selection in inject-* annotations: {}", .0.join(", "))]
    ConflictingConfigSelection(Vec<String>),

    /// The object under admission lacks the structure the mutation needs
    #[error("malformed object: {0}")]
    MalformedObject(String),

    /// The admission request itself is not one this webhook handles
    #[error("invalid admission request: {0}")]
    InvalidRequest(String),

    /// The cluster ARM resource id could not be parsed
    #[error("invalid ARM resource id: {0}")]
    InvalidArmId(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Certificate generation or parsing error
    #[error("certificate error: {0}")]
    Certificate(String),
}

impl Error {
    /// Create an unsupported platform error for the given catalog function
    pub fn unsupported_platform(function: &'static str, platform: impl ToString) -> Self {
        Self::UnsupportedPlatform {
            function,
            platform: platform.to_string(),
        }
    }

    /// Create a malformed object error with the given message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedObject(msg.into())
    }

    /// Create an invalid request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<crate::pki::PkiError> for Error {
    fn from(e: crate::pki::PkiError) -> Self {
        Self::Certificate(e.to_string())
    }
}
