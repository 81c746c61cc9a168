//! Error types for the JuiceFS cache group operator
//!
//! Errors carry the name of the resource they relate to so that a failed
//! reconcile can be traced back to a CacheGroup, WarmUp or Sync without
//! re-reading the logs around it.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource spec cannot be acted upon until a user changes it
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.secretRef.name")
        field: Option<String>,
    },

    /// A referenced credential secret does not exist
    #[error("secret {secret} referenced by {resource} not found")]
    MissingSecret {
        /// Name of the resource holding the reference
        resource: String,
        /// Name of the missing secret
        secret: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "builder", "keygen")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a missing-secret error
    pub fn missing_secret(resource: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::MissingSecret {
            resource: resource.into(),
            secret: secret.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// A missing secret is retryable: the user may create it later and the
    /// secret watch will not fire for a secret that never existed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::MissingSecret { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if the error is caused by the resource spec rather than the platform
    pub fn is_spec_error(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::MissingSecret { .. })
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } | Error::MissingSecret { resource, .. } => {
                Some(resource)
            }
            _ => None,
        }
    }

    fn api_reason(&self) -> Option<(u16, &str)> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some((ae.code, ae.reason.as_str())),
            _ => None,
        }
    }

    /// The platform reported the object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self.api_reason(), Some((404, _)))
    }

    /// A create lost the race against another writer
    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_reason(), Some((409, "AlreadyExists")))
    }
}

/// Collapse AlreadyExists on create into success
pub fn ignore_already_exists(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Collapse NotFound on delete into success
pub fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from test"),
            reason: reason.to_string(),
            code,
        }),
    }
}
