//! Error types for the cellmesh controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! The controller loop uses [`Error::is_retryable`] to decide between a
//! rate-limited requeue and dropping the key until the next change.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cellmesh operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Create or update raced with another writer
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// Child object is controlled by a different owner
    #[error("{kind} {name} is already controlled by {owner}")]
    OwnershipConflict {
        /// Kind of the child object
        kind: String,
        /// Name of the child object
        name: String,
        /// `Kind/name` of the current controlling owner
        owner: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// `namespace/name` of the invalid resource
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.components[0].name")
        field: Option<String>,
    },

    /// Configuration or secret material that cannot be used as given
    #[error("configuration error [{context}]: {message}")]
    Config {
        /// Description of what failed
        message: String,
        /// Where the bad input came from (e.g., "decrypt", "mesh-config")
        context: String,
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
        /// Context where the error occurred (e.g., "reconciler", "informer")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for a child write
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership conflict error
    pub fn ownership_conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::OwnershipConflict {
            kind: kind.into(),
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// Create a validation error for a resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
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

    /// Create a configuration error
    pub fn config(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
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
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Ownership, validation, configuration and serialization errors need a
    /// change to the input resource; retrying the same input cannot succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || matches!(ae.code, 408 | 409 | 429)
                }
                _ => true,
            },
            Error::Conflict { .. } => true,
            Error::OwnershipConflict { .. } => false,
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True if the API server answered 409 (already exists or stale version)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Config { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        }))
    }

    /// Story: the controller loop only retries what can heal on its own
    #[test]
    fn story_retryability_follows_error_taxonomy() {
        // Transient API failures retry with backoff
        assert!(api_error(500, "InternalError").is_retryable());
        assert!(api_error(409, "AlreadyExists").is_retryable());
        assert!(api_error(429, "TooManyRequests").is_retryable());
        assert!(Error::conflict("Deployment", "foo", "exists").is_retryable());
        assert!(Error::internal("watch closed").is_retryable());

        // Input problems wait for the user to fix the resource
        assert!(!api_error(403, "Forbidden").is_retryable());
        assert!(!api_error(422, "Invalid").is_retryable());
        assert!(!Error::ownership_conflict("Service", "foo", "Cell/other").is_retryable());
        assert!(!Error::validation_for("ns/foo", "empty component name").is_retryable());
        assert!(!Error::config("decrypt", "bad envelope").is_retryable());
        assert!(!Error::serialization_for_kind("ConfigMap", "bad json").is_retryable());
    }

    #[test]
    fn test_not_found_and_conflict_classification() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(409, "AlreadyExists").is_not_found());
        assert!(api_error(409, "AlreadyExists").is_conflict());
        assert!(Error::conflict("Secret", "s", "raced").is_conflict());
        assert!(!Error::internal("x").is_conflict());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = Error::ownership_conflict("Deployment", "foo--api-deployment", "Cell/bar");
        assert!(err.to_string().contains("foo--api-deployment"));
        assert!(err.to_string().contains("Cell/bar"));

        let err = Error::validation_for_field("default/foo", "spec.components[0].name", "empty");
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.components[0].name"));
            }
            _ => panic!("Expected Validation variant"),
        }

        let err = Error::config("decrypt", "unknown envelope");
        assert_eq!(err.context(), Some("decrypt"));
        assert!(err.to_string().contains("[decrypt]"));
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(UNKNOWN_CONTEXT));
        assert!(err.to_string().contains("[unknown]"));
    }
}
