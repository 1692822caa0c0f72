//! Error types for the etcd certificate signer

use thiserror::Error;

/// Main error type for certificate signer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The etcd CA secret does not exist
    #[error("CA secret {namespace}/{name} not found")]
    CaMissing {
        /// Name of the CA secret
        name: String,
        /// Namespace of the CA secret
        namespace: String,
    },

    /// The CA secret exists but its material is incomplete or unparseable
    #[error("invalid CA: {0}")]
    InvalidCa(String),

    /// A target secret for a member certificate does not exist
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound {
        /// Name of the missing secret
        name: String,
        /// Namespace of the missing secret
        namespace: String,
    },

    /// A required annotation is absent on a target secret
    #[error("secret {secret} is missing annotation {annotation}")]
    MissingAnnotation {
        /// Name of the target secret
        secret: String,
        /// The annotation key that was expected
        annotation: &'static str,
    },

    /// The target secret name matches none of the known signer roles
    #[error("unable to recognise secret name {0}")]
    UnrecognizedTargetName(String),

    /// Key generation, signing or encoding failed
    #[error("signing error: {0}")]
    Signing(String),

    /// Invalid configuration or request
    #[error("validation error: {0}")]
    Validation(String),

    /// One or more certificate kinds failed during a single reconciliation
    #[error("certificate issuance failed: {}", join_errors(.0))]
    Issuance(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid CA error with the given message
    pub fn invalid_ca(msg: impl Into<String>) -> Self {
        Self::InvalidCa(msg.into())
    }

    /// Create a signing error with the given message
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Create a missing annotation error for a secret
    pub fn missing_annotation(secret: impl Into<String>, annotation: &'static str) -> Self {
        Self::MissingAnnotation {
            secret: secret.into(),
            annotation,
        }
    }

    /// Whether requeueing the member may resolve this error without a change
    /// to the watched objects.
    ///
    /// Missing annotations, unrecognised secret names and invalid
    /// configuration need someone to edit the objects; everything else
    /// (API failures, an absent or half-written CA, crypto failures) is
    /// worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(_)
            | Error::CaMissing { .. }
            | Error::InvalidCa(_)
            | Error::SecretNotFound { .. }
            | Error::Signing(_) => true,
            Error::MissingAnnotation { .. }
            | Error::UnrecognizedTargetName(_)
            | Error::Validation(_) => false,
            Error::Issuance(errors) => errors.iter().any(Error::is_retryable),
        }
    }

    /// Collapse a list of per-kind failures into a single error.
    ///
    /// Returns `None` when the list is empty and the lone error unchanged when
    /// only one kind failed.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Issuance(errors)),
        }
    }
}
