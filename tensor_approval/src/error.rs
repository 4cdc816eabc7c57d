// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for the approval broker and its collaborators.

use std::fmt;

use thiserror::Error;

/// Phase of an approval in which an upstream failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Parsing parameters and diffing against live state.
    Validate,
    /// Reading or writing the request record and its share list.
    Accumulate,
    /// Running the reconstruction ceremony.
    Reconstruct,
    /// Applying the approved change.
    Execute,
    /// Revoking the credential and purging request state.
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::Accumulate => "accumulate",
            Self::Reconstruct => "reconstruct",
            Self::Execute => "execute",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The credential lacks rights on the resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator rejected the input.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// A share was rejected by the reconstruction protocol.
    ///
    /// `position` is the zero-based submission index when the protocol can
    /// attribute the failure to a single share.
    #[error("invalid share: {reason}")]
    InvalidShare {
        position: Option<usize>,
        reason: String,
    },

    /// An envelope was already redeemed or has expired.
    #[error("envelope unavailable: {0}")]
    EnvelopeUnavailable(String),

    /// Transport or service failure.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Result type for collaborator calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One resource that could not be changed during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    pub resource: String,
    pub message: String,
}

/// Every per-resource failure from a best-effort execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFailures {
    pub failures: Vec<ResourceFailure>,
}

impl ExecutionFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: impl Into<String>, message: impl Into<String>) {
        self.failures.push(ResourceFailure {
            resource: resource.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Convert into `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ApprovalError::Execution(self))
        }
    }
}

impl fmt::Display for ExecutionFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.resource, failure.message)?;
        }
        Ok(())
    }
}

/// Approval broker error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApprovalError {
    /// Malformed or missing request parameters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Caller cannot read or change a resource the request touches.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Proposed state already matches live state.
    #[error("no change: {0}")]
    NoChange(String),

    /// Live state moved since the request was filed; progress was reset.
    #[error("stale request: {0}")]
    Stale(String),

    /// Another operation holds the request identifier.
    #[error("contention: {0}")]
    Contention(String),

    /// No request is stored under the identifier.
    #[error("request not found: {0}")]
    NotFound(String),

    /// Stored record does not hash to its identifier.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The ceremony failed; the outstanding generation was cancelled.
    #[error("reconstruction error: {0}")]
    Reconstruction(String),

    /// Privileged writes failed after the quorum was consumed.
    #[error("execution error: {0}")]
    Execution(ExecutionFailures),

    /// A collaborator failed outside the categories above.
    #[error("upstream error during {phase}: {message}")]
    Upstream { phase: Phase, message: String },

    /// The secret store could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

impl From<serde_json::Error> for ApprovalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl ApprovalError {
    /// Map a collaborator failure into the broker taxonomy.
    ///
    /// Messages that are relayed verbatim from the collaborator are reduced
    /// with [`redact_upstream`] first.
    pub fn from_backend(phase: Phase, err: BackendError, limit: usize) -> Self {
        match err {
            BackendError::PermissionDenied(msg) => {
                Self::PermissionDenied(redact_upstream(&msg, limit))
            }
            BackendError::InvalidShare { reason, .. } => {
                Self::Reconstruction(redact_upstream(&reason, limit))
            }
            BackendError::NotFound(msg) if phase == Phase::Validate => {
                Self::Validation(format!("not found: {}", redact_upstream(&msg, limit)))
            }
            other => Self::Upstream {
                phase,
                message: redact_upstream(&other.to_string(), limit),
            },
        }
    }

    /// True when the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Keep only the trailing segment of a colon-delimited upstream message and
/// cap its length.
///
/// Upstream services tend to prefix errors with URLs and internal paths; the
/// last segment carries the human-readable cause.
pub fn redact_upstream(message: &str, limit: usize) -> String {
    let tail = message.rsplit(':').next().unwrap_or(message).trim();
    let tail = if tail.is_empty() { message.trim() } else { tail };
    if tail.chars().count() <= limit {
        return tail.to_string();
    }
    let mut truncated: String = tail.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}
