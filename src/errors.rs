//! Typed error taxonomy for the gravity driver.
//!
//! Every failure that crosses a subsystem boundary is one of these kinds.
//! Callers branch on the variant, never on message text; messages exist for
//! the operator. Conversions from external error types map into the
//! taxonomy so the kind survives propagation through the engine.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GravityError>;

/// Failure kinds shared by every subsystem.
#[derive(Debug, Error)]
pub enum GravityError {
    /// Requested operation, plan, phase, or record is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate create; idempotent paths treat this as success.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency lost: the stored state did not match the
    /// expected value.
    #[error("compare failed: {0}")]
    CompareFailed(String),

    /// User or input invariant violation.
    #[error("{0}")]
    BadParameter(String),

    /// The backend lacks a needed API.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Transient network or RPC failure.
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// Credentials invalid or expired; rotation required.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Environment precondition not met (not root, wrong security context).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Context deadline reached.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operator cancelled the operation.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Several non-completed operations matched; the operator must narrow
    /// with an explicit operation id.
    #[error("ambiguous operation, specify one of: {}", ids.join(", "))]
    AmbiguousOperation { ids: Vec<String> },
}

impl GravityError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, Self::CompareFailed(_))
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Self::BadParameter(_) | Self::AmbiguousOperation { .. })
    }

    pub fn is_connection_problem(&self) -> bool {
        matches!(self, Self::ConnectionProblem(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Process exit code for this failure, per the command surface contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AmbiguousOperation { .. } => 4,
            Self::BadParameter(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for GravityError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::AccessDenied(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::ConnectionProblem(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for GravityError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("no matching row".to_string()),
            other => Self::ConnectionProblem(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for GravityError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadParameter(format!("malformed record: {err}"))
    }
}

impl From<serde_yaml::Error> for GravityError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::BadParameter(format!("malformed record: {err}"))
    }
}

impl From<tonic::Status> for GravityError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(status.message().to_string()),
            tonic::Code::AlreadyExists => Self::AlreadyExists(status.message().to_string()),
            tonic::Code::InvalidArgument => Self::BadParameter(status.message().to_string()),
            tonic::Code::DeadlineExceeded => Self::Timeout(status.message().to_string()),
            tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
                Self::AccessDenied(status.message().to_string())
            }
            tonic::Code::Cancelled => Self::Aborted(status.message().to_string()),
            tonic::Code::Unimplemented => Self::NotImplemented(status.message().to_string()),
            _ => Self::ConnectionProblem(status.message().to_string()),
        }
    }
}

impl From<tonic::transport::Error> for GravityError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::ConnectionProblem(err.to_string())
    }
}

impl From<GravityError> for tonic::Status {
    fn from(err: GravityError) -> Self {
        match &err {
            GravityError::NotFound(m) => tonic::Status::not_found(m.clone()),
            GravityError::AlreadyExists(m) => tonic::Status::already_exists(m.clone()),
            GravityError::BadParameter(m) => tonic::Status::invalid_argument(m.clone()),
            GravityError::Timeout(m) => tonic::Status::deadline_exceeded(m.clone()),
            GravityError::AccessDenied(m) => tonic::Status::unauthenticated(m.clone()),
            GravityError::Aborted(m) => tonic::Status::cancelled(m.clone()),
            GravityError::NotImplemented(m) => tonic::Status::unimplemented(m.clone()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
