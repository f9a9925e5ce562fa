//! Error types for git-lfs-server operations.

use thiserror::Error;

use crate::Oid;

/// Result type for git-lfs-server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or transferring LFS objects.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request or object entry
    #[error("bad request: {0}")]
    BadRequest(String),

    /// OID parsing error
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    /// Repository is not served here
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// No complete object stored under this OID
    #[error("object not found: {0}")]
    ObjectNotFound(Oid),

    /// An existing record disagrees with the declared size
    #[error("size mismatch for {oid}: recorded {recorded}, declared {declared}")]
    SizeMismatch {
        oid: Oid,
        recorded: u64,
        declared: u64,
    },

    /// Object is already complete
    #[error("object already exists: {0}")]
    AlreadyExists(Oid),

    /// Missing, unknown or mismatched action reference
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Action reference used past its expiration
    #[error("action expired for {0}")]
    ActionExpired(Oid),

    /// Access gate refused the principal
    #[error("access denied: {operation} on {repo}")]
    AccessDenied { repo: String, operation: String },

    /// Received bytes do not hash/measure to the declared object
    #[error("verification failed for {oid}: {reason}")]
    VerificationFailed { oid: Oid, reason: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Boundary taxonomy every [`Error`] folds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Unauthorized,
    VerificationFailed,
    ServerError,
}

impl Error {
    /// Classify this error for the transport boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) | Error::InvalidOid(_) | Error::Json(_) => ErrorKind::BadRequest,
            Error::RepoNotFound(_) | Error::ObjectNotFound(_) => ErrorKind::NotFound,
            Error::SizeMismatch { .. } | Error::AlreadyExists(_) => ErrorKind::Conflict,
            Error::Unauthorized(_) | Error::ActionExpired(_) | Error::AccessDenied { .. } => {
                ErrorKind::Unauthorized
            }
            Error::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Error::Config(_) | Error::Io(_) => ErrorKind::ServerError,
        }
    }

    /// HTTP status for a whole-request failure.
    ///
    /// Gate denials answer 403 so clients do not re-prompt for credentials
    /// they already supplied; a bad or stale action reference answers 401.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::AccessDenied { .. } => 403,
            _ => match self.kind() {
                ErrorKind::BadRequest => 400,
                ErrorKind::NotFound => 404,
                ErrorKind::Conflict => 409,
                ErrorKind::Unauthorized => 401,
                ErrorKind::VerificationFailed => 422,
                ErrorKind::ServerError => 500,
            },
        }
    }

    /// Code for an inline per-object error inside a batch response.
    ///
    /// Validation failures use 422 as the Batch API prescribes.
    pub fn object_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::BadRequest => 422,
            _ => self.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid() -> Oid {
        Oid::from_content(b"error")
    }

    #[test]
    fn test_kinds_map_to_distinct_statuses() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::RepoNotFound("r".into()).status_code(), 404);
        assert_eq!(Error::ObjectNotFound(oid()).status_code(), 404);
        assert_eq!(
            Error::SizeMismatch { oid: oid(), recorded: 1, declared: 2 }.status_code(),
            409
        );
        assert_eq!(Error::ActionExpired(oid()).status_code(), 401);
        assert_eq!(
            Error::AccessDenied { repo: "r".into(), operation: "upload".into() }.status_code(),
            403
        );
        assert_eq!(
            Error::VerificationFailed { oid: oid(), reason: "digest".into() }.status_code(),
            422
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(Error::Io(io).status_code(), 500);
    }

    #[test]
    fn test_object_codes() {
        assert_eq!(Error::InvalidOid("short".into()).object_code(), 422);
        assert_eq!(Error::ObjectNotFound(oid()).object_code(), 404);
        assert_eq!(
            Error::SizeMismatch { oid: oid(), recorded: 100, declared: 200 }.object_code(),
            409
        );
    }

    #[test]
    fn test_expired_is_unauthorized_kind() {
        assert_eq!(Error::ActionExpired(oid()).kind(), ErrorKind::Unauthorized);
        assert_eq!(
            Error::AccessDenied { repo: "r".into(), operation: "download".into() }.kind(),
            ErrorKind::Unauthorized
        );
    }
}
