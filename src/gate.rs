//! Access gate: the authorization decision this server consumes.
//!
//! Authenticating a caller is somebody else's job (typically a fronting
//! proxy). The server only carries the resulting [`Principal`] and asks an
//! [`AccessGate`] whether it may perform an operation on a repository.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;

use crate::{Error, Operation, RepoContext, Result};

/// The caller on whose behalf a request is made.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    Anonymous,
    User(String),
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Self {
        Principal::User(name.into())
    }

    /// Username carried by an `Authorization: Basic ...` header value.
    ///
    /// The password is not checked here.
    pub fn from_basic_auth(header: &str) -> Option<Self> {
        let encoded = header.strip_prefix("Basic ")?.trim();
        let decoded = STANDARD.decode(encoded).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let username = credentials.split_once(':').map_or(credentials.as_str(), |(u, _)| u);
        if username.is_empty() {
            return None;
        }
        Some(Principal::user(username))
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => f.write_str("anonymous"),
            Principal::User(name) => f.write_str(name),
        }
    }
}

/// Authorization decision per repository, operation and principal.
pub trait AccessGate: Send + Sync {
    fn authorize(&self, repo: &RepoContext, operation: Operation, principal: &Principal) -> bool;
}

impl<F> AccessGate for F
where
    F: Fn(&RepoContext, Operation, &Principal) -> bool + Send + Sync,
{
    fn authorize(&self, repo: &RepoContext, operation: Operation, principal: &Principal) -> bool {
        self(repo, operation, principal)
    }
}

/// Consult a gate, turning a refusal into [`Error::AccessDenied`].
pub fn check(
    gate: &dyn AccessGate,
    repo: &RepoContext,
    operation: Operation,
    principal: &Principal,
) -> Result<()> {
    if gate.authorize(repo, operation, principal) {
        Ok(())
    } else {
        tracing::warn!(repo = repo.name(), %operation, %principal, "access denied");
        Err(Error::AccessDenied {
            repo: repo.name().to_string(),
            operation: operation.to_string(),
        })
    }
}

/// Lets everybody do everything.
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn authorize(&self, _repo: &RepoContext, _operation: Operation, _principal: &Principal) -> bool {
        true
    }
}

/// Authenticated principals may do anything; anonymous callers only what
/// the policy grants.
#[derive(Debug, Clone, Copy)]
pub struct AnonymousPolicy {
    pub allow_download: bool,
    pub allow_upload: bool,
}

impl AccessGate for AnonymousPolicy {
    fn authorize(&self, _repo: &RepoContext, operation: Operation, principal: &Principal) -> bool {
        if !principal.is_anonymous() {
            return true;
        }
        match operation {
            Operation::Download => self.allow_download,
            Operation::Upload => self.allow_upload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoContext {
        RepoContext::at("repo.git", "/srv/repo.git/lfs").unwrap()
    }

    #[test]
    fn test_basic_auth_username() {
        // "alice:secret"
        let principal = Principal::from_basic_auth("Basic YWxpY2U6c2VjcmV0").unwrap();
        assert_eq!(principal, Principal::user("alice"));

        assert!(Principal::from_basic_auth("Bearer token").is_none());
        assert!(Principal::from_basic_auth("Basic !!!").is_none());
        // ":nobody"
        assert!(Principal::from_basic_auth("Basic Om5vYm9keQ==").is_none());
    }

    #[test]
    fn test_anonymous_policy() {
        let policy = AnonymousPolicy {
            allow_download: true,
            allow_upload: false,
        };
        let anon = Principal::Anonymous;
        let alice = Principal::user("alice");

        assert!(policy.authorize(&repo(), Operation::Download, &anon));
        assert!(!policy.authorize(&repo(), Operation::Upload, &anon));
        assert!(policy.authorize(&repo(), Operation::Upload, &alice));
    }

    #[test]
    fn test_check_maps_denial() {
        let deny_uploads = |_: &RepoContext, op: Operation, _: &Principal| op == Operation::Download;
        assert!(check(&deny_uploads, &repo(), Operation::Download, &Principal::Anonymous).is_ok());
        let err = check(&deny_uploads, &repo(), Operation::Upload, &Principal::Anonymous).unwrap_err();
        assert!(matches!(err, Error::AccessDenied { .. }));
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authorize(&repo(), Operation::Upload, &Principal::Anonymous));
    }
}
