//! Transfer actions handed out by batch negotiation.
//!
//! An action is a time-limited instruction telling a client where to send
//! or fetch one object's bytes. Each one carries a random token in its
//! required `Authorization` header; the token binds the action to the
//! repository, operation, object and principal it was issued for.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use url::Url;
use uuid::Uuid;

use crate::{Error, Oid, Operation, Principal, RepoContext, Result};

/// Authorization scheme of action tokens.
pub const ACTION_AUTH_SCHEME: &str = "RemoteAuth";

/// Header a client must echo back on the transfer request.
pub const ACTION_HEADER: &str = "Authorization";

/// How long an expired grant is remembered, so late use reports
/// [`Error::ActionExpired`] rather than an unknown token.
const EXPIRED_RETENTION_SECS: i64 = 3600;

/// Minimum spacing between sweeps of the grant table.
const SWEEP_INTERVAL_SECS: i64 = 60;

/// A scoped transfer instruction for one object, as returned to the client.
#[derive(Debug, Clone)]
pub struct TransferAction {
    pub operation: Operation,
    pub href: Url,
    pub header: BTreeMap<String, String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TransferAction {
    /// Seconds from issuance to expiry.
    pub fn expires_in(&self) -> i64 {
        (self.expires_at - self.issued_at).num_seconds()
    }
}

/// Server-side record of an issued action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGrant {
    pub repo: String,
    pub oid: Oid,
    pub size: u64,
    pub operation: Operation,
    pub principal: Principal,
    pub expires_at: DateTime<Utc>,
}

/// Issues action tokens and redeems them on transfer.
pub struct ActionRegistry {
    base_url: Url,
    ttl: Duration,
    grants: Mutex<Grants>,
}

struct Grants {
    by_token: HashMap<String, ActionGrant>,
    next_sweep: DateTime<Utc>,
}

impl Grants {
    /// Forget grants expired for longer than the retention window, at most
    /// once per sweep interval.
    fn sweep(&mut self, now: DateTime<Utc>) {
        if now < self.next_sweep {
            return;
        }
        let retention = Duration::seconds(EXPIRED_RETENTION_SECS);
        self.by_token.retain(|_, g| now - g.expires_at < retention);
        self.next_sweep = now + Duration::seconds(SWEEP_INTERVAL_SECS);
    }
}

impl ActionRegistry {
    /// Actions point below `base_url` and stay valid for `ttl`.
    pub fn new(base_url: Url, ttl: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("server URL cannot be a base: {}", base_url)));
        }
        Ok(ActionRegistry {
            base_url,
            ttl,
            grants: Mutex::new(Grants {
                by_token: HashMap::new(),
                next_sweep: Utc::now(),
            }),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// URL of the transfer endpoint for one object.
    pub fn object_url(&self, repo: &RepoContext, oid: &Oid) -> Result<Url> {
        let mut url = self.base_url.clone();
        let hex = oid.to_hex();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("server URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend([repo.name(), "lfs", "objects", hex.as_str()]);
        Ok(url)
    }

    /// Issue a fresh action.
    pub fn issue(
        &self,
        repo: &RepoContext,
        oid: Oid,
        size: u64,
        operation: Operation,
        principal: &Principal,
    ) -> Result<TransferAction> {
        self.issue_at(repo, oid, size, operation, principal, Utc::now())
    }

    /// [`issue`](Self::issue) against an explicit clock reading.
    pub fn issue_at(
        &self,
        repo: &RepoContext,
        oid: Oid,
        size: u64,
        operation: Operation,
        principal: &Principal,
        issued_at: DateTime<Utc>,
    ) -> Result<TransferAction> {
        let href = self.object_url(repo, &oid)?;
        let token = Uuid::new_v4().simple().to_string();
        let expires_at = issued_at + self.ttl;

        let grant = ActionGrant {
            repo: repo.name().to_string(),
            oid,
            size,
            operation,
            principal: principal.clone(),
            expires_at,
        };

        {
            let mut grants = self.grants.lock().unwrap_or_else(PoisonError::into_inner);
            grants.sweep(issued_at);
            grants.by_token.insert(token.clone(), grant);
        }

        let mut header = BTreeMap::new();
        header.insert(
            ACTION_HEADER.to_string(),
            format!("{} {}", ACTION_AUTH_SCHEME, token),
        );

        Ok(TransferAction {
            operation,
            href,
            header,
            issued_at,
            expires_at,
        })
    }

    /// Redeem the action presented with a transfer request.
    pub fn redeem(
        &self,
        header: Option<&str>,
        repo: &RepoContext,
        oid: &Oid,
        operation: Operation,
    ) -> Result<ActionGrant> {
        self.redeem_at(header, repo, oid, operation, Utc::now())
    }

    /// [`redeem`](Self::redeem) against an explicit clock reading.
    ///
    /// The token must exist, match the repository, object and operation of
    /// the request, and `now` must be strictly before its expiry.
    pub fn redeem_at(
        &self,
        header: Option<&str>,
        repo: &RepoContext,
        oid: &Oid,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<ActionGrant> {
        let token = header
            .and_then(parse_token)
            .ok_or_else(|| Error::Unauthorized("missing action token".into()))?;

        let grants = self.grants.lock().unwrap_or_else(PoisonError::into_inner);
        let grant = grants
            .by_token
            .get(token)
            .ok_or_else(|| Error::Unauthorized("unknown action token".into()))?;

        if grant.repo != repo.name() || grant.oid != *oid || grant.operation != operation {
            return Err(Error::Unauthorized(format!(
                "action token was not issued for {} of {} in {}",
                operation,
                oid,
                repo.name()
            )));
        }
        if now >= grant.expires_at {
            tracing::warn!(repo = repo.name(), %oid, %operation, "expired action presented");
            return Err(Error::ActionExpired(*oid));
        }
        Ok(grant.clone())
    }

    /// Number of grants currently tracked.
    pub fn len(&self) -> usize {
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_token
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract the token from a `RemoteAuth <token>` header value.
pub fn parse_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix(ACTION_AUTH_SCHEME)?.strip_prefix(' ')?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
