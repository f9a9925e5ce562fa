//! Batch negotiation.
//!
//! Given a repository, an operation and a list of (oid, size) pairs, decide
//! per object whether it is already satisfied, needs a transfer action, or
//! is in error. Objects are decided independently: one bad entry never
//! blocks its siblings, and results come back in request order.

use std::sync::Arc;

use crate::action::{ActionRegistry, TransferAction};
use crate::batch::{BatchRequest, BatchRequestObject, BatchResponse};
use crate::gate::{self, AccessGate, Principal};
use crate::index::{ObjectIndex, ObjectState};
use crate::repo::Projects;
use crate::{BatchObject, ContentStore, Error, Oid, Operation, RepoContext, Result};

/// Request size limits.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Largest object list accepted in one batch.
    pub max_batch_objects: usize,
    /// Largest single object accepted for upload.
    pub max_object_size: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_batch_objects: 1000,
            max_object_size: None,
        }
    }
}

/// The decision for one requested object.
#[derive(Debug)]
pub enum ObjectOutcome {
    /// Nothing to transfer.
    Present,
    /// The client should perform this transfer.
    Action(TransferAction),
    /// This object failed; siblings are unaffected.
    Error(Error),
}

/// A requested object together with its decision.
#[derive(Debug)]
pub struct NegotiatedObject {
    pub oid: String,
    pub size: i64,
    pub outcome: ObjectOutcome,
}

/// Implements the batch protocol decision.
pub struct Negotiator {
    projects: Projects,
    store: ContentStore,
    index: Arc<ObjectIndex>,
    actions: Arc<ActionRegistry>,
    gate: Arc<dyn AccessGate>,
    limits: Limits,
}

impl Negotiator {
    pub fn new(
        projects: Projects,
        store: ContentStore,
        index: Arc<ObjectIndex>,
        actions: Arc<ActionRegistry>,
        gate: Arc<dyn AccessGate>,
        limits: Limits,
    ) -> Self {
        Negotiator {
            projects,
            store,
            index,
            actions,
            gate,
            limits,
        }
    }

    /// Answer a Batch API request.
    ///
    /// Whole-request failures: unknown repository (`RepoNotFound`), unknown
    /// operation, no basic transfer support or too many objects
    /// (`BadRequest`), gate refusal (`AccessDenied`).
    pub fn batch(
        &self,
        repo_name: &str,
        request: &BatchRequest,
        principal: &Principal,
    ) -> Result<BatchResponse> {
        let repo = self.projects.open(repo_name)?;
        let operation = Operation::parse(&request.operation)?;
        if !request.accepts_basic() {
            return Err(Error::BadRequest(
                "client does not support the basic transfer adapter".into(),
            ));
        }

        let objects = self.negotiate(&repo, operation, &request.objects, principal)?;
        Ok(BatchResponse::new(
            objects.into_iter().map(BatchObject::from).collect(),
        ))
    }

    /// Decide every requested object, preserving order.
    pub fn negotiate(
        &self,
        repo: &RepoContext,
        operation: Operation,
        objects: &[BatchRequestObject],
        principal: &Principal,
    ) -> Result<Vec<NegotiatedObject>> {
        gate::check(self.gate.as_ref(), repo, operation, principal)?;
        if objects.len() > self.limits.max_batch_objects {
            return Err(Error::BadRequest(format!(
                "batch of {} objects exceeds the limit of {}",
                objects.len(),
                self.limits.max_batch_objects
            )));
        }

        let negotiated: Vec<_> = objects
            .iter()
            .map(|requested| NegotiatedObject {
                oid: requested.oid.clone(),
                size: requested.size,
                outcome: self.decide(repo, operation, requested, principal),
            })
            .collect();

        tracing::info!(
            repo = repo.name(),
            %operation,
            %principal,
            objects = negotiated.len(),
            transfers = negotiated.iter().filter(|o| matches!(o.outcome, ObjectOutcome::Action(_))).count(),
            errors = negotiated.iter().filter(|o| matches!(o.outcome, ObjectOutcome::Error(_))).count(),
            "batch negotiated"
        );
        Ok(negotiated)
    }

    fn decide(
        &self,
        repo: &RepoContext,
        operation: Operation,
        requested: &BatchRequestObject,
        principal: &Principal,
    ) -> ObjectOutcome {
        let outcome = self
            .try_decide(repo, operation, requested, principal)
            .unwrap_or_else(ObjectOutcome::Error);
        tracing::debug!(repo = repo.name(), oid = %requested.oid, ?outcome, "object decided");
        outcome
    }

    fn try_decide(
        &self,
        repo: &RepoContext,
        operation: Operation,
        requested: &BatchRequestObject,
        principal: &Principal,
    ) -> Result<ObjectOutcome> {
        if let Some(defect) = requested.defect() {
            return Err(Error::BadRequest(format!("malformed object entry: {}", defect)));
        }
        let oid = Oid::from_hex(&requested.oid)?;
        let size = u64::try_from(requested.size)
            .map_err(|_| Error::BadRequest(format!("invalid size: {}", requested.size)))?;

        let entry = self.index.resolve(&self.store, repo, &oid)?;
        let complete = entry.filter(|e| e.state == ObjectState::Complete);

        match operation {
            Operation::Download => {
                let stored = complete.ok_or(Error::ObjectNotFound(oid))?;
                let action = self
                    .actions
                    .issue(repo, oid, stored.size, Operation::Download, principal)?;
                Ok(ObjectOutcome::Action(action))
            }
            Operation::Upload => {
                if let Some(stored) = complete {
                    if stored.size == size {
                        return Ok(ObjectOutcome::Present);
                    }
                    return Err(Error::SizeMismatch {
                        oid,
                        recorded: stored.size,
                        declared: size,
                    });
                }
                if let Some(max) = self.limits.max_object_size {
                    if size > max {
                        return Err(Error::BadRequest(format!(
                            "object of {} bytes exceeds the limit of {}",
                            size, max
                        )));
                    }
                }
                self.index.mark_pending(repo, &oid, size)?;
                let action = self
                    .actions
                    .issue(repo, oid, size, Operation::Upload, principal)?;
                Ok(ObjectOutcome::Action(action))
            }
        }
    }

    /// Legacy object API: request an upload for a single object.
    ///
    /// Returns `None` when the object is already present.
    pub fn request_upload(
        &self,
        repo_name: &str,
        requested: &BatchRequestObject,
        principal: &Principal,
    ) -> Result<Option<TransferAction>> {
        let repo = self.projects.open(repo_name)?;
        let mut negotiated =
            self.negotiate(&repo, Operation::Upload, std::slice::from_ref(requested), principal)?;
        match negotiated.pop().map(|n| n.outcome) {
            Some(ObjectOutcome::Action(action)) => Ok(Some(action)),
            Some(ObjectOutcome::Error(err)) => Err(err),
            Some(ObjectOutcome::Present) | None => Ok(None),
        }
    }

    /// Legacy object API: describe a stored object with a download action.
    pub fn describe(
        &self,
        repo_name: &str,
        oid: &str,
        principal: &Principal,
    ) -> Result<(u64, TransferAction)> {
        let repo = self.projects.open(repo_name)?;
        gate::check(self.gate.as_ref(), &repo, Operation::Download, principal)?;
        let oid = Oid::from_hex(oid)?;
        let stored = self
            .index
            .resolve(&self.store, &repo, &oid)?
            .filter(|e| e.state == ObjectState::Complete)
            .ok_or(Error::ObjectNotFound(oid))?;
        let action = self
            .actions
            .issue(&repo, oid, stored.size, Operation::Download, principal)?;
        Ok((stored.size, action))
    }
}
