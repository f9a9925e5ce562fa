//! Per-repository object index.
//!
//! Tracks which OIDs a repository has been asked about, their declared size
//! and whether an upload is pending or complete. The content store is the
//! source of record: [`ObjectIndex::resolve`] rechecks it on every access
//! and repairs entries that disagree (for example after a crash between the
//! store commit and the index update).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::{ContentStore, Error, Oid, RepoContext, Result};

/// Readiness of an object within one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Missing,
    PendingUpload,
    Complete,
}

/// An index record. Missing objects have no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub size: u64,
    pub state: ObjectState,
}

type Key = (String, Oid);

/// In-memory object index keyed by (repository, oid).
#[derive(Default)]
pub struct ObjectIndex {
    entries: RwLock<HashMap<Key, IndexEntry>>,
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(repo: &RepoContext, oid: &Oid) -> Key {
        (repo.name().to_string(), *oid)
    }

    /// The index's own view of an object, without consulting the store.
    pub fn lookup(&self, repo: &RepoContext, oid: &Oid) -> ObjectState {
        self.entry(repo, oid)
            .map_or(ObjectState::Missing, |entry| entry.state)
    }

    pub fn entry(&self, repo: &RepoContext, oid: &Oid) -> Option<IndexEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&Self::key(repo, oid)).copied()
    }

    /// Record the intent to receive an upload of `size` bytes.
    ///
    /// Re-marking a pending object with the same size is allowed, since a
    /// client may negotiate again after a failed transfer.
    pub fn mark_pending(&self, repo: &RepoContext, oid: &Oid, size: u64) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = Self::key(repo, oid);
        match entries.get(&key) {
            Some(entry) if entry.size != size => Err(Error::SizeMismatch {
                oid: *oid,
                recorded: entry.size,
                declared: size,
            }),
            Some(entry) if entry.state == ObjectState::Complete => Err(Error::AlreadyExists(*oid)),
            Some(_) => Ok(()),
            None => {
                entries.insert(
                    key,
                    IndexEntry {
                        size,
                        state: ObjectState::PendingUpload,
                    },
                );
                Ok(())
            }
        }
    }

    /// Record that the store now holds verified bytes for `oid`.
    ///
    /// Must only be called after the store commit. Idempotent for an
    /// object already complete with the same size.
    pub fn mark_complete(&self, repo: &RepoContext, oid: &Oid, size: u64) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = Self::key(repo, oid);
        if let Some(entry) = entries.get(&key) {
            if entry.size != size {
                return Err(Error::SizeMismatch {
                    oid: *oid,
                    recorded: entry.size,
                    declared: size,
                });
            }
        }
        entries.insert(
            key,
            IndexEntry {
                size,
                state: ObjectState::Complete,
            },
        );
        Ok(())
    }

    /// Reconciled view of an object: the index entry, corrected against
    /// what the store actually holds.
    pub fn resolve(
        &self,
        store: &ContentStore,
        repo: &RepoContext,
        oid: &Oid,
    ) -> Result<Option<IndexEntry>> {
        let stored = store.size(repo, oid)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = Self::key(repo, oid);

        match (entries.get(&key).copied(), stored) {
            (Some(entry), None) if entry.state == ObjectState::Complete => {
                tracing::warn!(repo = repo.name(), %oid, "index claimed a complete object the store lacks");
                entries.remove(&key);
                Ok(None)
            }
            (entry, None) => Ok(entry),
            (entry, Some(size)) => {
                let complete = IndexEntry {
                    size,
                    state: ObjectState::Complete,
                };
                if entry != Some(complete) {
                    tracing::debug!(repo = repo.name(), %oid, "repairing index entry from store");
                    entries.insert(key, complete);
                }
                Ok(Some(complete))
            }
        }
    }
}
