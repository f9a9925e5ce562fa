//! Content-addressed object store.
//!
//! Objects live at `<repo>/lfs/objects/<oid[0:2]>/<oid[2:4]>/<oid>`. Bytes
//! are received into a uniquely named temp file under `<repo>/lfs/tmp`,
//! verified against the declared OID and size, and only then renamed into
//! place, so a reader never sees a partial object under its final name.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::NamedTempFile;

use crate::oid::OidHasher;
use crate::{Error, Oid, RepoContext, Result};

/// Result of committing an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This writer published the object.
    Stored,
    /// Identical content was already published; this writer's copy was discarded.
    AlreadyPresent,
}

/// Durable content-addressed store shared by all repositories.
///
/// Cheap to clone; clones share the commit lock table.
#[derive(Clone, Default)]
pub struct ContentStore {
    locks: Arc<CommitLocks>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a complete object exists. Never reads payload bytes.
    pub fn exists(&self, repo: &RepoContext, oid: &Oid) -> bool {
        repo.object_path(oid).is_file()
    }

    /// Size of a complete object, or `None` if absent.
    pub fn size(&self, repo: &RepoContext, oid: &Oid) -> Result<Option<u64>> {
        match fs::metadata(repo.object_path(oid)) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Open a complete object for streaming read.
    pub fn get(&self, repo: &RepoContext, oid: &Oid) -> Result<File> {
        match File::open(repo.object_path(oid)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::ObjectNotFound(*oid)),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Start receiving an object of `size` bytes that must hash to `oid`.
    pub fn stage(&self, repo: &RepoContext, oid: Oid, size: u64) -> Result<StagedObject> {
        let tmp_dir = repo.tmp_dir();
        fs::create_dir_all(&tmp_dir)?;
        let temp = NamedTempFile::new_in(&tmp_dir)?;

        Ok(StagedObject {
            temp,
            hasher: OidHasher::new(),
            oid,
            size,
            final_path: repo.object_path(&oid),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Store an object from a reader in one call.
    pub fn put<R: Read>(
        &self,
        repo: &RepoContext,
        oid: Oid,
        size: u64,
        mut reader: R,
    ) -> Result<PutOutcome> {
        let mut staged = self.stage(repo, oid, size)?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            staged.write_chunk(&buf[..n])?;
        }
        staged.commit()
    }

    /// Recompute the digest of a stored object and compare it to its name.
    pub fn verify(&self, repo: &RepoContext, oid: &Oid) -> Result<bool> {
        let mut file = self.get(repo, oid)?;
        let mut hasher = OidHasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish().0 == *oid)
    }
}

/// An object being received. Dropping it without committing discards the
/// temp file and leaves the store untouched.
pub struct StagedObject {
    temp: NamedTempFile,
    hasher: OidHasher,
    oid: Oid,
    size: u64,
    final_path: PathBuf,
    locks: Arc<CommitLocks>,
}

impl StagedObject {
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Declared size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes received so far.
    pub fn received(&self) -> u64 {
        self.hasher.len()
    }

    /// Append the next chunk. Fails as soon as the declared size is exceeded.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let received = self.hasher.len() + chunk.len() as u64;
        if received > self.size {
            return Err(Error::VerificationFailed {
                oid: self.oid,
                reason: format!("received more than the declared {} bytes", self.size),
            });
        }
        self.temp.write_all(chunk)?;
        self.hasher.update(chunk);
        Ok(())
    }

    /// Verify and atomically publish the object.
    ///
    /// Under the per-object commit lock the final path is rechecked: if a
    /// concurrent writer already published the same content, this copy is
    /// discarded and [`PutOutcome::AlreadyPresent`] is returned.
    pub fn commit(self) -> Result<PutOutcome> {
        let StagedObject {
            temp,
            hasher,
            oid,
            size,
            final_path,
            locks,
        } = self;

        let (computed, received) = hasher.finish();
        if received != size {
            return Err(Error::VerificationFailed {
                oid,
                reason: format!("expected {} bytes, received {}", size, received),
            });
        }
        if computed != oid {
            return Err(Error::VerificationFailed {
                oid,
                reason: format!("content hashes to {}", computed),
            });
        }

        temp.as_file().sync_all()?;

        locks.with_lock(&final_path, || {
            if final_path.is_file() {
                tracing::debug!(%oid, "object already present, discarding duplicate upload");
                return Ok(PutOutcome::AlreadyPresent);
            }
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            temp.persist(&final_path).map_err(|e| Error::Io(e.error))?;
            tracing::info!(%oid, size, "object committed");
            Ok(PutOutcome::Stored)
        })
    }
}

/// Keyed lock table: one mutex per object path, created on demand and
/// dropped once no writer holds it.
#[derive(Default)]
struct CommitLocks {
    table: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CommitLocks {
    fn with_lock<T>(&self, key: &Path, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(key.to_path_buf()).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            table.remove(key);
        }
        result
    }
}
