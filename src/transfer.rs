//! Transfer endpoint: the byte-moving half of the protocol.
//!
//! Every transfer is bound to an action issued by the negotiator. An upload
//! goes `Idle -> Receiving -> {Committed | Rejected}`: [`TransferEndpoint::begin_upload`]
//! redeems the action and yields an [`Upload`] in the receiving state,
//! [`Upload::finish`] either commits or rejects it, and dropping an
//! unfinished upload rejects it. Nothing survives a rejected attempt; the
//! client retries the whole object.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use crate::action::ActionRegistry;
use crate::gate::{self, AccessGate};
use crate::index::{ObjectIndex, ObjectState};
use crate::repo::Projects;
use crate::store::{PutOutcome, StagedObject};
use crate::{ContentStore, Error, Oid, Operation, RepoContext, Result};

/// Serves uploads and downloads for issued actions.
pub struct TransferEndpoint {
    projects: Projects,
    store: ContentStore,
    index: Arc<ObjectIndex>,
    actions: Arc<ActionRegistry>,
    gate: Arc<dyn AccessGate>,
}

impl TransferEndpoint {
    pub fn new(
        projects: Projects,
        store: ContentStore,
        index: Arc<ObjectIndex>,
        actions: Arc<ActionRegistry>,
        gate: Arc<dyn AccessGate>,
    ) -> Self {
        TransferEndpoint {
            projects,
            store,
            index,
            actions,
            gate,
        }
    }

    /// Resolve the repository and OID of a transfer and redeem its action.
    fn authorize(
        &self,
        repo_name: &str,
        oid: &str,
        action_header: Option<&str>,
        operation: Operation,
    ) -> Result<(RepoContext, Oid, u64)> {
        let repo = self.projects.open(repo_name)?;
        let oid = Oid::from_hex(oid)?;
        let grant = self.actions.redeem(action_header, &repo, &oid, operation)?;
        gate::check(self.gate.as_ref(), &repo, operation, &grant.principal)?;
        Ok((repo, oid, grant.size))
    }

    /// Start receiving an upload.
    pub fn begin_upload(
        &self,
        repo_name: &str,
        oid: &str,
        action_header: Option<&str>,
    ) -> Result<Upload> {
        let (repo, oid, size) = self.authorize(repo_name, oid, action_header, Operation::Upload)?;
        let staged = self.store.stage(&repo, oid, size)?;
        tracing::debug!(repo = repo.name(), %oid, size, "receiving upload");
        Ok(Upload {
            repo,
            staged,
            index: Arc::clone(&self.index),
        })
    }

    /// Receive a whole upload from a reader.
    pub fn upload<R: Read>(
        &self,
        repo_name: &str,
        oid: &str,
        action_header: Option<&str>,
        mut reader: R,
    ) -> Result<PutOutcome> {
        let mut upload = self.begin_upload(repo_name, oid, action_header)?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            upload.write_chunk(&buf[..n])?;
        }
        upload.finish()
    }

    /// Open a complete object for download, returning it with its length.
    pub fn download(
        &self,
        repo_name: &str,
        oid: &str,
        action_header: Option<&str>,
    ) -> Result<(File, u64)> {
        let (repo, oid, _) = self.authorize(repo_name, oid, action_header, Operation::Download)?;

        let complete = self
            .index
            .resolve(&self.store, &repo, &oid)?
            .is_some_and(|e| e.state == ObjectState::Complete);
        if !complete {
            return Err(Error::ObjectNotFound(oid));
        }

        let file = self.store.get(&repo, &oid)?;
        let len = file.metadata()?.len();
        tracing::debug!(repo = repo.name(), %oid, len, "serving download");
        Ok((file, len))
    }
}

/// An upload in the receiving state.
pub struct Upload {
    repo: RepoContext,
    staged: StagedObject,
    index: Arc<ObjectIndex>,
}

impl Upload {
    pub fn oid(&self) -> &Oid {
        self.staged.oid()
    }

    /// Declared size from the upload action.
    pub fn size(&self) -> u64 {
        self.staged.size()
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.staged.write_chunk(chunk).map_err(|err| {
            tracing::warn!(repo = self.repo.name(), oid = %self.staged.oid(), %err, "upload rejected");
            err
        })
    }

    /// Verify and commit, then record the object as complete.
    ///
    /// The index is only touched after the store commit succeeded, so it
    /// never claims bytes the store does not hold.
    pub fn finish(self) -> Result<PutOutcome> {
        let Upload {
            repo,
            staged,
            index,
        } = self;
        let oid = *staged.oid();
        let size = staged.size();

        let outcome = staged.commit().map_err(|err| {
            tracing::warn!(repo = repo.name(), %oid, %err, "upload rejected");
            err
        })?;
        index.mark_complete(&repo, &oid, size)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ACTION_HEADER;
    use crate::gate::{AllowAll, Principal};
    use chrono::Duration;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;
    use url::Url;

    struct Fixture {
        _td: TempDir,
        repo: RepoContext,
        store: ContentStore,
        index: Arc<ObjectIndex>,
        actions: Arc<ActionRegistry>,
        endpoint: TransferEndpoint,
    }

    fn fixture_with(gate: Arc<dyn AccessGate>, ttl: Duration) -> Fixture {
        let td = TempDir::new().unwrap();
        fs::create_dir(td.path().join("repo.git")).unwrap();
        let projects = Projects::new(td.path());
        let repo = projects.open("repo.git").unwrap();
        let store = ContentStore::new();
        let index = Arc::new(ObjectIndex::new());
        let actions = Arc::new(
            ActionRegistry::new(Url::parse("http://localhost:5000").unwrap(), ttl).unwrap(),
        );
        let endpoint = TransferEndpoint::new(
            projects,
            store.clone(),
            Arc::clone(&index),
            Arc::clone(&actions),
            gate,
        );
        Fixture {
            _td: td,
            repo,
            store,
            index,
            actions,
            endpoint,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(AllowAll), Duration::hours(1))
    }

    /// Negotiate the upload the way the batch endpoint would.
    fn upload_token(f: &Fixture, oid: Oid, size: u64) -> String {
        f.index.mark_pending(&f.repo, &oid, size).unwrap();
        let action = f
            .actions
            .issue(&f.repo, oid, size, Operation::Upload, &Principal::Anonymous)
            .unwrap();
        action.header[ACTION_HEADER].clone()
    }

    fn download_token(f: &Fixture, oid: Oid, size: u64) -> String {
        let action = f
            .actions
            .issue(&f.repo, oid, size, Operation::Download, &Principal::Anonymous)
            .unwrap();
        action.header[ACTION_HEADER].clone()
    }

    #[test]
    fn test_upload_commits_and_completes() {
        let f = fixture();
        let content = b"uploaded through the endpoint";
        let oid = Oid::from_content(content);
        let token = upload_token(&f, oid, content.len() as u64);

        let outcome = f
            .endpoint
            .upload("repo.git", &oid.to_hex(), Some(&token), &content[..])
            .unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(f.index.lookup(&f.repo, &oid), ObjectState::Complete);
        assert!(f.store.verify(&f.repo, &oid).unwrap());
    }

    #[test]
    fn test_upload_verification_failure_changes_nothing() {
        let f = fixture();
        let oid = Oid::from_content(b"the real thing");
        let token = upload_token(&f, oid, 14);

        let err = f
            .endpoint
            .upload("repo.git", &oid.to_hex(), Some(&token), &b"a forged thing"[..])
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { .. }));
        assert!(!f.store.exists(&f.repo, &oid));
        assert_eq!(f.index.lookup(&f.repo, &oid), ObjectState::PendingUpload);

        // The client can retry with the right bytes under the same action
        f.endpoint
            .upload("repo.git", &oid.to_hex(), Some(&token), &b"the real thing"[..])
            .unwrap();
        assert!(f.store.exists(&f.repo, &oid));
    }

    #[test]
    fn test_dropped_upload_is_rejected() {
        let f = fixture();
        let content = b"connection dropped halfway";
        let oid = Oid::from_content(content);
        let token = upload_token(&f, oid, content.len() as u64);

        let mut upload = f
            .endpoint
            .begin_upload("repo.git", &oid.to_hex(), Some(&token))
            .unwrap();
        upload.write_chunk(&content[..10]).unwrap();
        drop(upload);

        assert!(!f.store.exists(&f.repo, &oid));
        assert_eq!(fs::read_dir(f.repo.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_expired_action_rejected_without_touching_storage() {
        let f = fixture_with(Arc::new(AllowAll), Duration::zero());
        let content = b"too late";
        let oid = Oid::from_content(content);
        let token = upload_token(&f, oid, content.len() as u64);

        let err = f
            .endpoint
            .upload("repo.git", &oid.to_hex(), Some(&token), &content[..])
            .unwrap_err();
        assert!(matches!(err, Error::ActionExpired(_)));
        assert!(!f.store.exists(&f.repo, &oid));
        assert!(!f.repo.tmp_dir().exists());
    }

    #[test]
    fn test_upload_requires_matching_action() {
        let f = fixture();
        let oid = Oid::from_content(b"one");
        let other = Oid::from_content(b"two");
        let token = upload_token(&f, oid, 3);

        assert!(matches!(
            f.endpoint.upload("repo.git", &other.to_hex(), Some(&token), &b"two"[..]),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            f.endpoint.upload("repo.git", &oid.to_hex(), None, &b"one"[..]),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            f.endpoint.upload("repo.git", "xyz", Some(&token), &b"one"[..]),
            Err(Error::InvalidOid(_))
        ));
    }

    #[test]
    fn test_gate_rechecked_on_transfer() {
        let no_uploads = |_: &RepoContext, op: Operation, _: &Principal| op == Operation::Download;
        let f = fixture_with(Arc::new(no_uploads), Duration::hours(1));
        let oid = Oid::from_content(b"one");
        let token = upload_token(&f, oid, 3);

        assert!(matches!(
            f.endpoint.upload("repo.git", &oid.to_hex(), Some(&token), &b"one"[..]),
            Err(Error::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_concurrent_uploads_both_succeed() {
        let f = Arc::new(fixture());
        let content: Vec<u8> = (0..128 * 1024).map(|i| (i % 13) as u8).collect();
        let oid = Oid::from_content(&content);
        let token = upload_token(&f, oid, content.len() as u64);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = Arc::clone(&f);
                let token = token.clone();
                let content = content.clone();
                thread::spawn(move || {
                    f.endpoint
                        .upload("repo.git", &oid.to_hex(), Some(&token), &content[..])
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| **o == PutOutcome::Stored).count(), 1);
        assert_eq!(f.index.lookup(&f.repo, &oid), ObjectState::Complete);
        assert!(f.store.verify(&f.repo, &oid).unwrap());
    }

    #[test]
    fn test_download() {
        let f = fixture();
        let content = b"download me";
        let oid = Oid::from_content(content);
        f.store.put(&f.repo, oid, content.len() as u64, &content[..]).unwrap();
        let token = download_token(&f, oid, content.len() as u64);

        let (mut file, len) = f.endpoint.download("repo.git", &oid.to_hex(), Some(&token)).unwrap();
        assert_eq!(len, content.len() as u64);
        let mut body = Vec::new();
        file.read_to_end(&mut body).unwrap();
        assert_eq!(Oid::from_content(&body), oid);
    }

    #[test]
    fn test_download_missing_object() {
        let f = fixture();
        let oid = Oid::from_content(b"gone");
        let token = download_token(&f, oid, 4);

        assert!(matches!(
            f.endpoint.download("repo.git", &oid.to_hex(), Some(&token)),
            Err(Error::ObjectNotFound(_))
        ));
    }
}
