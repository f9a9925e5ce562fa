//! Repository context.
//!
//! Every store and index call takes an explicit [`RepoContext`], so several
//! repositories can be served side by side without sharing any ambient
//! "current repository" state.

use std::path::{Path, PathBuf};

use crate::{Error, Oid, Result};

/// Directory under a repository that holds its LFS data.
const LFS_DIR: &str = "lfs";
const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// Directory containing the bare Git repositories being served.
///
/// The repositories themselves are owned by Git; this type only resolves
/// names to their LFS areas.
#[derive(Debug, Clone)]
pub struct Projects {
    root: PathBuf,
}

impl Projects {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Projects {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a repository by name.
    ///
    /// Fails with [`Error::RepoNotFound`] unless `<root>/<name>` is an
    /// existing directory.
    pub fn open(&self, name: &str) -> Result<RepoContext> {
        validate_repo_name(name)?;
        let git_dir = self.root.join(name);
        if !git_dir.is_dir() {
            return Err(Error::RepoNotFound(name.to_string()));
        }
        Ok(RepoContext {
            name: name.to_string(),
            lfs_root: git_dir.join(LFS_DIR),
        })
    }
}

/// A single repository's LFS area.
///
/// Layout: `<repo>/lfs/objects/<oid[0:2]>/<oid[2:4]>/<oid>` for committed
/// objects, `<repo>/lfs/tmp/` for uploads still being received.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoContext {
    name: String,
    lfs_root: PathBuf,
}

impl RepoContext {
    /// Build a context for an LFS root directly, without a projects lookup.
    pub fn at<P: AsRef<Path>>(name: &str, lfs_root: P) -> Result<Self> {
        validate_repo_name(name)?;
        Ok(RepoContext {
            name: name.to_string(),
            lfs_root: lfs_root.as_ref().to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lfs_root(&self) -> &Path {
        &self.lfs_root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.lfs_root.join(OBJECTS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.lfs_root.join(TMP_DIR)
    }

    /// Get the path where an object with the given OID is stored.
    ///
    /// Two levels of two-hex-digit shards keep any one directory at no more
    /// than 256 entries until the leaves fill.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.objects_dir()
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex)
    }
}

/// Check that a repository name is a single, ordinary path component.
pub fn validate_repo_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::BadRequest(format!("invalid repository name: {:?}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_object_path() {
        let repo = RepoContext::at("repo.git", "/srv/git/repo.git/lfs").unwrap();
        let oid = Oid::from_hex("4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393").unwrap();

        let path = repo.object_path(&oid);
        assert_eq!(
            path,
            PathBuf::from("/srv/git/repo.git/lfs/objects/4d/7a/4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393")
        );
        assert_eq!(repo.tmp_dir(), PathBuf::from("/srv/git/repo.git/lfs/tmp"));
    }

    #[test]
    fn test_open_existing_repo() {
        let td = TempDir::new().unwrap();
        std::fs::create_dir(td.path().join("repo.git")).unwrap();

        let projects = Projects::new(td.path());
        let repo = projects.open("repo.git").unwrap();
        assert_eq!(repo.name(), "repo.git");
        assert_eq!(repo.lfs_root(), td.path().join("repo.git").join("lfs"));
    }

    #[test]
    fn test_open_missing_repo() {
        let td = TempDir::new().unwrap();
        let projects = Projects::new(td.path());
        assert!(matches!(projects.open("nope.git"), Err(Error::RepoNotFound(_))));
    }

    #[test]
    fn test_open_plain_file_is_not_a_repo() {
        let td = TempDir::new().unwrap();
        std::fs::write(td.path().join("file.git"), b"x").unwrap();
        let projects = Projects::new(td.path());
        assert!(matches!(projects.open("file.git"), Err(Error::RepoNotFound(_))));
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(validate_repo_name(name), Err(Error::BadRequest(_))),
                "accepted {:?}",
                name
            );
        }
        assert!(validate_repo_name("repo.git").is_ok());
        assert!(validate_repo_name("..repo").is_ok());
    }

    #[test]
    fn test_contexts_are_distinct_per_repo() {
        let a = RepoContext::at("a.git", "/srv/a.git/lfs").unwrap();
        let b = RepoContext::at("b.git", "/srv/b.git/lfs").unwrap();
        let oid = Oid::from_content(b"shared");
        assert_ne!(a.object_path(&oid), b.object_path(&oid));
    }
}
