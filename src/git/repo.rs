//! Repository lookup under the configured repositories root.
//!
//! Repositories live as bare Git repositories at `{root}/{id}.git`, where `id`
//! is the non-negative integer the web application assigned.  The gateway
//! only reads this layout; creating and deleting repositories belongs to the
//! application.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Why a repository argument could not be mapped to a repository on disk.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocateError {
    /// The argument is not a non-negative decimal id.
    #[error("invalid repository id {arg:?}")]
    InvalidId { arg: String },

    /// The id is well formed but no bare repository exists for it.
    #[error("repository {id} not found")]
    NotFound { id: u64 },
}

/// A resolved repository: its numeric id and bare-repo directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub id: u64,
    pub path: PathBuf,
}

impl RepositoryRef {
    /// Directory name relative to the repositories root (`"{id}.git"`).
    pub fn dir_name(&self) -> String {
        dir_name(self.id)
    }
}

fn dir_name(id: u64) -> String {
    format!("{id}.git")
}

/// Parse the repository argument of a git exec request into an id.
///
/// A single leading `/` (left over from `ssh://host:port/<id>` URLs) and a
/// trailing `.git` are tolerated, as is one explicit `+` sign.  Negative
/// numbers (`-0` included) and anything non-numeric are rejected.
pub fn parse_repository_id(arg: &str) -> Result<u64, LocateError> {
    let trimmed = arg.strip_prefix('/').unwrap_or(arg);
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let invalid = || LocateError::InvalidId {
        arg: arg.to_string(),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse::<u64>().map_err(|_| invalid())
}

/// Maps repository arguments to bare repositories under a fixed root.
#[derive(Debug, Clone)]
pub struct RepositoryLocator {
    root: PathBuf,
}

impl RepositoryLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate path for `arg` without touching the filesystem.
    pub fn candidate(&self, arg: &str) -> Result<RepositoryRef, LocateError> {
        let id = parse_repository_id(arg)?;
        Ok(RepositoryRef {
            id,
            path: self.root.join(dir_name(id)),
        })
    }

    /// Resolve `arg` and require a bare repository to exist at the candidate
    /// path.
    pub fn resolve(&self, arg: &str) -> Result<RepositoryRef, LocateError> {
        let repo = self.candidate(arg)?;
        let exists = is_bare_repo(&repo.path);
        debug!(
            repo_id = repo.id,
            path = %repo.path.display(),
            exists,
            "resolved repository"
        );
        if exists {
            Ok(repo)
        } else {
            Err(LocateError::NotFound { id: repo.id })
        }
    }
}

/// Lightweight bare-repo check: a directory containing a `HEAD` file.
pub fn is_bare_repo(path: &Path) -> bool {
    path.is_dir() && path.join("HEAD").is_file()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
