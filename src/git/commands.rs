//! Pack-protocol subprocess launching.
//!
//! The gateway never speaks the pack protocol itself: it runs the system
//! `git-upload-pack` / `git-receive-pack` binaries inside the repositories
//! root and streams their stdio.  Processes are spawned through
//! [`tokio::process::Command`] with all three streams piped.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use super::repo::RepositoryRef;

// ---------------------------------------------------------------------------
// Verbs
// ---------------------------------------------------------------------------

/// The two Git transport commands the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitVerb {
    /// Fetch / clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl GitVerb {
    /// Match an exec request's program token exactly.
    pub fn from_program(program: &str) -> Option<Self> {
        match program {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }
}

impl std::fmt::Display for GitVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Spawn specification
// ---------------------------------------------------------------------------

/// Everything needed to start one pack-protocol subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub verb: GitVerb,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    /// `program <id>.git`, run from the repositories root.
    pub fn for_repository(
        verb: GitVerb,
        program: impl Into<String>,
        repo: &RepositoryRef,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            verb,
            program: program.into(),
            args: vec![repo.dir_name()],
            cwd: root.into(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Build the piped [`Command`] for this spec.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.cwd);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

// ---------------------------------------------------------------------------
// Spawner
// ---------------------------------------------------------------------------

/// Starts subprocesses for the dispatcher.
pub trait Spawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> std::io::Result<Child>;
}

/// Spawns real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    #[instrument(skip(self), fields(program = %spec.program, cwd = %spec.cwd.display()))]
    fn spawn(&self, spec: &SpawnSpec) -> std::io::Result<Child> {
        let child = spec.command().spawn()?;
        debug!(pid = ?child.id(), argv = ?spec.argv(), "spawned pack subprocess");
        Ok(child)
    }
}
