//! Exec-request dispatch.
//!
//! Turns the command string of an SSH `exec` request into either a refusal or
//! exactly one pack subprocess bound to the channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::bridge::{run_bridge, BridgeOptions};
use super::channel::DuplexChannel;
use crate::auth::Identity;
use crate::git::{GitVerb, LocateError, RepositoryLocator, SpawnSpec, Spawner};

/// Written to the client for anything other than the two pack commands.
pub const COMMAND_NOT_ALLOWED: &[u8] = b"Command not allowed.\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("command not allowed: {command:?}")]
    CommandRejected { command: String },

    #[error("repository argument missing")]
    MissingRepository,

    #[error(transparent)]
    NotFound(#[from] LocateError),
}

/// A tokenized exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub raw: String,
    pub tokens: Vec<String>,
}

impl ExecRequest {
    /// Tokenize with POSIX shell quoting rules.  Unbalanced quotes yield no
    /// tokens, which dispatch treats as a refused command.
    pub fn parse(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            tokens: shlex::split(raw).unwrap_or_default(),
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    pub fn repository_arg(&self) -> Option<&str> {
        self.tokens.get(1).map(String::as_str)
    }
}

/// The channel a dispatched command runs on.
pub struct ExecChannel {
    pub io: Arc<dyn DuplexChannel>,
    /// Client bytes; the sender is dropped on client EOF.
    pub input: mpsc::Receiver<Bytes>,
    /// Fires when the owning connection closes.
    pub cancel: CancellationToken,
}

/// Terminal state of one dispatched channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Rejected,
    NotFound,
    SpawnFailed,
    Exited { code: u32 },
}

/// Resolves exec requests against the repositories root and launches the
/// matching pack binary.
#[derive(Clone)]
pub struct Dispatcher {
    locator: RepositoryLocator,
    upload_pack: String,
    receive_pack: String,
    spawner: Arc<dyn Spawner>,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(locator: RepositoryLocator, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            locator,
            upload_pack: GitVerb::UploadPack.as_str().to_string(),
            receive_pack: GitVerb::ReceivePack.as_str().to_string(),
            spawner,
            shutdown_grace: Duration::from_secs(30),
        }
    }

    /// Override the binaries run for each verb.
    pub fn with_programs(
        mut self,
        upload_pack: impl Into<String>,
        receive_pack: impl Into<String>,
    ) -> Self {
        self.upload_pack = upload_pack.into();
        self.receive_pack = receive_pack.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn program_for(&self, verb: GitVerb) -> &str {
        match verb {
            GitVerb::UploadPack => &self.upload_pack,
            GitVerb::ReceivePack => &self.receive_pack,
        }
    }

    /// Decide what to run for `exec` without running it.
    pub fn plan(
        &self,
        exec: &ExecRequest,
        git_protocol: Option<&str>,
    ) -> Result<SpawnSpec, DispatchError> {
        let verb = exec
            .program()
            .and_then(GitVerb::from_program)
            .ok_or_else(|| DispatchError::CommandRejected {
                command: exec.raw.clone(),
            })?;
        let arg = exec
            .repository_arg()
            .ok_or(DispatchError::MissingRepository)?;
        let repo = self.locator.resolve(arg)?;

        let mut spec = SpawnSpec::for_repository(
            verb,
            self.program_for(verb),
            &repo,
            self.locator.root(),
        );
        if let Some(proto) = git_protocol {
            spec = spec.env("GIT_PROTOCOL", proto);
        }
        Ok(spec)
    }

    /// Run `exec` on `channel` to completion.
    ///
    /// Every path ends with the channel closed: refusals after their message,
    /// successful spawns once the subprocess exits.
    #[instrument(skip_all, fields(user = %identity, command = %exec.raw, peer = ?channel.io.peer(), host = ?channel.io.host()))]
    pub async fn dispatch(
        &self,
        exec: &ExecRequest,
        identity: &Identity,
        channel: ExecChannel,
        git_protocol: Option<&str>,
    ) -> DispatchOutcome {
        let ExecChannel { io, input, cancel } = channel;

        let spec = match self.plan(exec, git_protocol) {
            Ok(spec) => spec,
            Err(DispatchError::CommandRejected { .. }) => {
                warn!("rejected exec command");
                if let Err(e) = io.write(COMMAND_NOT_ALLOWED).await {
                    debug!(error = %e, "could not deliver refusal message");
                }
                finish(io.as_ref(), 1).await;
                return DispatchOutcome::Rejected;
            }
            Err(e) => {
                info!(error = %e, "repository not found");
                finish(io.as_ref(), 1).await;
                return DispatchOutcome::NotFound;
            }
        };

        let child = match self.spawner.spawn(&spec) {
            Ok(child) => child,
            Err(e) => {
                error!(program = %spec.program, error = %e, "failed to spawn pack subprocess");
                let message = format!("Failed to start {}\n", spec.verb);
                if let Err(e) = io.write_stderr(message.as_bytes()).await {
                    debug!(error = %e, "could not deliver spawn failure message");
                }
                finish(io.as_ref(), 1).await;
                return DispatchOutcome::SpawnFailed;
            }
        };

        info!(repo = ?spec.args, verb = %spec.verb, pid = ?child.id(), "serving git command");

        let opts = BridgeOptions {
            verb: spec.verb,
            shutdown_grace: self.shutdown_grace,
        };
        match run_bridge(child, Arc::clone(&io), input, cancel, opts).await {
            Ok(summary) => {
                info!(
                    exit_code = summary.exit_code,
                    bytes_in = summary.bytes_in,
                    bytes_out = summary.bytes_out,
                    advertised_refs = summary.advertised_refs,
                    pushed_refs = ?summary.pushed_refs,
                    reported_failure = summary.reported_failure,
                    "git command finished"
                );
                DispatchOutcome::Exited {
                    code: summary.exit_code,
                }
            }
            Err(e) => {
                error!(error = %e, "subprocess bridge failed");
                finish(io.as_ref(), 1).await;
                DispatchOutcome::Exited { code: 1 }
            }
        }
    }
}

async fn finish(io: &dyn DuplexChannel, code: u32) {
    if let Err(e) = io.exit_status(code).await {
        debug!(error = %e, "could not deliver exit status");
    }
    if let Err(e) = io.lose_connection().await {
        debug!(error = %e, "channel already closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
