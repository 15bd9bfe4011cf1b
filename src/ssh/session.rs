//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler authenticates the client through the [`Authenticator`], tracks the
//! mode of every session channel, and hands exec requests to the
//! [`Dispatcher`] on a task of their own.  Client bytes reach that task over
//! a bounded queue; a full queue holds up the session loop, which stops
//! reading from the socket until the subprocess catches up.
//!
//! [`Authenticator`]: crate::auth::Authenticator
//! [`Dispatcher`]: super::dispatch::Dispatcher

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::channel::SshChannel;
use super::dispatch::{ExecChannel, ExecRequest};
use crate::auth::Identity;
use crate::AppState;

/// Client chunks buffered per exec channel before `data` waits.
const INPUT_QUEUE_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// What a session channel has been asked to do.
#[derive(Debug)]
enum ChannelMode {
    Shell,
    Exec {
        /// Feeds the subprocess stdin; `None` once the client sent EOF.
        input: Option<mpsc::Sender<Bytes>>,
        cancel: CancellationToken,
    },
}

#[derive(Debug, Default)]
struct ChannelSlot {
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
    mode: Option<ChannelMode>,
}

/// The channels of one connection.
///
/// Every exec channel gets a child of the table's token.  Dropping the table
/// cancels them all and drops every input sender, so each subprocess sees
/// EOF and then its grace period.
struct ChannelTable<K> {
    slots: HashMap<K, ChannelSlot>,
    cancel: CancellationToken,
}

impl<K> ChannelTable<K>
where
    K: Eq + Hash + Copy + Debug,
{
    /// `parent` is the server-wide shutdown token.
    fn new(parent: &CancellationToken) -> Self {
        Self {
            slots: HashMap::new(),
            cancel: parent.child_token(),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn open(&mut self, id: K) {
        self.slots.insert(id, ChannelSlot::default());
    }

    fn set_git_protocol(&mut self, id: K, value: &str) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.git_protocol = Some(value.to_string());
        }
    }

    fn set_shell(&mut self, id: K) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.mode = Some(ChannelMode::Shell);
        }
    }

    /// Switch `id` into exec mode.  Returns the subprocess end of the input
    /// queue, the channel's cancel token and the negotiated protocol, or
    /// `None` if the channel already runs something.
    fn start_exec(
        &mut self,
        id: K,
    ) -> Option<(mpsc::Receiver<Bytes>, CancellationToken, Option<String>)> {
        let slot = self.slots.entry(id).or_default();
        if slot.mode.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let cancel = self.cancel.child_token();
        slot.mode = Some(ChannelMode::Exec {
            input: Some(tx),
            cancel: cancel.clone(),
        });
        Some((rx, cancel, slot.git_protocol.clone()))
    }

    /// Queue client bytes for the subprocess, waiting while its queue is full.
    async fn forward(&self, id: K, data: &[u8]) {
        let Some(ChannelSlot {
            mode:
                Some(ChannelMode::Exec {
                    input: Some(tx),
                    cancel,
                }),
            ..
        }) = self.slots.get(&id)
        else {
            return;
        };
        tokio::select! {
            res = tx.send(Bytes::copy_from_slice(data)) => {
                if res.is_err() {
                    trace!(channel = ?id, "subprocess gone; dropping client bytes");
                }
            }
            () = cancel.cancelled() => {}
        }
    }

    fn close_input(&mut self, id: K) {
        if let Some(ChannelSlot {
            mode: Some(ChannelMode::Exec { input, .. }),
            ..
        }) = self.slots.get_mut(&id)
        {
            input.take();
        }
    }

    fn close(&mut self, id: K) {
        if let Some(ChannelSlot {
            mode: Some(ChannelMode::Exec { cancel, .. }),
            ..
        }) = self.slots.remove(&id)
        {
            cancel.cancel();
        }
    }
}

impl<K> Drop for ChannelTable<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    host_addr: Option<SocketAddr>,
    identity: Option<Identity>,
    channels: ChannelTable<ChannelId>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(
        state: Arc<AppState>,
        peer_addr: Option<SocketAddr>,
        host_addr: Option<SocketAddr>,
    ) -> Self {
        let channels = ChannelTable::new(&state.shutdown);
        Self {
            state,
            peer_addr,
            host_addr,
            identity: None,
            channels,
        }
    }

    fn username(&self) -> &str {
        self.identity.as_ref().map(Identity::username).unwrap_or("")
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        debug!(peer = ?self.peer_addr, channels = self.channels.len(), "SSH connection closed");
    }
}

// ---------------------------------------------------------------------------
// Channel close helper
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).  Git's SSH transport client expects all three
/// signals; omitting exit-status or EOF causes the client to treat the channel
/// close as a transport failure ("the remote end hung up unexpectedly").
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

fn shell_banner(username: &str) -> String {
    format!(
        "Hi {username}! You've successfully authenticated, but gitgate does not provide shell access.\r\n"
    )
}

fn rejected() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        match self.state.authenticator.authenticate_publickey(user, key).await {
            Ok(identity) => {
                info!(peer = ?self.peer_addr, user = %identity, "public-key auth accepted");
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(peer = ?self.peer_addr, user = %user, reason = ?e.reason, "public-key auth rejected");
                Ok(rejected())
            }
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.state.config.ssh.password_auth {
            debug!(peer = ?self.peer_addr, user = %user, "password auth disabled");
            return Ok(rejected());
        }
        match self
            .state
            .authenticator
            .authenticate_password(user, password)
            .await
        {
            Ok(identity) => {
                info!(peer = ?self.peer_addr, user = %identity, "password auth accepted");
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(peer = ?self.peer_addr, user = %user, reason = ?e.reason, "password auth rejected");
                Ok(rejected())
            }
        }
    }

    /// Accept new channel-open requests for sessions.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "session channel opened");
        self.channels.open(channel.id());
        Ok(true)
    }

    /// Capture environment variables sent by the client before the exec
    /// request.  Git clients send `GIT_PROTOCOL=version=2` here to negotiate
    /// protocol v2 with the pack subprocess.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.channels.set_git_protocol(channel, variable_value);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, term = %term, "pty request accepted");
        session.channel_success(channel);
        Ok(())
    }

    /// Interactive logins get a greeting and nothing else.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(peer = ?self.peer_addr, user = %self.username(), "shell request");
        self.channels.set_shell(channel);
        session.channel_success(channel);
        session.data(
            channel,
            CryptoVec::from_slice(shell_banner(self.username()).as_bytes()),
        );
        finish_channel(session, channel, 0);
        Ok(())
    }

    /// Handle `exec` requests on an established channel.
    ///
    /// The command runs on its own task; this callback returns as soon as the
    /// task is started.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let exec = ExecRequest::parse(&String::from_utf8_lossy(data));
        info!(
            peer = ?self.peer_addr,
            user = %self.username(),
            command = %exec.raw,
            "SSH exec request"
        );

        let Some(identity) = self.identity.clone() else {
            warn!(peer = ?self.peer_addr, "exec request before authentication");
            finish_channel(session, channel_id, 1);
            return Ok(());
        };

        let Some((rx, cancel, git_protocol)) = self.channels.start_exec(channel_id) else {
            warn!(channel = ?channel_id, "channel already has a command");
            finish_channel(session, channel_id, 1);
            return Ok(());
        };

        let io = Arc::new(SshChannel::new(
            session.handle(),
            channel_id,
            self.peer_addr,
            self.host_addr,
        ));
        let state = Arc::clone(&self.state);
        session.channel_success(channel_id);

        self.state.tasks.spawn(async move {
            let channel = ExecChannel {
                io,
                input: rx,
                cancel,
            };
            let outcome = state
                .dispatcher
                .dispatch(&exec, &identity, channel, git_protocol.as_deref())
                .await;
            debug!(?outcome, "exec channel finished");
        });

        Ok(())
    }

    /// Forward data received from the client to the running subprocess.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.forward(channel, data).await;
        Ok(())
    }

    /// When the client signals EOF, close the subprocess's stdin so it knows
    /// the client is done.  The subprocess keeps running.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.close_input(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, "channel closed by client");
        self.channels.close(channel);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
