//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::{info, warn};

use super::session::SshSession;
use crate::config::SshConfig;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
    listen_addr: SocketAddr,
}

impl SshServer {
    pub fn new(state: Arc<AppState>, listen_addr: SocketAddr) -> Self {
        Self { state, listen_addr }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(
            peer = ?peer_addr,
            "new SSH client connection",
        );
        SshSession::new(Arc::clone(&self.state), peer_addr, Some(self.listen_addr))
    }
}

// ---------------------------------------------------------------------------
// Server key loading
// ---------------------------------------------------------------------------

/// Load the SSH host key from `path`.  When no key exists yet, generate an
/// Ed25519 key and persist it there so clients see the same host identity
/// across restarts.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    warn!(path = %path.display(), "no SSH host key found; generating Ed25519 key");
    let key = KeyPair::generate_ed25519();
    write_host_key(path, &key)?;
    Ok(key)
}

fn write_host_key(path: &Path, key: &KeyPair) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create host key dir: {}", dir.display()))?;
    }

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(key, &mut pem).context("failed to encode SSH host key")?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create SSH host key: {}", path.display()))?;
    file.write_all(&pem)
        .with_context(|| format!("failed to write SSH host key: {}", path.display()))?;
    Ok(())
}

/// Translate the `ssh` config section into a russh server config.
fn server_config(ssh: &SshConfig, host_key: KeyPair) -> server::Config {
    let mut methods = MethodSet::PUBLICKEY;
    if ssh.password_auth {
        methods |= MethodSet::PASSWORD;
    }

    server::Config {
        keys: vec![host_key],
        methods,
        preferred: russh::Preferred::DEFAULT,
        inactivity_timeout: Some(Duration::from_secs(ssh.inactivity_timeout)),
        auth_rejection_time: Duration::from_secs(ssh.auth_rejection_time),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: ssh.max_auth_attempts,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  This function runs until the server is shut down
/// or an unrecoverable error occurs.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let ssh = &state.config.ssh;
    let listen_addr: SocketAddr = ssh
        .listen
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", ssh.listen))?;

    let host_key = load_or_generate_host_key(&ssh.host_key_path)?;
    let config = Arc::new(server_config(ssh, host_key));

    info!(
        address = %listen_addr,
        password_auth = ssh.password_auth,
        "starting SSH server"
    );

    let mut ssh_server = SshServer::new(Arc::clone(&state), listen_addr);
    ssh_server
        .run_on_address(config, listen_addr)
        .await
        .context("SSH server exited with error")?;

    Ok(())
}
