use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ssh: SshConfig,
    pub repositories: RepositoriesConfig,
    pub identities: IdentitiesConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

// ---------------------------------------------------------------------------
// SSH listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address the SSH listener binds (e.g. `0.0.0.0:2222`).
    pub listen: String,
    /// Private host key.  Generated (Ed25519) and written here when absent.
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    /// Idle seconds before a connection is dropped.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: u64,
    /// Delay (seconds) imposed after each rejected authentication attempt.
    #[serde(default = "default_auth_rejection_time")]
    pub auth_rejection_time: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
    /// Advertise the `password` method in addition to `publickey`.
    #[serde(default = "default_password_auth")]
    pub password_auth: bool,
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("/var/lib/gitgate/ssh_host_ed25519_key")
}

fn default_inactivity_timeout() -> u64 {
    600
}

fn default_auth_rejection_time() -> u64 {
    1
}

fn default_max_auth_attempts() -> usize {
    3
}

fn default_password_auth() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoriesConfig {
    /// Directory holding `<id>.git` bare repositories.  Must be absolute.
    pub root: PathBuf,
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IdentitiesConfig {
    /// YAML file of users, password digests and public keys.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Pack subprocesses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_upload_pack")]
    pub upload_pack: String,
    #[serde(default = "default_receive_pack")]
    pub receive_pack: String,
    /// Seconds a subprocess may outlive its connection before it is killed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            upload_pack: default_upload_pack(),
            receive_pack: default_receive_pack(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_upload_pack() -> String {
    "git-upload-pack".to_string()
}

fn default_receive_pack() -> String {
    "git-receive-pack".to_string()
}

fn default_shutdown_grace() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.repositories.root.is_absolute(),
        "repositories.root must be an absolute path"
    );
    anyhow::ensure!(
        config.ssh.listen.parse::<SocketAddr>().is_ok(),
        "ssh.listen is not a valid socket address: {:?}",
        config.ssh.listen
    );
    anyhow::ensure!(
        config.ssh.max_auth_attempts >= 1,
        "ssh.max_auth_attempts must be at least 1"
    );
    anyhow::ensure!(
        !config.process.upload_pack.is_empty() && !config.process.receive_pack.is_empty(),
        "process binaries must not be empty"
    );
    Ok(())
}
