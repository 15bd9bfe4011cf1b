//! Duplex byte channel abstraction.
//!
//! The dispatcher and subprocess bridge only ever talk to a
//! [`DuplexChannel`], so the real SSH channel ([`SshChannel`]) and the
//! in-memory recorder used in tests are interchangeable.

use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

/// SSH extended-data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Outbound half of a channel plus its lifecycle controls.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Send bytes to the client's stdout stream.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Send several buffers back to back, in order.
    async fn write_sequence(&self, chunks: &[&[u8]]) -> Result<()> {
        for chunk in chunks {
            self.write(chunk).await?;
        }
        Ok(())
    }

    /// Send bytes to the client's stderr stream.
    async fn write_stderr(&self, data: &[u8]) -> Result<()>;

    /// Report the remote command's exit status.
    async fn exit_status(&self, code: u32) -> Result<()>;

    /// Signal EOF and close the channel.
    async fn lose_connection(&self) -> Result<()>;

    fn peer(&self) -> Option<SocketAddr>;

    fn host(&self) -> Option<SocketAddr>;
}

// ---------------------------------------------------------------------------
// russh implementation
// ---------------------------------------------------------------------------

/// A session channel reached through a russh [`Handle`], usable from tasks
/// outside the handler callbacks.
pub struct SshChannel {
    handle: Handle,
    id: ChannelId,
    peer: Option<SocketAddr>,
    host: Option<SocketAddr>,
}

impl SshChannel {
    pub fn new(
        handle: Handle,
        id: ChannelId,
        peer: Option<SocketAddr>,
        host: Option<SocketAddr>,
    ) -> Self {
        Self {
            handle,
            id,
            peer,
            host,
        }
    }
}

#[async_trait]
impl DuplexChannel for SshChannel {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| anyhow!("channel {:?} is closed", self.id))
    }

    async fn write_stderr(&self, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(self.id, EXTENDED_DATA_STDERR, CryptoVec::from_slice(data))
            .await
            .map_err(|_| anyhow!("channel {:?} is closed", self.id))
    }

    async fn exit_status(&self, code: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.id, code)
            .await
            .map_err(|_| anyhow!("channel {:?} is closed", self.id))
    }

    /// EOF then close, the order Git's SSH transport expects after
    /// exit-status (RFC 4254).
    async fn lose_connection(&self) -> Result<()> {
        let _ = self.handle.eof(self.id).await;
        self.handle
            .close(self.id)
            .await
            .map_err(|_| anyhow!("channel {:?} is closed", self.id))
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn host(&self) -> Option<SocketAddr> {
        self.host
    }
}

// ---------------------------------------------------------------------------
// Test recorder
// ---------------------------------------------------------------------------
