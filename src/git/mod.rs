//! Git wire framing, repository lookup and pack subprocess launching.
//!
//! The pack protocol itself is run by the system `git-upload-pack` /
//! `git-receive-pack` binaries; this module only frames what the gateway
//! observes or originates.

pub mod commands;
pub mod pktline;
pub mod repo;
pub mod report;
pub mod splitter;

pub use commands::{GitVerb, ProcessSpawner, SpawnSpec, Spawner};
pub use repo::{LocateError, RepositoryLocator};
