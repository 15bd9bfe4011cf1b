//! SSH front end of the gateway.
//!
//! Accepts SSH connections from Git clients, authenticates them against the
//! identity store, and runs `git-upload-pack` / `git-receive-pack` for the
//! numbered repository named in the exec request.  Shell logins get a
//! greeting; every other command is refused.

pub mod bridge;
pub mod channel;
pub mod dispatch;
pub mod server;
pub mod session;

pub use dispatch::Dispatcher;
pub use server::start_ssh_server;
