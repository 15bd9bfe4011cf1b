//! Authentication subsystem.
//!
//! Validates SSH public keys and passwords against an [`IdentityStore`] and
//! produces the [`Identity`] a connection runs as.  Every failure path,
//! including store errors and malformed keys, ends in rejection.

pub mod keys;
pub mod store;

use std::fmt;
use std::sync::Arc;

use russh_keys::key::PublicKey;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use store::{FileIdentityStore, IdentityStore};

/// The authenticated principal of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// Why a credential was refused.  Only ever logged; the client sees a
/// uniform rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MalformedKey,
    UnknownKey,
    AmbiguousKey,
    AccountMismatch,
    BadPassword,
    StoreUnavailable,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("authentication rejected")]
pub struct AuthRejected {
    pub reason: RejectReason,
}

impl From<RejectReason> for AuthRejected {
    fn from(reason: RejectReason) -> Self {
        Self { reason }
    }
}

/// Checks credentials against an explicitly supplied identity store.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn IdentityStore>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Authenticate `username` by the public key it offered.
    pub async fn authenticate_publickey(
        &self,
        username: &str,
        key: &PublicKey,
    ) -> Result<Identity, AuthRejected> {
        let fingerprint = match keys::fingerprint_of(key) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(user = %username, error = %e, "rejecting malformed public key");
                return Err(RejectReason::MalformedKey.into());
            }
        };
        self.authenticate_fingerprint(username, &fingerprint).await
    }

    /// Authenticate `username` by a key fingerprint.
    ///
    /// Succeeds only when exactly one key record carries the fingerprint and
    /// that record belongs to `username`.
    #[instrument(skip(self))]
    pub async fn authenticate_fingerprint(
        &self,
        username: &str,
        fingerprint: &str,
    ) -> Result<Identity, AuthRejected> {
        let records = match self.store.find_keys_by_fingerprint(fingerprint).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "identity store key lookup failed");
                return Err(RejectReason::StoreUnavailable.into());
            }
        };

        let record = match records.as_slice() {
            [] => {
                debug!("no key record for fingerprint");
                return Err(RejectReason::UnknownKey.into());
            }
            [record] => record,
            many => {
                warn!(matches = many.len(), "fingerprint registered more than once");
                return Err(RejectReason::AmbiguousKey.into());
            }
        };

        if record.account != username {
            debug!(owner = %record.account, "key belongs to a different account");
            return Err(RejectReason::AccountMismatch.into());
        }

        debug!(comment = ?record.comment, "key matched");
        Ok(Identity::new(username))
    }

    /// Authenticate `username` by password.
    #[instrument(skip(self, password))]
    pub async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Identity, AuthRejected> {
        match self.store.check_password(username, password).await {
            Ok(true) => Ok(Identity::new(username)),
            Ok(false) => {
                debug!("password check failed");
                Err(RejectReason::BadPassword.into())
            }
            Err(e) => {
                warn!(error = %e, "identity store password check failed");
                Err(RejectReason::StoreUnavailable.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
