//! Identity and key lookup.
//!
//! The gateway does not own accounts; it only reads them.  [`IdentityStore`]
//! is the seam to whatever holds them, and [`FileIdentityStore`] is the
//! YAML-backed implementation the binary uses, exported by the web
//! application:
//!
//! ```yaml
//! users:
//!   - username: alice
//!     password_hash: "$argon2id$v=19$m=19456,t=2,p=1$..."
//!     keys:
//!       - "ssh-ed25519 AAAAC3Nza... alice@laptop"
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::keys::parse_authorized_key;

/// One registered public key and the account that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub account: String,
    pub comment: Option<String>,
}

/// Read-only view of accounts and their credentials.
///
/// Implementations must tolerate concurrent readers; the gateway never
/// writes through this interface.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// All key records whose fingerprint equals `fingerprint`.
    async fn find_keys_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<KeyRecord>>;

    /// Whether `password` is the current password of `username`.
    async fn check_password(&self, username: &str, password: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IdentityFile {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    username: String,
    /// PHC-format password hash (argon2); password login is disabled when
    /// absent.
    #[serde(default)]
    password_hash: Option<String>,
    /// `authorized_keys`-style lines.
    #[serde(default)]
    keys: Vec<String>,
}

/// In-memory index built from an identities YAML file.
#[derive(Debug, Default)]
pub struct FileIdentityStore {
    keys: HashMap<String, Vec<KeyRecord>>,
    passwords: HashMap<String, String>,
}

impl FileIdentityStore {
    /// Load and index the identities file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read identities file: {}", path.display()))?;
        let store = Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse identities file: {}", path.display()))?;
        info!(
            path = %path.display(),
            users = store.passwords.len(),
            fingerprints = store.keys.len(),
            "identity store loaded"
        );
        Ok(store)
    }

    /// Build the index from YAML text.
    ///
    /// Unparseable key lines and password hashes are skipped with a warning
    /// so one bad entry cannot lock every user out.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let file: IdentityFile = serde_yaml::from_str(contents)?;
        let mut store = Self::default();

        for user in file.users {
            if let Some(hash) = user.password_hash {
                match PasswordHash::new(&hash) {
                    Ok(_) => {
                        store.passwords.insert(user.username.clone(), hash);
                    }
                    Err(e) => warn!(
                        username = %user.username,
                        error = %e,
                        "ignoring malformed password hash"
                    ),
                }
            }

            for line in &user.keys {
                match parse_authorized_key(line) {
                    Ok(parsed) => {
                        debug!(
                            username = %user.username,
                            fingerprint = %parsed.fingerprint,
                            "indexed public key"
                        );
                        store
                            .keys
                            .entry(parsed.fingerprint)
                            .or_default()
                            .push(KeyRecord {
                                account: user.username.clone(),
                                comment: parsed.comment,
                            });
                    }
                    Err(e) => warn!(
                        username = %user.username,
                        error = %e,
                        "ignoring malformed public key"
                    ),
                }
            }
        }

        Ok(store)
    }
}

fn verify_password(hash: &str, password: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn find_keys_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<KeyRecord>> {
        Ok(self.keys.get(fingerprint).cloned().unwrap_or_default())
    }

    async fn check_password(&self, username: &str, password: &str) -> Result<bool> {
        let Some(hash) = self.passwords.get(username).cloned() else {
            return Ok(false);
        };
        // Argon2 verification is CPU-bound.
        let password = password.to_string();
        tokio::task::spawn_blocking(move || verify_password(&hash, &password))
            .await
            .context("password verification task failed")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::keys::tests::{ALICE_FP, ALICE_KEY, BOB_FP, BOB_KEY};
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::{Algorithm, Params, Version};

    /// PHC hash of `password` with cheap parameters so tests stay fast.
    /// Verification reads the parameters back out of the string.
    pub(crate) fn phc_hash(password: &str) -> String {
        let salt = SaltString::encode_b64(b"gitgate-test-salt").unwrap();
        let params = Params::new(1024, 1, 1, None).unwrap();
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn store_yaml() -> String {
        let hunter2 = phc_hash("hunter2");
        format!(
            "users:\n\
             \x20 - username: alice\n\
             \x20   password_hash: \"{hunter2}\"\n\
             \x20   keys:\n\
             \x20     - \"{ALICE_KEY}\"\n\
             \x20     - \"ssh-ed25519 garbage\"\n\
             \x20 - username: bob\n\
             \x20   keys:\n\
             \x20     - \"{BOB_KEY}\"\n"
        )
    }

    #[tokio::test]
    async fn finds_key_by_fingerprint() {
        let store = FileIdentityStore::from_yaml(&store_yaml()).unwrap();
        let records = store.find_keys_by_fingerprint(ALICE_FP).await.unwrap();
        assert_eq!(
            records,
            vec![KeyRecord {
                account: "alice".to_string(),
                comment: Some("alice@laptop".to_string()),
            }]
        );
        let records = store.find_keys_by_fingerprint(BOB_FP).await.unwrap();
        assert_eq!(records[0].account, "bob");
    }

    #[tokio::test]
    async fn unknown_fingerprint_is_empty() {
        let store = FileIdentityStore::from_yaml(&store_yaml()).unwrap();
        let records = store
            .find_keys_by_fingerprint("SHA256:nope")
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn shared_key_yields_every_owner() {
        let yaml = format!(
            "users:\n  - username: a\n    keys: [\"{ALICE_KEY}\"]\n  - username: b\n    keys: [\"{ALICE_KEY}\"]\n"
        );
        let store = FileIdentityStore::from_yaml(&yaml).unwrap();
        let records = store.find_keys_by_fingerprint(ALICE_FP).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn password_check() {
        let store = FileIdentityStore::from_yaml(&store_yaml()).unwrap();
        assert!(store.check_password("alice", "hunter2").await.unwrap());
        assert!(!store.check_password("alice", "hunter3").await.unwrap());
        assert!(!store.check_password("bob", "hunter2").await.unwrap());
        assert!(!store.check_password("mallory", "hunter2").await.unwrap());
    }

    #[tokio::test]
    async fn hash_with_default_params_verifies() {
        let salt = SaltString::encode_b64(b"another-test-salt").unwrap();
        let hash = Argon2::default()
            .hash_password(b"correct horse", &salt)
            .unwrap()
            .to_string();
        let yaml = format!("users:\n  - username: dana\n    password_hash: \"{hash}\"\n");
        let store = FileIdentityStore::from_yaml(&yaml).unwrap();
        assert!(store.check_password("dana", "correct horse").await.unwrap());
        assert!(!store.check_password("dana", "correct horse ").await.unwrap());
    }

    #[test]
    fn malformed_hash_is_skipped() {
        let yaml = "users:\n  - username: c\n    password_hash: \"f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7\"\n";
        let store = FileIdentityStore::from_yaml(yaml).unwrap();
        assert!(store.passwords.is_empty());
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("identities.yaml");
        std::fs::write(&path, store_yaml()).unwrap();
        let store = FileIdentityStore::load(&path).unwrap();
        assert_eq!(store.keys.len(), 2);
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(FileIdentityStore::load("/nonexistent/gitgate/identities.yaml").is_err());
    }

    #[test]
    fn empty_document_has_no_users() {
        let store = FileIdentityStore::from_yaml("users: []\n").unwrap();
        assert!(store.keys.is_empty());
        assert!(store.passwords.is_empty());
    }
}
