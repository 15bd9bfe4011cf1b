//! SSH public key parsing and fingerprinting.

use anyhow::{Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used by
/// `ssh-keygen -l`).
pub fn fingerprint_of(key: &PublicKey) -> Result<String> {
    let blob_b64 = key.public_key_base64();
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .context("public key blob is not valid base64")?;
    Ok(fingerprint_of_blob(&blob))
}

/// Fingerprint of a raw wire-format key blob.
pub fn fingerprint_of_blob(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

/// A parsed `authorized_keys`-style line.
#[derive(Debug)]
pub struct AuthorizedKey {
    pub key: PublicKey,
    pub fingerprint: String,
    pub comment: Option<String>,
}

/// Parse `"<algorithm> <base64-blob> [comment]"`.
pub fn parse_authorized_key(line: &str) -> Result<AuthorizedKey> {
    let mut parts = line.split_whitespace();
    let algorithm = parts.next().context("empty key line")?;
    let blob_b64 = parts.next().context("key line has no key data")?;
    let comment = parts.collect::<Vec<_>>().join(" ");

    let key = russh_keys::parse_public_key_base64(blob_b64)
        .map_err(|e| anyhow::anyhow!("failed to parse {algorithm} key: {e}"))?;
    let fingerprint = fingerprint_of(&key)?;

    Ok(AuthorizedKey {
        key,
        fingerprint,
        comment: (!comment.is_empty()).then_some(comment),
    })
}
