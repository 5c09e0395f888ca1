//! ACME HTTP-01 challenge responses
//!
//! The ACME client (certbot or similar) writes challenge files under the
//! configured webroot; this module serves them on the plaintext listener.
//! The check runs before authentication and before registry lookup, so
//! issuance works for hosts that are not registered yet.

use std::path::{Path, PathBuf};
use tracing::debug;

/// Fixed URL prefix intercepted on the plaintext listener
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Extract and sanitize the challenge token from a request path
///
/// Returns `None` when the path is not a challenge request. The token is
/// reduced to `[A-Za-z0-9_-]` so it can never escape the challenge
/// directory.
pub fn challenge_token(path: &str) -> Option<String> {
    let raw = path.strip_prefix(CHALLENGE_PREFIX)?;
    Some(sanitize_token(raw))
}

fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Filesystem location of a challenge token under the webroot
pub fn challenge_path(challenge_root: &Path, token: &str) -> PathBuf {
    challenge_root
        .join(".well-known")
        .join("acme-challenge")
        .join(token)
}

/// Read a challenge response from the webroot
///
/// Any failure (missing token, unreadable file) is reported as an error;
/// the dispatcher turns that into an abrupt connection termination so a
/// probing client cannot tell valid tokens from invalid ones.
pub async fn read_challenge(challenge_root: &Path, token: &str) -> std::io::Result<Vec<u8>> {
    let path = challenge_path(challenge_root, token);
    let contents = tokio::fs::read(&path).await?;
    debug!(token = %token, "Served ACME challenge");
    Ok(contents)
}
