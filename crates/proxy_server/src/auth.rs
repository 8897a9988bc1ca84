//! Shared-secret message authentication for the bridge protocol.
//!
//! Every bridge message is tagged with HMAC-SHA256 over its signed bytes.
//! Tags are compared in constant time. Replay protection does not live in
//! the tag itself: each direction of a channel carries a strictly increasing
//! sequence number plus a timestamp, checked by [`ReplayGuard`] after the
//! tag verifies.

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Length of an authentication tag in bytes.
pub const TAG_LEN: usize = 32;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// How far a message timestamp may drift from the local clock, either way.
pub const MESSAGE_VALIDITY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("secret must be at least 16 bytes, got {0}")]
    SecretTooShort(usize),
    #[error("secret is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("message sequence {got} is not after {last}")]
    Replayed { got: u64, last: u64 },
    #[error("message timestamp {timestamp} is outside the validity window")]
    Stale { timestamp: u64 },
}

/// Secret shared between the proxy and one backend agent.
///
/// The keyed MAC state is computed once at construction, so tagging never
/// has to deal with key errors. `Debug` never prints key material.
#[derive(Clone)]
pub struct SharedSecret {
    keyed: HmacSha256,
}

impl SharedSecret {
    pub fn new(bytes: &[u8]) -> Result<Self, AuthError> {
        if bytes.len() < MIN_SECRET_LEN {
            return Err(AuthError::SecretTooShort(bytes.len()));
        }
        let keyed = HmacSha256::new_from_slice(bytes)
            .map_err(|e| AuthError::InvalidEncoding(e.to_string()))?;
        Ok(Self { keyed })
    }

    /// Parses a standard base64 secret, as stored in configuration files.
    pub fn from_base64(encoded: &str) -> Result<Self, AuthError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::InvalidEncoding(e.to_string()))?;
        Self::new(&bytes)
    }

    /// Generates a random 32-byte secret and returns it with its base64 form.
    pub fn generate() -> Result<(Self, String), AuthError> {
        let bytes = random_challenge(32);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok((Self::new(&bytes)?, encoded))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// 32-byte HMAC-SHA256 tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthTag(pub [u8; TAG_LEN]);

impl fmt::Debug for AuthTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthTag({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Computes the tag of `message` under `secret`.
pub fn tag(secret: &SharedSecret, message: &[u8]) -> AuthTag {
    let mut mac = secret.keyed.clone();
    mac.update(message);
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    AuthTag(out)
}

/// Checks `tag` against `message` in constant time.
pub fn verify(secret: &SharedSecret, message: &[u8], tag: &AuthTag) -> bool {
    let mut mac = secret.keyed.clone();
    mac.update(message);
    mac.verify_slice(&tag.0).is_ok()
}

/// Returns `len` random bytes, used for handshake challenges.
pub fn random_challenge(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Tracks the last accepted sequence number of one channel direction.
#[derive(Debug)]
pub struct ReplayGuard {
    last_sequence: Option<u64>,
    window: Duration,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(MESSAGE_VALIDITY)
    }
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            last_sequence: None,
            window,
        }
    }

    /// Accepts the message if its sequence is strictly greater than every
    /// previously accepted one and its timestamp is inside the window.
    ///
    /// Only call this after the tag has verified; a rejected message does
    /// not advance the guard.
    pub fn check(&mut self, sequence: u64, timestamp_ms: u64, now_ms: u64) -> Result<(), AuthError> {
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                return Err(AuthError::Replayed { got: sequence, last });
            }
        }
        if now_ms.abs_diff(timestamp_ms) > self.window.as_millis() as u64 {
            return Err(AuthError::Stale {
                timestamp: timestamp_ms,
            });
        }
        self.last_sequence = Some(sequence);
        Ok(())
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SharedSecret {
        SharedSecret::new(b"0123456789abcdef0123456789abcdef").expect("valid secret")
    }

    #[test]
    fn test_tag_verifies() {
        let s = secret();
        let t = tag(&s, b"hello backend");
        assert!(verify(&s, b"hello backend", &t));
    }

    #[test]
    fn test_tampered_message_fails() {
        let s = secret();
        let t = tag(&s, b"hello backend");
        assert!(!verify(&s, b"hello backenD", &t));

        let mut flipped = t;
        flipped.0[0] ^= 0x01;
        assert!(!verify(&s, b"hello backend", &flipped));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let t = tag(&secret(), b"payload");
        let other = SharedSecret::new(b"another-secret-of-enough-length").expect("valid");
        assert!(!verify(&other, b"payload", &t));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert_eq!(
            SharedSecret::new(b"short").unwrap_err(),
            AuthError::SecretTooShort(5)
        );
    }

    #[test]
    fn test_base64_secret() {
        let (generated, encoded) = SharedSecret::generate().expect("generate");
        let parsed = SharedSecret::from_base64(&encoded).expect("round trips");
        let t = tag(&generated, b"x");
        assert!(verify(&parsed, b"x", &t));
        assert!(SharedSecret::from_base64("not base64 !!").is_err());
    }

    #[test]
    fn test_replay_guard_rejects_old_sequence() {
        let mut guard = ReplayGuard::default();
        let now = 1_000_000;
        guard.check(1, now, now).expect("first");
        guard.check(2, now, now).expect("second");
        assert_eq!(
            guard.check(2, now, now).unwrap_err(),
            AuthError::Replayed { got: 2, last: 2 }
        );
        assert!(guard.check(1, now, now).is_err());
        guard.check(10, now, now).expect("gaps are fine");
    }

    #[test]
    fn test_replay_guard_rejects_stale_timestamp() {
        let mut guard = ReplayGuard::new(Duration::from_secs(300));
        let now = 10_000_000;
        assert!(guard.check(1, now - 301_000, now).is_err());
        assert!(guard.check(1, now + 301_000, now).is_err());
        // A rejected message does not consume its sequence number.
        guard.check(1, now - 299_000, now).expect("inside window");
    }
}
