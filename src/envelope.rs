//! Encryption seam for RPC payloads.
//!
//! Payloads are sealed with a conversation key derived from one side's secret
//! key and the other side's public key (NIP-04 or NIP-44 in practice). This
//! crate only consumes the primitive; callers plug in an implementation.

use crate::{error::Result, keys::Keys};

/// Symmetric envelope between two keypairs.
///
/// `decrypt(b, a.pub, encrypt(a, b.pub, m)) == m` must hold for any two
/// keypairs `a` and `b`. Failures are reported as [`crate::Error::Protocol`].
pub trait Envelope: Send + Sync {
    fn encrypt(&self, keys: &Keys, peer_pubkey: &str, plaintext: &str) -> Result<String>;
    fn decrypt(&self, keys: &Keys, peer_pubkey: &str, ciphertext: &str) -> Result<String>;
}
