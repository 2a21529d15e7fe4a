//! Nostr event model.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – addresses another author's public key (used to route RPC traffic)
/// - `r` – references a URL, e.g. the repository of an announced service
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its name followed by its values.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "3356...",
///   "kind": 24133,
///   "created_at": 1700000000,
///   "tags": [["p", "ab12..."]],
///   "content": "<encrypted envelope>",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `24133` for remote signing traffic.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Value of the first tag called `name`, if it carries one.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.0.len() > 1 && t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// Cheap structural check of the hex fields before any cryptography runs.
    pub fn has_valid_shape(&self) -> bool {
        is_hex(&self.id, 64)
            && is_hex(&self.pubkey, 64)
            && is_hex(&self.sig, 128)
            && self.tags.iter().all(|t| !t.0.is_empty())
    }

    /// Verify the event's ID and Schnorr signature.
    pub fn verify(&self) -> Result<()> {
        let hash = event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(hash) != self.id {
            return Err(Error::protocol("id mismatch"));
        }
        let sig_bytes = hex::decode(&self.sig).map_err(Error::protocol)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(Error::protocol)?;
        let pk_bytes = hex::decode(&self.pubkey).map_err(Error::protocol)?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(Error::protocol)?;
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &Message::from_digest(hash), &pk)
            .map_err(|e| Error::protocol(format!("bad signature: {e}")))
    }
}

/// Event template before it has been hashed and signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// Author key; filled in by whoever signs the template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Template stamped with the current time.
    pub fn new(kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            pubkey: None,
            created_at: now(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// Compute the NIP-01 event hash over `[0, pubkey, created_at, kind, tags, content]`.
pub(crate) fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> [u8; 32] {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    // Serializing a `Value` built from strings and integers cannot fail.
    let data = arr.to_string();
    Sha256::digest(data.as_bytes()).into()
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}
