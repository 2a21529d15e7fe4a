//! Local secp256k1 keys used to sign RPC channel traffic.

use std::fmt;

use secp256k1::{Keypair, Message, Secp256k1, SecretKey};

use crate::{
    error::{Error, Result},
    event::{event_hash, Event, UnsignedEvent},
};

/// A keypair plus its hex x-only public key.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_key: String,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        Self::from_keypair(Keypair::from_secret_key(&secp, &sk))
    }

    /// Load a keypair from a 64 character hex secret.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_str(&secp, secret)
            .map_err(|e| Error::State(format!("invalid secret key: {e}")))?;
        Ok(Self::from_keypair(keypair))
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let public_key = hex::encode(keypair.x_only_public_key().0.serialize());
        Self {
            keypair,
            public_key,
        }
    }

    /// Hex x-only public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// Hash and Schnorr-sign a template as this key's author.
    pub fn sign(&self, tmpl: UnsignedEvent) -> Event {
        let secp = Secp256k1::signing_only();
        let pubkey = self.public_key.clone();
        let hash = event_hash(&pubkey, tmpl.created_at, tmpl.kind, &tmpl.tags, &tmpl.content);
        let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(hash), &self.keypair);
        Event {
            id: hex::encode(hash),
            pubkey,
            kind: tmpl.kind,
            created_at: tmpl.created_at,
            tags: tmpl.tags,
            content: tmpl.content,
            sig: hex::encode(sig.as_ref()),
        }
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
