//! NIP-46 remote signing session.
//!
//! The signer's private key never leaves the remote signer. This side holds a
//! throwaway client key, pairs it with the signer through one of two
//! handshakes and then forwards signing and encryption requests over an
//! [`RpcClient`] on kind 24133.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    credentials::{CredentialStore, Credentials},
    envelope::Envelope,
    error::{Error, Result},
    event::{now, Event, UnsignedEvent},
    filter::Filter,
    keys::Keys,
    kinds::KIND_NIP46,
    relay::{Relay, RelayEvent},
    rpc::{Reply, RpcClient, DEFAULT_TIMEOUT, SINCE_SKEW},
};

/// How the client learns which signer to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bootstrap {
    /// Signer key known up front, usually from a `bunker://` URI.
    Direct {
        signer_pubkey: String,
        secret: Option<String>,
    },
    /// Show a `nostrconnect://` URI and wait for the signer to answer it.
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub relay_url: String,
    pub perms: String,
    pub bootstrap: Bootstrap,
}

impl ConnectParams {
    /// Parse `bunker://<signer-pubkey>?relay=<url>&secret=<s>`.
    pub fn from_bunker_uri(uri: &str, perms: impl Into<String>) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::protocol(format!("bad bunker uri: {e}")))?;
        if url.scheme() != "bunker" {
            return Err(Error::protocol(format!("not a bunker uri: {uri}")));
        }
        let signer_pubkey = url
            .host_str()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| url.path().trim_start_matches('/'))
            .to_ascii_lowercase();
        if signer_pubkey.len() != 64 || !signer_pubkey.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::protocol(format!(
                "bad signer pubkey in bunker uri: {signer_pubkey}"
            )));
        }
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };
        let relay_url = param("relay").ok_or_else(|| Error::protocol("bunker uri has no relay"))?;
        Ok(Self {
            relay_url,
            perms: perms.into(),
            bootstrap: Bootstrap::Direct {
                signer_pubkey,
                secret: param("secret"),
            },
        })
    }

    pub fn interactive(relay_url: impl Into<String>, perms: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            perms: perms.into(),
            bootstrap: Bootstrap::Interactive,
        }
    }
}

/// Remote signer session.
pub struct RemoteSigner {
    envelope: Arc<dyn Envelope>,
    store: Arc<dyn CredentialStore>,
    tor_socks: Option<String>,
    timeout: Duration,
    auth_listener: Option<mpsc::UnboundedSender<String>>,
    session: Option<RpcClient>,
    user_pubkey: Mutex<Option<String>>,
}

impl RemoteSigner {
    pub fn new(envelope: Arc<dyn Envelope>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            envelope,
            store,
            tor_socks: None,
            timeout: DEFAULT_TIMEOUT,
            auth_listener: None,
            session: None,
            user_pubkey: Mutex::new(None),
        }
    }

    pub fn with_tor_socks(mut self, proxy: Option<String>) -> Self {
        self.tor_socks = proxy;
        self
    }

    /// Per-request timeout once the session is up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Receive authorization URLs the signer asks the user to open.
    pub fn with_auth_listener(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.auth_listener = Some(tx);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_started(&self) -> bool {
        self.session.is_some()
    }

    /// Signer public key of the running session.
    pub fn signer_pubkey(&self) -> Option<&str> {
        self.session.as_ref().map(RpcClient::peer)
    }

    /// Build the URI a signer app scans to pair with `client_pubkey`.
    pub fn connect_uri(client_pubkey: &str, relay: &str, perms: &str, secret: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("relay", relay)
            .append_pair("perms", perms)
            .append_pair("name", "encli")
            .append_pair("secret", secret)
            .finish();
        format!("nostrconnect://{client_pubkey}?{query}")
    }

    /// Pair a fresh client key with a signer and persist the session.
    ///
    /// `show_uri` is only called by the interactive flow, with the
    /// `nostrconnect://` URI to hand to the user. That flow waits until the
    /// signer answers; drop the future to give up.
    pub async fn login(
        &mut self,
        params: ConnectParams,
        show_uri: impl FnOnce(&str),
    ) -> Result<()> {
        self.session = None;
        self.reset_cache();
        let keys = Keys::generate();
        let relay = self.relay(&params.relay_url);

        let client = match &params.bootstrap {
            Bootstrap::Direct {
                signer_pubkey,
                secret,
            } => {
                let client = self.client(relay, keys.clone(), signer_pubkey.clone());
                client.subscribe().await?;
                let reply = client
                    .send(
                        "connect",
                        vec![
                            signer_pubkey.clone(),
                            secret.clone().unwrap_or_default(),
                            params.perms.clone(),
                        ],
                    )
                    .await;
                match reply {
                    Ok(ack) if ack == "ack" => {}
                    Ok(other) => {
                        return Err(Error::protocol(format!("handshake rejected: {other}")))
                    }
                    Err(Error::Remote(e)) => {
                        return Err(Error::protocol(format!("handshake rejected: {e}")))
                    }
                    Err(e) => return Err(e),
                }
                client
            }
            Bootstrap::Interactive => {
                let secret = hex::encode(rand::random::<[u8; 16]>());
                let signer = self
                    .await_connect(&relay, &keys, &params, &secret, show_uri)
                    .await?;
                let client = self.client(relay, keys.clone(), signer);
                client.subscribe().await?;
                client
            }
        };

        info!(signer = %client.peer(), relay = %params.relay_url, "connected to remote signer");
        self.store.save(&Credentials {
            client_secret: keys.secret_hex(),
            signer_pubkey: client.peer().to_string(),
            relay: params.relay_url,
        })?;
        self.session = Some(client);
        Ok(())
    }

    /// Resume the stored session.
    pub async fn start(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let creds = self.store.load()?.ok_or(Error::LoginRequired)?;
        let keys = Keys::from_secret_hex(&creds.client_secret)?;
        let client = self.client(self.relay(&creds.relay), keys, creds.signer_pubkey);
        client.subscribe().await?;
        debug!(signer = %client.peer(), "session started");
        self.session = Some(client);
        Ok(())
    }

    /// Forget the session and its stored credentials. Idempotent.
    pub fn logout(&mut self) -> Result<()> {
        self.session = None;
        self.reset_cache();
        self.store.clear()
    }

    /// User public key, fetched once per session.
    pub async fn get_public_key(&self) -> Result<String> {
        let session = self.session()?;
        if let Some(pk) = self.cached_pubkey() {
            return Ok(pk);
        }
        let pk = session.send("get_public_key", vec![]).await?;
        if pk.len() != 64 || !pk.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::protocol(format!("invalid pubkey from signer: {pk}")));
        }
        *lock(&self.user_pubkey) = Some(pk.clone());
        Ok(pk)
    }

    /// Have the signer sign `tmpl` and check what comes back.
    pub async fn sign_event(&self, tmpl: &UnsignedEvent) -> Result<Event> {
        let session = self.session()?;
        let body = serde_json::to_string(tmpl).map_err(Error::protocol)?;
        let reply = session.send("sign_event", vec![body]).await?;
        let event: Event = serde_json::from_str(&reply)
            .map_err(|e| Error::protocol(format!("invalid signed event: {e}")))?;
        if !event.has_valid_shape() {
            return Err(Error::protocol("invalid signed event"));
        }
        event.verify()?;
        Ok(event)
    }

    pub async fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String> {
        self.call("nip04_encrypt", pubkey, plaintext).await
    }

    pub async fn nip04_decrypt(&self, pubkey: &str, ciphertext: &str) -> Result<String> {
        self.call("nip04_decrypt", pubkey, ciphertext).await
    }

    pub async fn nip44_encrypt(&self, pubkey: &str, plaintext: &str) -> Result<String> {
        self.call("nip44_encrypt", pubkey, plaintext).await
    }

    pub async fn nip44_decrypt(&self, pubkey: &str, ciphertext: &str) -> Result<String> {
        self.call("nip44_decrypt", pubkey, ciphertext).await
    }

    pub async fn ping(&self) -> Result<()> {
        let reply = self.session()?.send("ping", vec![]).await?;
        if reply != "pong" {
            return Err(Error::protocol(format!("unexpected ping reply: {reply}")));
        }
        Ok(())
    }

    async fn call(&self, method: &str, pubkey: &str, text: &str) -> Result<String> {
        self.session()?
            .send(method, vec![pubkey.to_string(), text.to_string()])
            .await
    }

    fn session(&self) -> Result<&RpcClient> {
        self.session.as_ref().ok_or(Error::LoginRequired)
    }

    fn cached_pubkey(&self) -> Option<String> {
        lock(&self.user_pubkey).clone()
    }

    fn reset_cache(&self) {
        *lock(&self.user_pubkey) = None;
    }

    fn relay(&self, url: &str) -> Relay {
        Relay::new(url).with_tor_socks(self.tor_socks.clone())
    }

    fn client(&self, relay: Relay, keys: Keys, signer: String) -> RpcClient {
        let client = RpcClient::new(relay, KIND_NIP46, keys, signer, self.envelope.clone())
            .with_timeout(self.timeout);
        if let Some(tx) = &self.auth_listener {
            client.set_auth_listener(tx.clone());
        }
        client
    }

    /// Interactive handshake: wait for any signer to echo `secret` back.
    async fn await_connect(
        &self,
        relay: &Relay,
        keys: &Keys,
        params: &ConnectParams,
        secret: &str,
        show_uri: impl FnOnce(&str),
    ) -> Result<String> {
        let filter = Filter::new()
            .kinds([KIND_NIP46])
            .tag('p', [keys.public_key()])
            .since(now().saturating_sub(SINCE_SKEW));
        let mut sub = relay.subscribe(filter, false).await?;
        show_uri(&Self::connect_uri(
            keys.public_key(),
            &params.relay_url,
            &params.perms,
            secret,
        ));

        let signer = loop {
            let ev = match sub.events.recv().await {
                Some(RelayEvent::Event(ev)) => ev,
                Some(RelayEvent::EndOfStored) => continue,
                Some(RelayEvent::Closed(reason)) => {
                    return Err(Error::transport(format!("{}: {reason}", relay.url())))
                }
                None => return Err(Error::transport(format!("{}: closed", relay.url()))),
            };
            let reply = self
                .envelope
                .decrypt(keys, &ev.pubkey, &ev.content)
                .and_then(|plain| serde_json::from_str::<Reply>(&plain).map_err(Error::protocol));
            match reply {
                Ok(reply) if reply.result_text().as_deref() == Some(secret) => break ev.pubkey,
                Ok(reply) => debug!(from = %ev.pubkey, request = %reply.id, "ignoring connect reply"),
                Err(e) => warn!(from = %ev.pubkey, "dropping connect reply: {e}"),
            }
        };
        relay.close(&sub.id).await;
        Ok(signer)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
