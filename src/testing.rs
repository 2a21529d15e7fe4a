//! In-process relay and helpers shared by unit tests.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use secp256k1::{ecdh::shared_secret_point, Parity, PublicKey, XOnlyPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{
    envelope::Envelope,
    error::{Error, Result},
    event::{Event, Tag, UnsignedEvent},
    filter::Filter,
    keys::Keys,
};

/// Unsigned kind 1 record with a fixed author, enough for routing tests.
pub(crate) fn sample_event(id: &str, created_at: u64) -> Event {
    event_of_kind(id, created_at, 1)
}

pub(crate) fn event_of_kind(id: &str, created_at: u64, kind: u32) -> Event {
    Event {
        id: id.into(),
        pubkey: "p".into(),
        kind,
        created_at,
        tags: vec![Tag::new(["d", "x"])],
        content: String::new(),
        sig: String::new(),
    }
}

/// Reversible envelope keyed on the ECDH point of the two parties.
///
/// Not confidential; it only proves both sides derived the same secret.
pub(crate) struct TestEnvelope;

impl TestEnvelope {
    fn conversation_tag(keys: &Keys, peer: &str) -> Result<String> {
        let bytes = hex::decode(peer).map_err(Error::protocol)?;
        let xonly = XOnlyPublicKey::from_slice(&bytes).map_err(Error::protocol)?;
        let point = shared_secret_point(
            &PublicKey::from_x_only_public_key(xonly, Parity::Even),
            &keys.secret_key(),
        );
        Ok(hex::encode(&Sha256::digest(&point[..32])[..8]))
    }
}

impl Envelope for TestEnvelope {
    fn encrypt(&self, keys: &Keys, peer_pubkey: &str, plaintext: &str) -> Result<String> {
        let tag = Self::conversation_tag(keys, peer_pubkey)?;
        Ok(format!("{tag}:{}", hex::encode(plaintext)))
    }

    fn decrypt(&self, keys: &Keys, peer_pubkey: &str, ciphertext: &str) -> Result<String> {
        let tag = Self::conversation_tag(keys, peer_pubkey)?;
        let (got, body) = ciphertext
            .split_once(':')
            .ok_or_else(|| Error::protocol("not an envelope"))?;
        if got != tag {
            return Err(Error::protocol("wrong conversation key"));
        }
        let bytes = hex::decode(body).map_err(Error::protocol)?;
        String::from_utf8(bytes).map_err(Error::protocol)
    }
}

/// Builds the records a relay delivers after it receives a published one.
pub(crate) type Responder = Arc<dyn Fn(&Event) -> Vec<Event> + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct MockRelayConfig {
    /// Records returned to every `REQ` whose filter matches them.
    pub stored: Vec<Event>,
    /// Answer `OK false` with this reason instead of accepting.
    pub reject: Option<String>,
    /// Never send `OK` or `EOSE`.
    pub silent: bool,
    pub responder: Option<Responder>,
}

#[derive(Clone)]
enum Control {
    Push(Event),
    HangUp,
}

/// WebSocket relay on a random local port, recording every client frame.
pub(crate) struct MockRelay {
    pub url: String,
    frames: Arc<Mutex<Vec<Value>>>,
    ctl: broadcast::Sender<Control>,
    server: JoinHandle<()>,
}

impl MockRelay {
    pub async fn spawn(cfg: MockRelayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (ctl, _) = broadcast::channel(64);
        let server = tokio::spawn({
            let frames = frames.clone();
            let ctl = ctl.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_conn(
                        stream,
                        cfg.clone(),
                        frames.clone(),
                        ctl.subscribe(),
                    ));
                }
            }
        });
        Self {
            url: format!("ws://{addr}"),
            frames,
            ctl,
            server,
        }
    }

    /// Deliver `ev` to every live subscription, ignoring filters.
    pub fn push(&self, ev: Event) {
        let _ = self.ctl.send(Control::Push(ev));
    }

    /// Drop every open connection.
    pub fn hang_up(&self) {
        let _ = self.ctl.send(Control::HangUp);
    }

    /// Client frames whose verb is `verb`, oldest first.
    pub fn frames(&self, verb: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f[0] == verb)
            .cloned()
            .collect()
    }

    pub fn published(&self) -> Vec<Event> {
        self.frames("EVENT")
            .into_iter()
            .map(|f| serde_json::from_value(f[1].clone()).unwrap())
            .collect()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve_conn(
    stream: TcpStream,
    cfg: MockRelayConfig,
    frames: Arc<Mutex<Vec<Value>>>,
    mut ctl: broadcast::Receiver<Control>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let mut live: Vec<String> = Vec::new();
    loop {
        let mut out: Vec<Value> = Vec::new();
        tokio::select! {
            msg = ws.next() => {
                let txt = match msg {
                    Some(Ok(Message::Text(txt))) => txt,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(frame) = serde_json::from_str::<Value>(&txt) else {
                    continue;
                };
                frames.lock().unwrap().push(frame.clone());
                match frame[0].as_str() {
                    Some("REQ") => {
                        let sub_id = frame[1].as_str().unwrap_or_default().to_string();
                        let filter: Filter =
                            serde_json::from_value(frame[2].clone()).unwrap_or_default();
                        for ev in cfg.stored.iter().filter(|ev| filter.matches(ev)) {
                            out.push(json!(["EVENT", sub_id, ev]));
                        }
                        if !cfg.silent {
                            out.push(json!(["EOSE", sub_id]));
                        }
                        live.push(sub_id);
                    }
                    Some("CLOSE") => live.retain(|s| frame[1] != s.as_str()),
                    Some("EVENT") => {
                        let Ok(ev) = serde_json::from_value::<Event>(frame[1].clone()) else {
                            continue;
                        };
                        if !cfg.silent {
                            match &cfg.reject {
                                Some(reason) => out.push(json!(["OK", ev.id, false, reason])),
                                None => out.push(json!(["OK", ev.id, true, ""])),
                            }
                        }
                        if let Some(responder) = &cfg.responder {
                            for reply in responder(&ev) {
                                for sub_id in &live {
                                    out.push(json!(["EVENT", sub_id, reply]));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            ctl = ctl.recv() => match ctl {
                Ok(Control::Push(ev)) => {
                    for sub_id in &live {
                        out.push(json!(["EVENT", sub_id, ev]));
                    }
                }
                Ok(Control::HangUp) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
        for frame in out {
            if ws.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
    }
    let _ = ws.close(None).await;
}

/// A decoded request as seen by a scripted peer.
pub(crate) struct RpcRequest {
    pub id: String,
    pub method: String,
    pub params: Vec<String>,
    /// Public key of the client that sent it.
    pub client: String,
}

/// Responder playing an RPC peer holding `peer`: it decrypts requests tagged
/// to it and seals each reply body returned by `handler`.
pub(crate) fn rpc_responder<F>(peer: Keys, handler: F) -> Responder
where
    F: Fn(&RpcRequest) -> Vec<Value> + Send + Sync + 'static,
{
    Arc::new(move |ev: &Event| {
        if ev.tag_value("p") != Some(peer.public_key()) {
            return vec![];
        }
        let Ok(plain) = TestEnvelope.decrypt(&peer, &ev.pubkey, &ev.content) else {
            return vec![];
        };
        let Ok(body) = serde_json::from_str::<Value>(&plain) else {
            return vec![];
        };
        let req = RpcRequest {
            id: body["id"].as_str().unwrap_or_default().to_string(),
            method: body["method"].as_str().unwrap_or_default().to_string(),
            params: body["params"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            client: ev.pubkey.clone(),
        };
        handler(&req)
            .iter()
            .map(|reply| reply_event(&peer, &ev.pubkey, ev.kind, reply))
            .collect()
    })
}

/// Signed record from `from` to `to` carrying `body` in a test envelope.
pub(crate) fn reply_event(from: &Keys, to: &str, kind: u32, body: &Value) -> Event {
    let content = TestEnvelope.encrypt(from, to, &body.to_string()).unwrap();
    from.sign(UnsignedEvent::new(kind, vec![Tag::new(["p", to])], content))
}
