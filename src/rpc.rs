//! Encrypted request/reply protocol over a single relay connection.
//!
//! Requests are `{id, method, params}` objects sealed to the peer, wrapped in
//! an event of the channel kind and tagged `["p", peer]`. Replies come back as
//! `{id, result, error}` on a live subscription and are matched to the waiting
//! caller by `id`, so any number of requests can be in flight at once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    envelope::Envelope,
    error::{Error, Result},
    event::{now, Event, Tag, UnsignedEvent},
    filter::Filter,
    keys::Keys,
    relay::{random_id, Relay, RelayEvent, Subscription},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result value a signer uses to ask for out-of-band authorization.
const AUTH_URL: &str = "auth_url";

/// How far back the reply subscription reaches, to absorb clock skew.
pub(crate) const SINCE_SKEW: u64 = 10;

#[derive(Serialize)]
struct Request<'a> {
    id: &'a str,
    method: &'a str,
    params: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(crate) struct Reply {
    pub id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Reply {
    pub fn result_text(&self) -> Option<String> {
        self.result.clone().map(value_text)
    }

    /// Error text, treating an empty string as no error.
    pub fn error_text(&self) -> Option<String> {
        self.error.clone().map(value_text).filter(|e| !e.is_empty())
    }
}

fn value_text(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

enum Outcome {
    AuthUrl(String),
    Done(Result<String>),
}

struct Inner {
    kind: u32,
    keys: Keys,
    peer: String,
    envelope: Arc<dyn Envelope>,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<Outcome>>>,
    auth_listener: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Inner {
    fn handle_reply(&self, ev: &Event) {
        if ev.pubkey != self.peer {
            debug!(from = %ev.pubkey, "ignoring event from unexpected author");
            return;
        }
        let plain = match self.envelope.decrypt(&self.keys, &self.peer, &ev.content) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(event = %ev.id, "dropping undecryptable reply: {e}");
                return;
            }
        };
        let reply: Reply = match serde_json::from_str(&plain) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(event = %ev.id, "dropping malformed reply: {e}");
                return;
            }
        };
        let mut pending = lock(&self.pending);
        let Some(tx) = pending.get(&reply.id) else {
            debug!(request = %reply.id, "no pending request for reply");
            return;
        };
        let result = reply.result_text();
        if result.as_deref() == Some(AUTH_URL) {
            let url = reply.error.clone().map(value_text).unwrap_or_default();
            info!(request = %reply.id, "authorization required, open: {url}");
            if let Some(listener) = lock(&self.auth_listener).as_ref() {
                let _ = listener.send(url.clone());
            }
            let _ = tx.send(Outcome::AuthUrl(url));
            return;
        }
        if let Some(tx) = pending.remove(&reply.id) {
            debug!(request = %reply.id, "reply");
            let outcome = match reply.error_text() {
                Some(err) => Err(Error::Remote(err)),
                None => Ok(result.unwrap_or_default()),
            };
            let _ = tx.send(Outcome::Done(outcome));
        }
    }

    fn fail_pending(&self, reason: &str) {
        for (_, tx) in lock(&self.pending).drain() {
            let _ = tx.send(Outcome::Done(Err(Error::transport(reason))));
        }
    }
}

/// Removes a pending entry however the waiting call ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(self.id);
    }
}

struct Listener {
    sub_id: String,
    task: JoinHandle<()>,
}

/// Request/reply client bound to one peer on one relay.
pub struct RpcClient {
    relay: Relay,
    inner: Arc<Inner>,
    timeout: Duration,
    listener: Mutex<Option<Listener>>,
}

impl RpcClient {
    pub fn new(
        relay: Relay,
        kind: u32,
        keys: Keys,
        peer: impl Into<String>,
        envelope: Arc<dyn Envelope>,
    ) -> Self {
        Self {
            relay,
            inner: Arc::new(Inner {
                kind,
                keys,
                peer: peer.into(),
                envelope,
                pending: Mutex::new(HashMap::new()),
                auth_listener: Mutex::new(None),
            }),
            timeout: DEFAULT_TIMEOUT,
            listener: Mutex::new(None),
        }
    }

    /// Default timeout used by [`RpcClient::send`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forward authorization URLs sent by the peer to `tx`.
    pub fn set_auth_listener(&self, tx: mpsc::UnboundedSender<String>) {
        *lock(&self.inner.auth_listener) = Some(tx);
    }

    pub fn keys(&self) -> &Keys {
        &self.inner.keys
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Open the live reply subscription. Does nothing if already open.
    pub async fn subscribe(&self) -> Result<()> {
        if self.is_subscribed() {
            return Ok(());
        }
        let filter = Filter::new()
            .kinds([self.inner.kind])
            .authors([self.inner.peer.as_str()])
            .tag('p', [self.inner.keys.public_key()])
            .since(now().saturating_sub(SINCE_SKEW));
        let sub = self.relay.subscribe(filter, false).await?;
        let listener = Listener {
            sub_id: sub.id.clone(),
            task: tokio::spawn(listen(self.inner.clone(), sub)),
        };
        let leftover = {
            let mut slot = lock(&self.listener);
            if slot.is_some() {
                Some(listener)
            } else {
                *slot = Some(listener);
                None
            }
        };
        if let Some(extra) = leftover {
            extra.task.abort();
            self.relay.close(&extra.sub_id).await;
        }
        Ok(())
    }

    /// Close the live reply subscription. Idempotent.
    pub async fn unsubscribe(&self) {
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            listener.task.abort();
            self.relay.close(&listener.sub_id).await;
        }
    }

    /// Send a request with the default timeout and wait for its result.
    pub async fn send(&self, method: &str, params: Vec<String>) -> Result<String> {
        self.send_with_timeout(method, params, self.timeout).await
    }

    /// Send a request and wait up to `timeout` for the matching reply.
    ///
    /// An authorization notice from the peer restarts the timeout window.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Vec<String>,
        timeout: Duration,
    ) -> Result<String> {
        let inner = &*self.inner;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = {
            let mut pending = lock(&inner.pending);
            let id = loop {
                let id = random_id();
                if !pending.contains_key(&id) {
                    break id;
                }
            };
            pending.insert(id.clone(), tx);
            id
        };
        let _guard = PendingGuard { inner, id: &id };

        let body = serde_json::to_string(&Request {
            id: &id,
            method,
            params: &params,
        })
        .map_err(Error::protocol)?;
        let content = inner.envelope.encrypt(&inner.keys, &inner.peer, &body)?;
        let event = inner.keys.sign(UnsignedEvent::new(
            inner.kind,
            vec![Tag::new(["p", inner.peer.as_str()])],
            content,
        ));
        debug!(request = %id, method, event = %event.id, "sending request");
        self.relay.publish(&event).await?;

        let mut deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Outcome::Done(result))) => return result,
                Ok(Some(Outcome::AuthUrl(_))) => deadline = Instant::now() + timeout,
                Ok(None) => return Err(Error::transport("rpc client closed")),
                Err(_) => {
                    debug!(request = %id, method, "request timed out");
                    return Err(Error::Timeout(timeout));
                }
            }
        }
    }

    /// Stop listening, fail outstanding requests and drop the connection.
    pub fn dispose(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.task.abort();
        }
        lock(&self.inner.pending).clear();
        self.relay.dispose();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn listen(inner: Arc<Inner>, mut sub: Subscription) {
    while let Some(item) = sub.events.recv().await {
        match item {
            RelayEvent::Event(ev) => inner.handle_reply(&ev),
            RelayEvent::EndOfStored => {}
            RelayEvent::Closed(reason) => {
                warn!(sub = %sub.id, "reply subscription closed: {reason}");
                inner.fail_pending(&reason);
                return;
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        reply_event, rpc_responder, sample_event, MockRelay, MockRelayConfig, TestEnvelope,
    };
    use serde_json::json;

    const KIND: u32 = 29525;

    async fn client_for(mock: &MockRelay, peer: &Keys) -> RpcClient {
        let client = RpcClient::new(
            Relay::new(mock.url.clone()),
            KIND,
            Keys::generate(),
            peer.public_key(),
            Arc::new(TestEnvelope),
        );
        client.subscribe().await.unwrap();
        client
    }

    fn echo_server(peer: &Keys) -> MockRelayConfig {
        MockRelayConfig {
            responder: Some(rpc_responder(peer.clone(), |req| match req.method.as_str() {
                "ping" => vec![json!({"id": req.id, "result": "pong"})],
                "echo" => vec![json!({"id": req.id, "result": req.params.join(",")})],
                "fail" => vec![json!({"id": req.id, "result": "", "error": "denied"})],
                "whoami" => vec![json!({"id": req.id, "result": req.client})],
                _ => vec![],
            })),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn request_resolves_with_result() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        assert_eq!(client.send("ping", vec![]).await.unwrap(), "pong");
        assert_eq!(
            client
                .send("echo", vec!["a".into(), "b".into()])
                .await
                .unwrap(),
            "a,b"
        );
        assert_eq!(
            client.send("whoami", vec![]).await.unwrap(),
            client.keys().public_key()
        );
        assert_eq!(client.pending_len(), 0);

        let published = mock.published();
        let req = published.last().unwrap();
        assert_eq!(req.kind, KIND);
        assert_eq!(req.tag_value("p"), Some(peer.public_key()));
        req.verify().unwrap();
    }

    #[tokio::test]
    async fn remote_error_rejects() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        match client.send("fail", vec![]).await {
            Err(Error::Remote(msg)) => assert_eq!(msg, "denied"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscription_filter_targets_peer_and_self() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reqs = mock.frames("REQ");
        let filter = &reqs[0][2];
        assert_eq!(filter["kinds"], json!([KIND]));
        assert_eq!(filter["authors"], json!([peer.public_key()]));
        assert_eq!(filter["#p"], json!([client.keys().public_key()]));
        assert!(filter["since"].as_u64().unwrap() >= now() - SINCE_SKEW - 5);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently() {
        let peer = Keys::generate();
        let held = Arc::new(Mutex::new(Vec::<String>::new()));
        let held_in = held.clone();
        // Hold the first request back and answer both, newest first.
        let mock = MockRelay::spawn(MockRelayConfig {
            responder: Some(rpc_responder(peer.clone(), move |req| {
                let mut held = held_in.lock().unwrap();
                let tagged = format!("{}|{}", req.id, req.params[0]);
                if held.is_empty() {
                    held.push(tagged);
                    return vec![];
                }
                let (first_id, first_param) = held[0].split_once('|').unwrap();
                vec![
                    json!({"id": req.id, "result": req.params[0]}),
                    json!({"id": first_id, "result": first_param}),
                ]
            })),
            ..Default::default()
        })
        .await;
        let client = client_for(&mock, &peer).await;
        let (a, b) = tokio::join!(
            client.send("echo", vec!["first".into()]),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                client.send("echo", vec!["second".into()]).await
            }
        );
        assert_eq!(a.unwrap(), "first");
        assert_eq!(b.unwrap(), "second");
        assert_eq!(held.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeout_removes_request_and_late_reply_is_dropped() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        let err = client
            .send_with_timeout("void", vec![], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(client.pending_len(), 0);

        // A late reply for the timed out id must not reach the next request.
        let late_id = {
            let published = mock.published();
            let req = published.last().unwrap();
            let plain = TestEnvelope
                .decrypt(&peer, client.keys().public_key(), &req.content)
                .unwrap();
            serde_json::from_str::<Value>(&plain).unwrap()["id"]
                .as_str()
                .unwrap()
                .to_string()
        };
        mock.push(reply_event(
            &peer,
            client.keys().public_key(),
            KIND,
            &json!({"id": late_id, "result": "stale"}),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.send("ping", vec![]).await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn auth_url_keeps_request_outstanding() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(MockRelayConfig {
            responder: Some(rpc_responder(peer.clone(), |req| {
                vec![
                    json!({"id": req.id, "result": "auth_url", "error": "https://signer/auth"}),
                    json!({"id": req.id, "result": "authorized"}),
                ]
            })),
            ..Default::default()
        })
        .await;
        let client = client_for(&mock, &peer).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.set_auth_listener(tx);
        assert_eq!(client.send("sign_event", vec![]).await.unwrap(), "authorized");
        assert_eq!(rx.recv().await.unwrap(), "https://signer/auth");
    }

    #[tokio::test]
    async fn garbage_and_foreign_replies_are_ignored() {
        let peer = Keys::generate();
        let stranger = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        let me = client.keys().public_key().to_string();
        let garbage = peer.sign(UnsignedEvent::new(
            KIND,
            vec![Tag::new(["p", me.as_str()])],
            "not an envelope",
        ));
        mock.push(garbage);
        mock.push(reply_event(&stranger, &me, KIND, &json!({"id": "x", "result": "y"})));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.send("ping", vec![]).await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn dropped_link_fails_outstanding_requests() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        let pending = client.send_with_timeout("void", vec![], Duration::from_secs(10));
        let hangup = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            mock.hang_up();
        };
        let (res, ()) = tokio::join!(pending, hangup);
        assert!(matches!(res, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn dispose_fails_outstanding_requests_and_closes_link() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        let pending = client.send_with_timeout("void", vec![], Duration::from_secs(10));
        let dispose = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            client.dispose();
        };
        let (res, ()) = tokio::join!(pending, dispose);
        assert!(matches!(res, Err(Error::Transport(_))));
        assert_eq!(client.pending_len(), 0);
        assert!(!client.is_subscribed());
        assert!(matches!(
            client.relay().publish(&sample_event("aa", 1)).await,
            Err(Error::Transport(_))
        ));
        // Dropping after dispose is a no-op.
        drop(client);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let peer = Keys::generate();
        let mock = MockRelay::spawn(echo_server(&peer)).await;
        let client = client_for(&mock, &peer).await;
        client.unsubscribe().await;
        client.unsubscribe().await;
        assert!(!client.is_subscribed());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.frames("CLOSE").len(), 1);
    }
}
