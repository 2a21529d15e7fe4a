//! A single persistent connection to one relay.
//!
//! The socket is opened lazily on first use and never reopened: once the link
//! drops, every pending publish fails, every subscription receives
//! [`RelayEvent::Closed`], and later calls return a transport error.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::AbortHandle,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    message::{ClientMessage, RelayMessage},
};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;
type WsSink = SplitSink<WsStream, Message>;

/// What a subscription delivers, in the order the relay sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Event(Event),
    /// All stored matches were sent. Only delivered to one-shot subscriptions.
    EndOfStored,
    /// The relay or the link ended the subscription.
    Closed(String),
}

/// Handle to an open subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

struct SubSlot {
    filter: Filter,
    tx: mpsc::UnboundedSender<RelayEvent>,
    one_shot: bool,
}

#[derive(Default)]
struct Shared {
    subs: HashMap<String, SubSlot>,
    acks: HashMap<String, oneshot::Sender<std::result::Result<(), String>>>,
    /// Set once the link is gone; the reason is reported to later callers.
    dead: Option<String>,
}

impl Shared {
    fn fail_all(&mut self, reason: &str) {
        if self.dead.is_none() {
            self.dead = Some(reason.to_string());
        }
        for (_, slot) in self.subs.drain() {
            let _ = slot.tx.send(RelayEvent::Closed(reason.to_string()));
        }
        for (_, ack) in self.acks.drain() {
            let _ = ack.send(Err(format!("connection closed: {reason}")));
        }
    }
}

#[derive(Clone)]
struct Link {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    shared: Arc<Mutex<Shared>>,
    reader: AbortHandle,
}

enum LinkState {
    Idle,
    Open(Link),
    Closed(String),
}

/// Connection to one relay endpoint.
pub struct Relay {
    url: String,
    tor_socks: Option<String>,
    publish_timeout: Duration,
    connecting: tokio::sync::Mutex<()>,
    state: Mutex<LinkState>,
}

impl Relay {
    /// Create a relay handle. No network traffic happens until first use.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tor_socks: None,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            connecting: tokio::sync::Mutex::new(()),
            state: Mutex::new(LinkState::Idle),
        }
    }

    /// Route the connection through a SOCKS5 proxy such as Tor.
    pub fn with_tor_socks(mut self, proxy: Option<String>) -> Self {
        self.tor_socks = proxy.filter(|p| !p.is_empty());
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send an event and wait for the relay's `OK`.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let link = self.link().await?;
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = lock(&link.shared);
            if let Some(reason) = &shared.dead {
                return Err(Error::transport(format!("{}: {reason}", self.url)));
            }
            shared.acks.insert(event.id.clone(), tx);
        }
        debug!(relay = %self.url, id = %event.id, kind = event.kind, "publish");
        if let Err(e) = send_frame(&link.sink, ClientMessage::Event(event).to_json()).await {
            lock(&link.shared).acks.remove(&event.id);
            return Err(e);
        }
        match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => {
                if lock(&link.shared).dead.is_some() {
                    Err(Error::transport(format!("{}: {reason}", self.url)))
                } else {
                    Err(Error::protocol(format!("{} rejected event: {reason}", self.url)))
                }
            }
            Ok(Err(_)) => Err(Error::transport(format!("{}: relay disposed", self.url))),
            Err(_) => {
                lock(&link.shared).acks.remove(&event.id);
                Err(Error::Timeout(self.publish_timeout))
            }
        }
    }

    /// Open a subscription with a fresh random id.
    ///
    /// A one-shot subscription receives [`RelayEvent::EndOfStored`] once the
    /// relay has sent every stored match and is closed right after.
    pub async fn subscribe(&self, filter: Filter, one_shot: bool) -> Result<Subscription> {
        let link = self.link().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = random_id();
        {
            let mut shared = lock(&link.shared);
            if let Some(reason) = &shared.dead {
                return Err(Error::transport(format!("{}: {reason}", self.url)));
            }
            shared.subs.insert(
                id.clone(),
                SubSlot {
                    filter: filter.clone(),
                    tx,
                    one_shot,
                },
            );
        }
        debug!(relay = %self.url, sub = %id, one_shot, "subscribe");
        let frame = ClientMessage::Req {
            sub_id: &id,
            filter: &filter,
        }
        .to_json();
        if let Err(e) = send_frame(&link.sink, frame).await {
            lock(&link.shared).subs.remove(&id);
            return Err(e);
        }
        Ok(Subscription { id, events: rx })
    }

    /// Close a subscription. Unknown or already closed ids are ignored.
    pub async fn close(&self, sub_id: &str) {
        let link = match &*lock(&self.state) {
            LinkState::Open(link) => link.clone(),
            _ => return,
        };
        let removed = lock(&link.shared).subs.remove(sub_id).is_some();
        if removed {
            debug!(relay = %self.url, sub = %sub_id, "close");
            if let Err(e) = send_frame(&link.sink, ClientMessage::Close(sub_id).to_json()).await {
                debug!(relay = %self.url, "close frame not sent: {e}");
            }
        }
    }

    /// Drop the socket and every subscription. Safe to call repeatedly.
    pub fn dispose(&self) {
        let prev = std::mem::replace(
            &mut *lock(&self.state),
            LinkState::Closed("disposed".into()),
        );
        if let LinkState::Open(link) = prev {
            debug!(relay = %self.url, "dispose");
            link.reader.abort();
            let mut shared = lock(&link.shared);
            shared.dead = Some("disposed".into());
            shared.subs.clear();
            shared.acks.clear();
        }
    }

    /// Return the open link, connecting on first use.
    async fn link(&self) -> Result<Link> {
        if let Some(link) = self.current()? {
            return Ok(link);
        }
        let _guard = self.connecting.lock().await;
        if let Some(link) = self.current()? {
            return Ok(link);
        }
        match connect_ws(&self.url, self.tor_socks.as_deref()).await {
            Ok(ws) => {
                let (sink, stream) = ws.split();
                let sink = Arc::new(tokio::sync::Mutex::new(sink));
                let shared = Arc::new(Mutex::new(Shared::default()));
                let task = tokio::spawn(read_loop(
                    self.url.clone(),
                    stream,
                    sink.clone(),
                    shared.clone(),
                ));
                let link = Link {
                    sink,
                    shared,
                    reader: task.abort_handle(),
                };
                let mut state = lock(&self.state);
                if let LinkState::Closed(reason) = &*state {
                    // Disposed while connecting.
                    link.reader.abort();
                    return Err(Error::transport(format!("{}: {reason}", self.url)));
                }
                *state = LinkState::Open(link.clone());
                debug!(relay = %self.url, "connected");
                Ok(link)
            }
            Err(e) => {
                *lock(&self.state) = LinkState::Closed(e.to_string());
                Err(e)
            }
        }
    }

    fn current(&self) -> Result<Option<Link>> {
        match &*lock(&self.state) {
            LinkState::Idle => Ok(None),
            LinkState::Open(link) => match &lock(&link.shared).dead {
                Some(reason) => Err(Error::transport(format!("{}: {reason}", self.url))),
                None => Ok(Some(link.clone())),
            },
            LinkState::Closed(reason) => {
                Err(Error::transport(format!("{}: {reason}", self.url)))
            }
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Read frames until the socket ends, routing them to subscriptions and acks.
async fn read_loop(
    url: String,
    mut stream: SplitStream<WsStream>,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    shared: Arc<Mutex<Shared>>,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(txt))) => {
                let Some(msg) = RelayMessage::parse(&txt) else {
                    debug!(relay = %url, "ignoring frame: {txt}");
                    continue;
                };
                if let Some(sub_id) = dispatch(&url, msg, &shared) {
                    let frame = ClientMessage::Close(&sub_id).to_json();
                    if let Err(e) = send_frame(&sink, frame).await {
                        debug!(relay = %url, "close frame not sent: {e}");
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break "closed by relay".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
        }
    };
    debug!(relay = %url, "link down: {reason}");
    lock(&shared).fail_all(&reason);
}

/// Route one relay frame. Returns a subscription id that must now be closed.
fn dispatch(url: &str, msg: RelayMessage, shared: &Mutex<Shared>) -> Option<String> {
    let mut shared = lock(shared);
    match msg {
        RelayMessage::Event { sub_id, event } => {
            match shared.subs.get(&sub_id) {
                Some(slot) if slot.filter.matches(&event) => {
                    let _ = slot.tx.send(RelayEvent::Event(event));
                }
                Some(_) => debug!(relay = %url, sub = %sub_id, id = %event.id, "event outside filter"),
                None => {}
            }
            None
        }
        RelayMessage::Eose(sub_id) => {
            if shared.subs.get(&sub_id).is_some_and(|s| s.one_shot) {
                if let Some(slot) = shared.subs.remove(&sub_id) {
                    let _ = slot.tx.send(RelayEvent::EndOfStored);
                }
                return Some(sub_id);
            }
            None
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(ack) = shared.acks.remove(&event_id) {
                let _ = ack.send(if accepted { Ok(()) } else { Err(message) });
            }
            None
        }
        RelayMessage::Closed { sub_id, message } => {
            if let Some(slot) = shared.subs.remove(&sub_id) {
                warn!(relay = %url, sub = %sub_id, "subscription closed by relay: {message}");
                let _ = slot.tx.send(RelayEvent::Closed(message));
            }
            None
        }
        RelayMessage::Notice(notice) => {
            warn!(relay = %url, "notice: {notice}");
            None
        }
    }
}

async fn send_frame(sink: &tokio::sync::Mutex<WsSink>, frame: String) -> Result<()> {
    sink.lock().await.send(Message::Text(frame)).await?;
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Random 6-byte hex id for subscriptions and requests.
pub(crate) fn random_id() -> String {
    hex::encode(rand::random::<[u8; 6]>())
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay).map_err(|e| Error::transport(format!("{relay}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::transport(format!("{relay}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::transport(format!("{relay}: missing port")))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::transport(format!("{relay} via {proxy}: {e}")))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::transport(format!("{relay}: {e}")))?,
        )
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
