//! Same filter or record sent to several relays at once.

use std::{collections::HashSet, time::Duration};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    relay::{Relay, RelayEvent, DEFAULT_PUBLISH_TIMEOUT},
};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one-off multi-relay reads and writes.
#[derive(Debug, Clone)]
pub struct FanoutQuery {
    pub timeout: Duration,
    pub publish_timeout: Duration,
    pub tor_socks: Option<String>,
}

impl Default for FanoutQuery {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            tor_socks: None,
        }
    }
}

impl FanoutQuery {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_tor_socks(mut self, proxy: Option<String>) -> Self {
        self.tor_socks = proxy;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Collect stored records matching `filter` from every relay.
    ///
    /// A relay that fails or runs past the timeout contributes nothing. The
    /// call only fails when every relay does. Records are deduplicated by id,
    /// keeping the first copy seen in relay order.
    pub async fn fetch<S: AsRef<str>>(&self, filter: &Filter, relays: &[S]) -> Result<Vec<Event>> {
        if relays.is_empty() {
            return Ok(Vec::new());
        }
        let results = join_all(relays.iter().map(|url| self.fetch_one(filter, url.as_ref()))).await;

        let mut failures = Vec::new();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (url, result) in relays.iter().zip(results) {
            match result {
                Ok(events) => {
                    debug!(relay = url.as_ref(), count = events.len(), "fetched");
                    out.extend(events.into_iter().filter(|ev| seen.insert(ev.id.clone())));
                }
                Err(e) => {
                    warn!(relay = url.as_ref(), "fetch failed: {e}");
                    failures.push(format!("{}: {e}", url.as_ref()));
                }
            }
        }
        if failures.len() == relays.len() {
            return Err(Error::transport(format!(
                "all relays failed: {}",
                failures.join("; ")
            )));
        }
        Ok(out)
    }

    async fn fetch_one(&self, filter: &Filter, url: &str) -> Result<Vec<Event>> {
        let relay = Relay::new(url).with_tor_socks(self.tor_socks.clone());
        let collect = async {
            let mut sub = relay.subscribe(filter.clone(), true).await?;
            let mut events = Vec::new();
            while let Some(item) = sub.events.recv().await {
                match item {
                    RelayEvent::Event(ev) => events.push(ev),
                    RelayEvent::EndOfStored => return Ok(events),
                    RelayEvent::Closed(reason) => return Err(Error::transport(reason)),
                }
            }
            Err(Error::transport("subscription dropped"))
        };
        let result = tokio::time::timeout(self.timeout, collect)
            .await
            .unwrap_or(Err(Error::Timeout(self.timeout)));
        relay.dispose();
        result
    }

    /// Publish `event` everywhere. Returns how many relays accepted it.
    pub async fn publish<S: AsRef<str>>(&self, event: &Event, relays: &[S]) -> Result<usize> {
        let results = join_all(relays.iter().map(|url| async move {
            let relay = Relay::new(url.as_ref())
                .with_tor_socks(self.tor_socks.clone())
                .with_publish_timeout(self.publish_timeout);
            let res = relay.publish(event).await;
            relay.dispose();
            res
        }))
        .await;

        let mut failures = Vec::new();
        let mut accepted = 0;
        for (url, result) in relays.iter().zip(results) {
            match result {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(relay = url.as_ref(), id = %event.id, "publish failed: {e}");
                    failures.push(format!("{}: {e}", url.as_ref()));
                }
            }
        }
        if accepted == 0 {
            return Err(Error::transport(format!(
                "no relay accepted {}: {}",
                event.id,
                failures.join("; ")
            )));
        }
        Ok(accepted)
    }
}
