//! Configuration loading from `.env` files.

use std::{env, path::Path, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};

use crate::{
    credentials::FileCredentialStore,
    envelope::Envelope,
    fanout::FanoutQuery,
    nip46::{ConnectParams, RemoteSigner},
};

pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://relay.primal.net",
    "wss://nostr.mom",
    "wss://relay.enclaved.org",
];
pub const DEFAULT_SEARCH_RELAY: &str = "wss://relay.nostr.band/all";
pub const DEFAULT_SIGNER_RELAY: &str = "wss://relay.nsec.app";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relays used for fetching and publishing records.
    pub relays: Vec<String>,
    /// Relay with full-text search support.
    pub search_relay: String,
    /// Relay used to reach the remote signer when pairing interactively.
    pub signer_relay: String,
    /// Where the remote signing session is persisted.
    pub credentials_file: PathBuf,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Permissions requested from the remote signer.
    pub perms: String,
    pub rpc_timeout: Duration,
    pub fetch_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Settings {
    /// Load settings from the specified `.env` file, if it exists, on top of
    /// the process environment.
    pub fn from_env(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path).context("reading env file")?;
        }
        let relays = match env::var("RELAYS") {
            Ok(s) if !s.trim().is_empty() => csv_strings(s),
            _ => DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
        };
        let search_relay = non_empty("SEARCH_RELAY").unwrap_or_else(|| DEFAULT_SEARCH_RELAY.into());
        let signer_relay = non_empty("SIGNER_RELAY").unwrap_or_else(|| DEFAULT_SIGNER_RELAY.into());
        let credentials_file = match non_empty("CREDENTIALS_FILE") {
            Some(p) => PathBuf::from(p),
            None => {
                let home = env::var("HOME").context("HOME not set and CREDENTIALS_FILE missing")?;
                PathBuf::from(home).join(".encli.json")
            }
        };
        let tor_socks = non_empty("TOR_SOCKS");
        let perms = env::var("PERMS").unwrap_or_default();
        Ok(Self {
            relays,
            search_relay,
            signer_relay,
            credentials_file,
            tor_socks,
            perms,
            rpc_timeout: secs("RPC_TIMEOUT_SECS", 30)?,
            fetch_timeout: secs("FETCH_TIMEOUT_SECS", 10)?,
            publish_timeout: secs("PUBLISH_TIMEOUT_SECS", 10)?,
        })
    }

    /// Multi-relay query using the configured timeouts and proxy.
    pub fn fanout_query(&self) -> FanoutQuery {
        FanoutQuery::new(self.fetch_timeout)
            .with_publish_timeout(self.publish_timeout)
            .with_tor_socks(self.tor_socks.clone())
    }

    /// Relays searched for service announcements.
    pub fn discovery_relays(&self) -> Vec<String> {
        vec![self.search_relay.clone()]
    }

    /// Remote signer persisting its session to `credentials_file`.
    pub fn remote_signer(&self, envelope: Arc<dyn Envelope>) -> RemoteSigner {
        let store = Arc::new(FileCredentialStore::new(self.credentials_file.clone()));
        RemoteSigner::new(envelope, store)
            .with_tor_socks(self.tor_socks.clone())
            .with_timeout(self.rpc_timeout)
    }

    /// Login parameters requesting `perms`: direct when a `bunker://` URI is
    /// given, otherwise interactive through `signer_relay`.
    pub fn connect_params(&self, bunker: Option<&str>) -> crate::Result<ConnectParams> {
        match bunker {
            Some(uri) => ConnectParams::from_bunker_uri(uri, self.perms.clone()),
            None => Ok(ConnectParams::interactive(
                self.signer_relay.clone(),
                self.perms.clone(),
            )),
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    match non_empty(name) {
        Some(v) => {
            let n: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a whole number of seconds, got {v:?}"))?;
            Ok(Duration::from_secs(n))
        }
        None => Ok(Duration::from_secs(default)),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
