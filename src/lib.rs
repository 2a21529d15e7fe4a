//! Relay client core for Nostr: relay connections, multi-relay queries, an
//! encrypted request/reply channel and NIP-46 remote signing on top of it.

pub mod config;
pub mod credentials;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod event;
pub mod fanout;
pub mod filter;
pub mod keys;
pub mod kinds;
pub mod message;
pub mod nip46;
pub mod relay;
pub mod rpc;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use envelope::Envelope;
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, Tag, UnsignedEvent};
pub use fanout::FanoutQuery;
pub use filter::Filter;
pub use keys::Keys;
pub use nip46::{Bootstrap, ConnectParams, RemoteSigner};
pub use relay::{Relay, RelayEvent, Subscription};
pub use rpc::RpcClient;
pub use service::ServiceClient;
