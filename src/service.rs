//! RPC client for attested key-storage services.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::info;

use crate::{
    envelope::Envelope,
    error::{Error, Result},
    keys::Keys,
    kinds::KIND_KEYCRUX_RPC,
    relay::Relay,
    rpc::RpcClient,
};

/// Talks to one service over a throwaway client key.
pub struct ServiceClient {
    rpc: RpcClient,
}

impl ServiceClient {
    pub fn new(relay: Relay, service_pubkey: impl Into<String>, envelope: Arc<dyn Envelope>) -> Self {
        Self {
            rpc: RpcClient::new(
                relay,
                KIND_KEYCRUX_RPC,
                Keys::generate(),
                service_pubkey,
                envelope,
            ),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.rpc = self.rpc.with_timeout(timeout);
        self
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub async fn start(&self) -> Result<()> {
        self.rpc.subscribe().await
    }

    /// Round trip a `ping`. Returns the measured latency.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let reply = self.rpc.send("ping", vec![]).await?;
        if reply != "pong" {
            return Err(Error::protocol(format!("unexpected ping reply: {reply}")));
        }
        let elapsed = started.elapsed();
        info!(service = %self.rpc.peer(), ?elapsed, "pong");
        Ok(elapsed)
    }
}
