mod client;
mod server;

pub use client::RpcClient;
pub use server::RpcServer;

use std::time::Duration;

use async_trait::async_trait;

use crate::message::{MountRequest, MountResponse};

/// Inbound queue name for a node's agent.
pub fn node_queue(node_id: &str) -> String {
    format!("dms.{node_id}")
}

/// Server-side request handler. Implemented by the agent dispatcher;
/// must be idempotent, the broker redelivers unacknowledged requests.
#[async_trait]
pub trait MountHandler: Send + Sync {
    async fn handle(&self, request: MountRequest) -> MountResponse;
}

/// Client-side seam for issuing a mount RPC. The coordinator depends on
/// this trait rather than on the broker client, so protocol tests can
/// substitute an in-memory transport.
#[async_trait]
pub trait MountTransport: Send + Sync {
    async fn call(&self, request: &MountRequest) -> Result<MountResponse, RpcError>;
}

#[async_trait]
impl<T: MountTransport + ?Sized> MountTransport for std::sync::Arc<T> {
    async fn call(&self, request: &MountRequest) -> Result<MountResponse, RpcError> {
        (**self).call(request).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    #[error("reply channel closed before a reply arrived")]
    ReplyDropped,

    #[error("failed to encode request: {0}")]
    BadRequest(#[source] serde_json::Error),

    #[error("malformed reply payload: {0}")]
    BadReply(#[source] serde_json::Error),
}
