use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::message::{MountRequest, MountResponse};

use super::{node_queue, MountTransport, RpcError};

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>>;

/// Broker RPC client. Owns a private server-named reply queue and a
/// correlation table mapping correlation id to a reply slot; one client
/// instance may be shared by any number of concurrent callers.
pub struct RpcClient {
    channel: Channel,
    reply_queue: String,
    pending: PendingReplies,
    timeout: Duration,
    _connection: Connection,
}

impl RpcClient {
    /// Connect to the broker and start the reply consumer.
    pub async fn connect(broker_url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let connection =
            Connection::connect(broker_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        // Exclusive auto-delete queue; the broker picks the name and tears
        // the queue down when this client goes away.
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue = queue.name().as_str().to_string();

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        let consumer = channel
            .basic_consume(
                &reply_queue,
                "dms-reply",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let router = pending.clone();
        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        tracing::warn!("reply consumer error: {}", e);
                        break;
                    }
                };

                let correlation_id = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string());

                let Some(correlation_id) = correlation_id else {
                    tracing::warn!("dropping reply without a correlation id");
                    continue;
                };

                match router.lock().await.remove(&correlation_id) {
                    Some(slot) => {
                        // Receiver may have timed out already; nothing to do.
                        let _ = slot.send(delivery.data);
                    }
                    None => {
                        tracing::debug!(
                            correlation_id = %correlation_id,
                            "dropping reply with no waiting caller"
                        );
                    }
                }
            }
            tracing::debug!("reply consumer stopped");
        });

        Ok(Self {
            channel,
            reply_queue,
            pending,
            timeout,
            _connection: connection,
        })
    }

    /// Publish a request to the node queue for `request.host` and block on
    /// the reply slot until the matching correlation id arrives or the
    /// timeout elapses. On timeout the request may still be in flight; the
    /// caller compensates via idempotent retries.
    pub async fn call(&self, request: &MountRequest) -> Result<MountResponse, RpcError> {
        let payload = serde_json::to_vec(request).map_err(RpcError::BadRequest)?;
        let correlation_id = Uuid::new_v4().to_string();
        let routing_key = node_queue(&request.host);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(correlation_id.clone(), tx);

        tracing::debug!(
            correlation_id = %correlation_id,
            queue = %routing_key,
            job_id = request.job.id,
            target_id = %request.backup_target.id,
            action = %request.action,
            "publishing mount rpc"
        );

        let publish = self
            .channel
            .basic_publish(
                "",
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_correlation_id(correlation_id.as_str().into())
                    .with_reply_to(self.reply_queue.as_str().into()),
            )
            .await;

        if let Err(e) = publish {
            self.pending.lock().await.remove(&correlation_id);
            return Err(RpcError::Broker(e));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(data)) => serde_json::from_slice(&data).map_err(RpcError::BadReply),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(RpcError::ReplyDropped)
            }
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(RpcError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl MountTransport for RpcClient {
    async fn call(&self, request: &MountRequest) -> Result<MountResponse, RpcError> {
        RpcClient::call(self, request).await
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_queue", &self.reply_queue)
            .field("timeout", &self.timeout)
            .finish()
    }
}
