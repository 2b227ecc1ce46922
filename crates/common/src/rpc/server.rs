use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;

use crate::message::{MountRequest, MountResponse};

use super::{node_queue, MountHandler, RpcError};

/// Broker RPC server for one node. Declares the durable per-node queue and
/// processes one request at a time (prefetch=1), so a slow mount
/// backpressures subsequent mounts on this node.
pub struct RpcServer {
    channel: Channel,
    queue: String,
    node_id: String,
    _connection: Connection,
}

impl RpcServer {
    pub async fn bind(broker_url: &str, node_id: &str) -> Result<Self, RpcError> {
        let connection =
            Connection::connect(broker_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let queue = node_queue(node_id);
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = %queue, "bound node rpc queue");

        Ok(Self {
            channel,
            queue,
            node_id: node_id.to_string(),
            _connection: connection,
        })
    }

    /// Consume requests until the shutdown signal fires. The in-flight
    /// request is always finished and acked before returning.
    pub async fn serve(
        &self,
        handler: Arc<dyn MountHandler>,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<(), RpcError> {
        let consumer_tag = format!("dms-agent-{}", self.node_id);
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!(queue = %self.queue, "rpc server shutting down");
                    return Ok(());
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.process(handler.as_ref(), delivery).await?;
                        }
                        Some(Err(e)) => {
                            tracing::error!("consume error on {}: {}", self.queue, e);
                            return Err(RpcError::Broker(e));
                        }
                        None => {
                            tracing::warn!(queue = %self.queue, "consumer stream ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn process(
        &self,
        handler: &dyn MountHandler,
        delivery: Delivery,
    ) -> Result<(), RpcError> {
        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|q| q.as_str().to_string());
        let correlation_id = delivery.properties.correlation_id().clone();

        let response = match serde_json::from_slice::<MountRequest>(&delivery.data) {
            Ok(request) => {
                tracing::debug!(
                    job_id = request.job.id,
                    target_id = %request.backup_target.id,
                    action = %request.action,
                    "handling mount rpc"
                );
                handler.handle(request).await
            }
            Err(e) => {
                tracing::warn!("rejecting malformed request payload: {}", e);
                if reply_to.is_none() {
                    // Nowhere to report the error; drop without requeue.
                    delivery
                        .reject(BasicRejectOptions { requeue: false })
                        .await?;
                    return Ok(());
                }
                MountResponse::error(format!("malformed request: {e}"))
            }
        };

        if let Some(reply_to) = reply_to {
            let payload = serde_json::to_vec(&response).map_err(RpcError::BadRequest)?;
            let mut properties =
                BasicProperties::default().with_content_type("application/json".into());
            if let Some(correlation_id) = correlation_id {
                properties = properties.with_correlation_id(correlation_id);
            }

            self.channel
                .basic_publish(
                    "",
                    &reply_to,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await?
                .await?;
        } else {
            tracing::warn!(queue = %self.queue, "request carried no reply_to; reply dropped");
        }

        // Ack only after the reply is published: a crash in between causes
        // redelivery, which the handler absorbs idempotently.
        delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("queue", &self.queue)
            .field("node_id", &self.node_id)
            .finish()
    }
}
