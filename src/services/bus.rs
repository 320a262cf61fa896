//! AMQP message bus: process-asset jobs and dead-letter entries.
//!
//! Queues are declared durable and every payload rides as persistent JSON.
//! The publisher connects lazily and retries exactly once on a transport
//! failure, rebuilding the connection in between; further failures
//! propagate to the caller.

use chrono::{DateTime, Utc};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RabbitConfig;
use crate::error::{AppError, Result};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT_DELIVERY: u8 = 2;

/// Work-queue payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMessage {
    pub asset_id: i64,
    /// Present only for asynchronously enqueued local uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_file_path: Option<String>,
}

/// Dead-letter payload for deliveries that exhausted their retry budget.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub asset_id: i64,
    pub error: String,
    pub attempts: i32,
    pub failed_at: DateTime<Utc>,
}

pub struct Publisher {
    uri: String,
    queue: String,
    dlq: Option<String>,
    channel: Mutex<Option<Channel>>,
}

impl Publisher {
    pub fn new(config: &RabbitConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            queue: config.queue.clone(),
            dlq: config.dlq.clone(),
            channel: Mutex::new(None),
        }
    }

    pub async fn publish_process(&self, message: &ProcessMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish_raw(&self.queue, &payload).await
    }

    pub async fn publish_dead_letter(&self, message: &DeadLetterMessage) -> Result<()> {
        let dlq = self
            .dlq
            .clone()
            .ok_or_else(|| AppError::BusUnavailable("no dead-letter queue configured".to_string()))?;
        let payload = serde_json::to_vec(message)?;
        self.publish_raw(&dlq, &payload).await
    }

    async fn publish_raw(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut guard = self.channel.lock().await;
        let channel = match guard.as_ref() {
            Some(channel) => channel.clone(),
            None => {
                let channel = self.open_channel().await?;
                *guard = Some(channel.clone());
                channel
            }
        };

        match Self::send(&channel, queue, payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "publish failed, reconnecting for one retry");
                let fresh = self.open_channel().await?;
                *guard = Some(fresh.clone());
                Self::send(&fresh, queue, payload).await
            }
        }
    }

    async fn send(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT_DELIVERY)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn open_channel(&self) -> Result<Channel> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        declare_queues(&channel, &self.queue, self.dlq.as_deref()).await?;
        Ok(channel)
    }
}

async fn declare_queues(channel: &Channel, queue: &str, dlq: Option<&str>) -> Result<()> {
    let options = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };
    channel
        .queue_declare(queue, options, FieldTable::default())
        .await?;
    if let Some(dlq) = dlq {
        channel
            .queue_declare(dlq, options, FieldTable::default())
            .await?;
    }
    Ok(())
}

/// Consumer with manual acknowledgement and the configured prefetch. The
/// connection is handed back so the caller keeps it alive for the stream's
/// lifetime.
pub async fn create_consumer(config: &RabbitConfig) -> Result<(Connection, Consumer)> {
    let connection =
        Connection::connect(&config.amqp_uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    declare_queues(&channel, &config.queue, config.dlq.as_deref()).await?;
    channel
        .basic_qos(config.prefetch, BasicQosOptions::default())
        .await?;

    let tag = format!("media-worker-{}", Uuid::new_v4().simple());
    let consumer = channel
        .basic_consume(
            &config.queue,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(
        queue = %config.queue,
        prefetch = config.prefetch,
        "bus consumer initialized"
    );
    Ok((connection, consumer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_payload_omits_absent_temp_path() {
        let message = ProcessMessage {
            asset_id: 7,
            temp_file_path: None,
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"assetId":7}"#
        );
    }

    #[test]
    fn process_payload_round_trips_with_temp_path() {
        let message = ProcessMessage {
            asset_id: 42,
            temp_file_path: Some("/spool/2026/08/02/x_y_z.jpg".to_string()),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""tempFilePath""#));
        let parsed: ProcessMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn dead_letter_payload_carries_rfc3339_timestamp() {
        let message = DeadLetterMessage {
            asset_id: 9,
            error: "download failed".to_string(),
            attempts: 3,
            failed_at: Utc::now(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""assetId":9"#));
        assert!(json.contains(r#""failedAt""#));
        let parsed: DeadLetterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.attempts, 3);
    }
}
