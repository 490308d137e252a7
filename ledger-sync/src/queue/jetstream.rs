//! NATS JetStream transport for transaction events
//!
//! One work-queue stream holds inbound events; a single durable pull
//! consumer with explicit acks feeds the ingestion worker. Messages that are
//! never acked are redelivered after `ack_wait`.

use super::{Delivery, EventPublisher};
use crate::config::QueueConfig;
use crate::error::{Result, SyncError};
use crate::models::TransactionEvent;
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context as JetStreamContext,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct JetStreamQueue {
    context: JetStreamContext,
    config: QueueConfig,
}

impl JetStreamQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        info!("Connecting to NATS JetStream at {}", config.url);

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| SyncError::Nats(format!("Failed to connect: {}", e)))?;

        let queue = Self {
            context: jetstream::new(client),
            config: config.clone(),
        };
        queue.ensure_stream().await?;

        Ok(queue)
    }

    async fn ensure_stream(&self) -> Result<()> {
        let stream_config = StreamConfig {
            name: self.config.stream.clone(),
            description: Some("Inbound ledger transaction events".to_string()),
            subjects: vec![self.config.subject.clone()],
            retention: RetentionPolicy::WorkQueue,
            storage: StorageType::File,
            duplicate_window: Duration::from_secs(self.config.duplicate_window_secs),
            ..Default::default()
        };

        match self.context.get_or_create_stream(stream_config).await {
            Ok(_) => {
                info!("Stream {} ready", self.config.stream);
                Ok(())
            }
            Err(e) => {
                error!("Failed to create stream {}: {}", self.config.stream, e);
                Err(SyncError::Nats(e.to_string()))
            }
        }
    }

    /// Durable consumer plus the stream's creation time in nanoseconds, which
    /// changes whenever the stream is deleted and recreated
    async fn consumer(&self) -> Result<(PullConsumer, i128)> {
        let stream = self
            .context
            .get_stream(&self.config.stream)
            .await
            .map_err(|e| SyncError::Nats(e.to_string()))?;

        let consumer_config = pull::Config {
            durable_name: Some(self.config.consumer.clone()),
            description: Some("Ledger ingestion worker".to_string()),
            filter_subject: self.config.subject.clone(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(self.config.ack_wait_secs),
            max_deliver: self.config.max_deliver,
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&self.config.consumer, consumer_config)
            .await
            .map_err(|e| SyncError::Nats(e.to_string()))?;

        let epoch = stream.cached_info().created.unix_timestamp_nanos();

        info!("Consumer {} ready", self.config.consumer);
        Ok((consumer, epoch))
    }

    /// Pull deliveries from the durable consumer, one message per item
    pub async fn deliveries(&self) -> Result<impl Stream<Item = Result<JetStreamDelivery>>> {
        let (consumer, epoch) = self.consumer().await?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| SyncError::Nats(e.to_string()))?;

        Ok(messages.map(move |message| {
            message
                .map(|message| JetStreamDelivery::new(message, epoch))
                .map_err(|e| SyncError::Nats(e.to_string()))
        }))
    }
}

#[async_trait]
impl EventPublisher for JetStreamQueue {
    async fn publish(&self, event: &TransactionEvent) -> Result<()> {
        let payload = event.to_vec()?;

        let mut headers = async_nats::HeaderMap::new();
        if let Some(event_id) = event.event_id {
            headers.insert("Nats-Msg-Id", event_id.to_string().as_str());
        }

        let ack = self
            .context
            .publish_with_headers(self.config.subject.clone(), headers, payload.into())
            .await?
            .await?;

        debug!(
            provider_id = event.id,
            value = %event.value,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Published transaction event"
        );
        Ok(())
    }
}

pub struct JetStreamDelivery {
    message: jetstream::Message,
    key: Option<String>,
}

impl JetStreamDelivery {
    fn new(message: jetstream::Message, stream_epoch: i128) -> Self {
        let key = message
            .info()
            .ok()
            .map(|info| delivery_key(info.stream, stream_epoch, info.stream_sequence));

        Self { message, key }
    }
}

/// Stable across redeliveries of one message; sequences restart when a
/// stream is recreated, so the stream's creation time is part of the key
fn delivery_key(stream: &str, stream_epoch: i128, sequence: u64) -> String {
    format!("{}:{}:{}", stream, stream_epoch, sequence)
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_key(&self) -> Option<String> {
        self.key.clone()
    }

    async fn ack(&self) -> Result<()> {
        self.message.ack().await?;
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.message.ack_with(AckKind::Term).await?;
        Ok(())
    }
}
