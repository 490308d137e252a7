pub mod jetstream;
pub mod memory;

use crate::error::Result;
use crate::models::TransactionEvent;
use async_trait::async_trait;

pub use self::jetstream::{JetStreamDelivery, JetStreamQueue};
pub use self::memory::{AckState, MemoryDelivery, RecordingPublisher};

/// One at-least-once delivery from the inbound queue
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Broker-assigned key, stable across redeliveries of the same message
    fn delivery_key(&self) -> Option<String>;

    /// Confirm processing; the broker will not redeliver
    async fn ack(&self) -> Result<()>;

    /// Drop a message that can never be processed
    async fn reject(&self) -> Result<()> {
        self.ack().await
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &TransactionEvent) -> Result<()>;
}
