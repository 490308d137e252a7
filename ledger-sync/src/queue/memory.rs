use super::{Delivery, EventPublisher};
use crate::error::{Result, SyncError};
use crate::models::TransactionEvent;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Acknowledgement state of an in-memory delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Rejected,
}

/// Delivery held in process memory, recording how it was settled
#[derive(Debug)]
pub struct MemoryDelivery {
    payload: Vec<u8>,
    key: Option<String>,
    state: Mutex<AckState>,
}

impl MemoryDelivery {
    pub fn new(payload: impl Into<Vec<u8>>, key: Option<&str>) -> Self {
        Self {
            payload: payload.into(),
            key: key.map(str::to_string),
            state: Mutex::new(AckState::Pending),
        }
    }

    pub fn from_event(event: &TransactionEvent, key: &str) -> Result<Self> {
        Ok(Self::new(event.to_vec()?, Some(key)))
    }

    pub fn state(&self) -> AckState {
        *self.state.lock()
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivery_key(&self) -> Option<String> {
        self.key.clone()
    }

    async fn ack(&self) -> Result<()> {
        *self.state.lock() = AckState::Acked;
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        *self.state.lock() = AckState::Rejected;
        Ok(())
    }
}

/// Publisher that keeps every event, with injectable transient failures
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<TransactionEvent>>,
    failures_remaining: Mutex<u32>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures_remaining.lock() = count;
    }

    pub fn published(&self) -> Vec<TransactionEvent> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &TransactionEvent) -> Result<()> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Nats("injected publish failure".to_string()));
            }
        }

        self.published.lock().push(event.clone());
        Ok(())
    }
}
