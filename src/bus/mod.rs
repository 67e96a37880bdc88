//! Message bus abstractions.
//!
//! At-least-once work queue between the dispatcher and workers:
//! - `publish` hands a [`JobMessage`] to the bus and returns its message id
//! - `subscribe` opens a stream of [`Delivery`]s capped by [`FlowControl`]
//! - every delivery ends with `ack` (done) or `nack` (redeliver); a delivery
//!   dropped without either is redelivered as well

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::JobMessage;

pub use memory::{BusStats, MemoryBus};

/// Subscription flow control.
#[derive(Debug, Clone, Copy)]
pub struct FlowControl {
    /// Deliveries handed out but not yet acked or nacked
    pub max_messages: usize,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self { max_messages: 1 }
    }
}

/// Settles a single delivery.
#[async_trait]
pub trait AckHandle: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>) -> Result<()>;
}

/// One received message.
pub struct Delivery {
    pub id: String,
    /// 1 on first delivery, incremented on each redelivery
    pub attempt: u32,
    pub data: Vec<u8>,
    handle: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(id: String, attempt: u32, data: Vec<u8>, handle: Box<dyn AckHandle>) -> Self {
        Self {
            id,
            attempt,
            data,
            handle,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.handle.ack().await
    }

    pub async fn nack(self) -> Result<()> {
        self.handle.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Stream of deliveries for one subscriber.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery; `None` once the bus is closed and drained.
    async fn next(&mut self) -> Option<Delivery>;
}

/// At-least-once message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: &JobMessage) -> Result<String>;

    async fn subscribe(&self, flow: FlowControl) -> Result<Box<dyn Subscription>>;
}
