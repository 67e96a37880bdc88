//! In-process message bus.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::bus::{AckHandle, Delivery, FlowControl, MessageBus, Subscription};
use crate::error::{AppError, Result};
use crate::models::JobMessage;

#[derive(Debug, Clone)]
struct Envelope {
    id: u64,
    attempt: u32,
    data: Vec<u8>,
}

/// Counters for a [`MemoryBus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
    pub pending: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Envelope>,
    dead_letters: Vec<Envelope>,
    next_id: u64,
    closed: bool,
    stats: BusStats,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
    max_deliveries: Option<u32>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, envelope: Envelope, redeliver: bool) {
        let mut state = self.lock();
        state.stats.in_flight = state.stats.in_flight.saturating_sub(1);

        if !redeliver {
            state.stats.acked += 1;
        } else {
            state.stats.nacked += 1;
            match self.max_deliveries {
                Some(max) if envelope.attempt >= max => {
                    tracing::warn!(
                        message_id = envelope.id,
                        attempts = envelope.attempt,
                        "Message dead-lettered"
                    );
                    state.stats.dead_lettered += 1;
                    state.dead_letters.push(envelope);
                }
                _ => state.queue.push_back(Envelope {
                    attempt: envelope.attempt + 1,
                    ..envelope
                }),
            }
        }
        state.stats.pending = state.queue.len();
        drop(state);
        self.changed.notify_waiters();
    }
}

/// Queue shared by publishers and subscribers in one process.
///
/// Nacked or dropped deliveries go back to the tail of the queue. With
/// `max_deliveries` set, a message nacked that many times is moved to the
/// dead-letter list instead.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self::build(Some(max_deliveries.max(1)))
    }

    fn build(max_deliveries: Option<u32>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                max_deliveries,
            }),
        }
    }

    /// Stop accepting messages; subscribers end once the queue drains.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.changed.notify_waiters();
    }

    pub fn stats(&self) -> BusStats {
        self.shared.lock().stats
    }

    /// Payloads that exhausted their deliveries.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .dead_letters
            .iter()
            .map(|e| e.data.clone())
            .collect()
    }

    /// Wait until nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let state = self.shared.lock();
                if state.queue.is_empty() && state.stats.in_flight == 0 {
                    return;
                }
            }
            changed.await;
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, message: &JobMessage) -> Result<String> {
        let data = message.to_bytes()?;
        let id = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(AppError::publish("bus is closed"));
            }
            state.next_id += 1;
            let id = state.next_id;
            state.queue.push_back(Envelope {
                id,
                attempt: 1,
                data,
            });
            state.stats.published += 1;
            state.stats.pending = state.queue.len();
            id
        };
        self.shared.changed.notify_waiters();
        Ok(id.to_string())
    }

    async fn subscribe(&self, flow: FlowControl) -> Result<Box<dyn Subscription>> {
        if flow.max_messages == 0 {
            return Err(AppError::bus("flow control must allow at least one message"));
        }
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            permits: Arc::new(Semaphore::new(flow.max_messages)),
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;

        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(envelope) = state.queue.pop_front() {
                    state.stats.in_flight += 1;
                    state.stats.delivered += 1;
                    state.stats.pending = state.queue.len();
                    let handle = MemoryAck {
                        shared: Arc::clone(&self.shared),
                        envelope: Some(envelope.clone()),
                        _permit: permit,
                    };
                    return Some(Delivery::new(
                        envelope.id.to_string(),
                        envelope.attempt,
                        envelope.data,
                        Box::new(handle),
                    ));
                }
                if state.closed && state.stats.in_flight == 0 {
                    return None;
                }
            }
            changed.await;
        }
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    envelope: Option<Envelope>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        if let Some(envelope) = self.envelope.take() {
            self.shared.settle(envelope, false);
        }
        Ok(())
    }

    async fn nack(mut self: Box<Self>) -> Result<()> {
        if let Some(envelope) = self.envelope.take() {
            self.shared.settle(envelope, true);
        }
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            self.shared.settle(envelope, true);
        }
    }
}
