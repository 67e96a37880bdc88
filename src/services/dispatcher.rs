// src/services/dispatcher.rs

//! Job dispatcher.
//!
//! Accumulates newly discovered URLs and flushes them on a hybrid window:
//! when `window_secs` have passed since the last flush (even while a page
//! fetch is still in flight), as soon as the discovered count reaches the
//! limit, and when discovery ends. A flush writes `NotMined` rows first and
//! publishes them second; each half keeps its own queue so a failure in one
//! never duplicates work done by the other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::error::{AppError, Result};
use crate::models::{DispatcherConfig, JobMessage, WorkItem};
use crate::services::frontier::{Frontier, FrontierPage};
use crate::services::ledger::StatusLedger;

/// Source of discovered pages.
#[async_trait]
pub trait Discovery: Send {
    async fn next_page(&mut self) -> Result<Option<FrontierPage>>;
}

#[async_trait]
impl Discovery for Frontier {
    async fn next_page(&mut self) -> Result<Option<FrontierPage>> {
        Frontier::next_page(self).await
    }
}

/// Summary of a dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub pages: usize,
    pub discovered: usize,
    pub written: usize,
    pub published: usize,
    pub flushes: usize,
}

/// Items not yet written, and written items not yet published.
#[derive(Default)]
struct Batch {
    pending: Vec<WorkItem>,
    unpublished: VecDeque<JobMessage>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.unpublished.is_empty()
    }
}

/// Why the discovery loop ended.
enum Stop {
    Exhausted,
    LimitReached,
    Shutdown,
    FetchFailed(AppError),
}

/// Writes discovered work items to the ledger and publishes them.
pub struct Dispatcher {
    ledger: StatusLedger,
    bus: Arc<dyn MessageBus>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(ledger: StatusLedger, bus: Arc<dyn MessageBus>, config: DispatcherConfig) -> Self {
        Self {
            ledger,
            bus,
            config,
        }
    }

    /// Drain `discovery` up to `limit` URLs, flushing on the configured window.
    pub async fn run(
        &self,
        discovery: &mut dyn Discovery,
        limit: usize,
        shutdown: CancellationToken,
    ) -> Result<DispatchSummary> {
        let window = Duration::from_secs(self.config.window_secs);
        let mut batch = Batch::default();
        let mut summary = DispatchSummary::default();
        let mut deadline = Instant::now() + window;

        let stop = loop {
            if summary.discovered >= limit {
                break Stop::LimitReached;
            }

            let fetched = {
                let fetch = discovery.next_page();
                tokio::pin!(fetch);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break None,
                        result = &mut fetch => break Some(result),
                        _ = sleep_until(deadline) => {
                            debug!(pending = batch.pending.len(), "Window elapsed during fetch");
                            self.flush_logged(&mut batch, &mut summary).await;
                            deadline = Instant::now() + window;
                        }
                    }
                }
            };

            let page = match fetched {
                None => break Stop::Shutdown,
                Some(Ok(Some(page))) => page,
                Some(Ok(None)) => break Stop::Exhausted,
                Some(Err(e)) => break Stop::FetchFailed(e),
            };

            summary.pages += 1;
            let room = limit - summary.discovered;
            let found: Vec<WorkItem> = page.candidates.into_iter().take(room).collect();
            summary.discovered += found.len();
            batch.pending.extend(found);

            if summary.discovered >= limit || Instant::now() >= deadline {
                self.flush_logged(&mut batch, &mut summary).await;
                deadline = Instant::now() + window;
            }
        };

        match &stop {
            Stop::Exhausted => info!(discovered = summary.discovered, "Discovery exhausted"),
            Stop::LimitReached => info!(limit, "Discovery limit reached"),
            Stop::Shutdown => info!("Shutdown requested, flushing"),
            Stop::FetchFailed(e) => warn!(error = %e, "Discovery failed, flushing"),
        }

        self.final_flush(&mut batch, &mut summary).await?;
        info!(?summary, "Dispatch finished");

        match stop {
            Stop::FetchFailed(e) => Err(e),
            _ => Ok(summary),
        }
    }

    /// Republish every undone item without writing rows.
    ///
    /// Recovers items whose publish was lost after their row was written.
    pub async fn requeue_undone(&self, limit: Option<usize>) -> Result<usize> {
        let undone = self.ledger.query_undone(limit).await?;
        let mut published = 0;
        for item in &undone {
            self.bus.publish(&item.to_message()).await?;
            published += 1;
        }
        info!(published, "Requeued undone items");
        Ok(published)
    }

    async fn final_flush(&self, batch: &mut Batch, summary: &mut DispatchSummary) -> Result<()> {
        let attempts = self.config.max_flush_attempts.max(1);
        let delay = Duration::from_millis(self.config.retry_delay_ms);

        for attempt in 1..=attempts {
            match self.flush(batch, summary).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Final flush failed, retrying");
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        pending = batch.pending.len(),
                        unpublished = batch.unpublished.len(),
                        "Final flush gave up"
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn flush_logged(&self, batch: &mut Batch, summary: &mut DispatchSummary) {
        if let Err(e) = self.flush(batch, summary).await {
            warn!(
                error = %e,
                pending = batch.pending.len(),
                unpublished = batch.unpublished.len(),
                "Flush failed, keeping batch for the next window"
            );
        }
    }

    /// Write pending rows, then publish everything written.
    async fn flush(&self, batch: &mut Batch, summary: &mut DispatchSummary) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        summary.flushes += 1;

        let mut write_error = None;
        if !batch.pending.is_empty() {
            let now = Utc::now();
            for item in &mut batch.pending {
                item.timestamp = now;
            }
            match self.ledger.insert_rows(&batch.pending).await {
                Ok(()) => {
                    summary.written += batch.pending.len();
                    batch
                        .unpublished
                        .extend(batch.pending.drain(..).map(|item| item.to_message()));
                }
                Err(e) => write_error = Some(e),
            }
        }

        while let Some(message) = batch.unpublished.front() {
            self.bus.publish(message).await?;
            batch.unpublished.pop_front();
            summary.published += 1;
        }

        match write_error {
            Some(e) => Err(e),
            None => {
                debug!(
                    written = summary.written,
                    published = summary.published,
                    "Batch flushed"
                );
                Ok(())
            }
        }
    }
}
