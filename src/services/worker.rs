// src/services/worker.rs

//! Mining worker.
//!
//! Per message: `Received -> StartedMining -> (FinishedMining | Failed | NoResults)`.
//! Every transition is a new ledger row tagged with this worker's id. The
//! ledger is not locked, so two workers may mine the same URL; the later
//! terminal row wins on read.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{FlowControl, MessageBus};
use crate::error::{AppError, Result};
use crate::models::{JobMessage, MinedRecord, MiningStatus, TableSchema, WorkItem, WorkerConfig};
use crate::services::ledger::StatusLedger;
use crate::services::miner::{MineOutcome, MinerRegistry};
use crate::storage::RecordStore;

/// What happens to a delivery after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done; never redeliver
    Ack,
    /// Hand back for redelivery
    Nack,
}

/// Why a job ended in `Failed`; stored under `"failure"` in the row's meta_info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    NoMiner,
    Timeout,
    MinerError,
    RecordWrite,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::NoMiner => "no_miner",
            FailureCause::Timeout => "timeout",
            FailureCause::MinerError => "miner_error",
            FailureCause::RecordWrite => "record_write",
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Finished,
    NoResults,
    Failed { cause: FailureCause, error: AppError },
}

/// Counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub malformed: u64,
    pub finished: u64,
    pub no_results: u64,
    pub failed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub ledger_failures: u64,
}

/// Consumes job messages one at a time.
pub struct Worker {
    id: String,
    ledger: StatusLedger,
    records: Arc<dyn RecordStore>,
    data_table: String,
    registry: Arc<MinerRegistry>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        ledger: StatusLedger,
        records: Arc<dyn RecordStore>,
        data_table: impl Into<String>,
        registry: Arc<MinerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        Self {
            id,
            ledger,
            records,
            data_table: data_table.into(),
            registry,
            config,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Get-or-create the ledger and record tables.
    pub async fn prepare(&self) -> Result<()> {
        self.ledger.ensure_table().await?;
        self.records
            .ensure_table(&TableSchema::mined_records(&self.data_table))
            .await
    }

    /// Consume messages until the bus closes or `shutdown` fires.
    pub async fn run(
        &mut self,
        bus: &dyn MessageBus,
        shutdown: CancellationToken,
    ) -> Result<WorkerStats> {
        let flow = FlowControl {
            max_messages: self.config.max_in_flight,
        };
        let mut subscription = bus.subscribe(flow).await?;
        let delay = Duration::from_millis(self.config.delay_ms);
        info!(worker_id = %self.id, "Worker listening");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = subscription.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            debug!(
                worker_id = %self.id,
                message_id = %delivery.id,
                attempt = delivery.attempt,
                "Received message"
            );
            let disposition = self.handle_payload(&delivery.data).await;
            let settled = match disposition {
                Disposition::Ack => {
                    self.stats.acked += 1;
                    delivery.ack().await
                }
                Disposition::Nack => {
                    self.stats.nacked += 1;
                    delivery.nack().await
                }
            };
            if let Err(e) = settled {
                warn!(worker_id = %self.id, error = %e, "Failed to settle delivery");
            }

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!(worker_id = %self.id, stats = ?self.stats, "Worker stopped");
        Ok(self.stats)
    }

    /// Decode and handle a raw payload.
    ///
    /// A payload that is not a job message is acked: redelivery cannot fix it.
    pub async fn handle_payload(&mut self, data: &[u8]) -> Disposition {
        self.stats.received += 1;
        match JobMessage::from_bytes(data) {
            Ok(message) => self.handle(&message).await,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(worker_id = %self.id, error = %e, bytes = data.len(), "Dropping malformed payload");
                Disposition::Ack
            }
        }
    }

    /// Run the claim/mine/report state machine for one job.
    pub async fn handle(&mut self, message: &JobMessage) -> Disposition {
        self.record_status(message.status_row(MiningStatus::StartedMining, &self.id))
            .await;

        let (row, disposition) = match self.execute(message).await {
            Outcome::Finished => {
                self.stats.finished += 1;
                (
                    message.status_row(MiningStatus::FinishedMining, &self.id),
                    Disposition::Ack,
                )
            }
            Outcome::NoResults => {
                self.stats.no_results += 1;
                (
                    message.status_row(MiningStatus::NoResults, &self.id),
                    Disposition::Ack,
                )
            }
            Outcome::Failed { cause, error } => {
                self.stats.failed += 1;
                warn!(
                    worker_id = %self.id,
                    url = %message.article_url,
                    cause = cause.as_str(),
                    error = %error,
                    "Mining failed"
                );
                (
                    message.failed_row(&self.id, cause.as_str()),
                    Disposition::Nack,
                )
            }
        };

        info!(
            worker_id = %self.id,
            url = %message.article_url,
            status = %row.status,
            ?disposition,
            "Job handled"
        );
        self.record_status(row).await;
        disposition
    }

    async fn execute(&self, message: &JobMessage) -> Outcome {
        let url = message.article_url.as_str();
        let Some((domain, miner)) = self.registry.lookup(url) else {
            let host = crate::utils::host_of(url).unwrap_or_else(|| url.to_string());
            return Outcome::Failed {
                cause: FailureCause::NoMiner,
                error: AppError::NoMiner(host),
            };
        };
        debug!(worker_id = %self.id, url, domain = %domain, "Mining");

        let limit = Duration::from_secs(self.config.mining_timeout_secs);
        let record = match tokio::time::timeout(limit, miner.mine(url)).await {
            Err(_) => {
                return Outcome::Failed {
                    cause: FailureCause::Timeout,
                    error: AppError::mining_timeout(url, self.config.mining_timeout_secs),
                };
            }
            Ok(Err(error @ AppError::MiningTimeout { .. })) => {
                return Outcome::Failed {
                    cause: FailureCause::Timeout,
                    error,
                };
            }
            Ok(Err(AppError::NoResult(_))) | Ok(Ok(MineOutcome::NoResult)) => {
                return Outcome::NoResults;
            }
            Ok(Err(error)) => {
                return Outcome::Failed {
                    cause: FailureCause::MinerError,
                    error,
                };
            }
            Ok(Ok(MineOutcome::Mined(record))) => complete(record, message),
        };

        match self.records.insert_record(&self.data_table, &record).await {
            Ok(()) => Outcome::Finished,
            Err(error) => Outcome::Failed {
                cause: FailureCause::RecordWrite,
                error,
            },
        }
    }

    /// Append a status row; failures are reported, never retried here.
    async fn record_status(&mut self, row: WorkItem) {
        if let Err(e) = self.ledger.insert_row(&row).await {
            self.stats.ledger_failures += 1;
            error!(
                target: "operator",
                worker_id = %self.id,
                url = %row.article_url,
                status = %row.status,
                error = %e,
                "Status ledger write failed"
            );
        }
    }
}

/// Fill fields the miner left empty from the job message.
fn complete(mut record: MinedRecord, message: &JobMessage) -> MinedRecord {
    if record.language.trim().is_empty() {
        record.language = message.language.clone().unwrap_or_default();
    }
    if record.link.trim().is_empty() {
        record.link = message.article_url.clone();
    }
    if record.meta_info.is_none() {
        record.meta_info = message.meta_info.clone();
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::models::LedgerConfig;
    use crate::services::miner::PageMiner;
    use crate::storage::{LedgerRow, LedgerStore, MemoryStorage, TableStore};
    use async_trait::async_trait;
    use chrono::Utc;

    enum Behavior {
        Record,
        Nothing,
        Hang,
        Fail,
    }

    struct StubMiner(Behavior);

    #[async_trait]
    impl PageMiner for StubMiner {
        async fn mine(&self, url: &str) -> Result<MineOutcome> {
            match self.0 {
                Behavior::Record => Ok(MineOutcome::Mined(MinedRecord {
                    title: "Title".into(),
                    authors: "Doe, J.".into(),
                    abstract_text: "Abstract".into(),
                    body: None,
                    source: "stub".into(),
                    link: url.into(),
                    language: String::new(),
                    publication_date: None,
                    acquisition_date: Utc::now(),
                    doi: None,
                    meta_info: None,
                })),
                Behavior::Nothing => Ok(MineOutcome::NoResult),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(MineOutcome::NoResult)
                }
                Behavior::Fail => Err(AppError::miner(url, "parse failure")),
            }
        }
    }

    /// Ledger store whose appends always fail.
    struct BrokenLedger;

    #[async_trait]
    impl TableStore for BrokenLedger {
        async fn ensure_table(&self, _schema: &TableSchema) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl LedgerStore for BrokenLedger {
        async fn append(&self, _table: &str, _rows: &[WorkItem]) -> Result<()> {
            Err(AppError::ledger_write("disk full"))
        }
        async fn scan(&self, _table: &str) -> Result<Vec<LedgerRow>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        ledger: StatusLedger,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let ledger = StatusLedger::new(storage.clone(), LedgerConfig::default());
        Fixture { storage, ledger }
    }

    fn registry(behavior: Behavior) -> Arc<MinerRegistry> {
        let mut registry = MinerRegistry::new();
        registry
            .register("arxiv.org", Arc::new(StubMiner(behavior)))
            .unwrap();
        Arc::new(registry)
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            worker_id: Some("worker-test".into()),
            mining_timeout_secs: 5,
            ..WorkerConfig::default()
        }
    }

    async fn worker(fx: &Fixture, behavior: Behavior) -> Worker {
        let worker = Worker::new(
            fx.ledger.clone(),
            fx.storage.clone(),
            "records",
            registry(behavior),
            worker_config(),
        );
        worker.prepare().await.unwrap();
        worker
    }

    fn job(url: &str) -> JobMessage {
        JobMessage {
            article_url: url.into(),
            catalog_url: "https://export.arxiv.org/find/all".into(),
            is_pdf: 0,
            language: Some("en".into()),
            meta_info: Some(r#"{"search_terms":["virus"]}"#.into()),
            worker_id: None,
        }
    }

    fn failure_of(row: &WorkItem) -> String {
        let meta: serde_json::Value =
            serde_json::from_str(row.meta_info.as_deref().unwrap()).unwrap();
        meta["failure"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_mined_record_is_written_and_acked() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Record).await;
        let url = "https://arxiv.org/abs/2101.00001";

        assert_eq!(worker.handle(&job(url)).await, Disposition::Ack);

        let history = fx.ledger.history(url).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.item.status).collect();
        assert_eq!(
            statuses,
            vec![MiningStatus::StartedMining, MiningStatus::FinishedMining]
        );
        assert!(history.iter().all(|r| r.item.worker_id.as_deref() == Some("worker-test")));

        let records = fx.storage.records("records").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].language, "en");
        assert_eq!(
            records[0].meta_info.as_deref(),
            Some(r#"{"search_terms":["virus"]}"#)
        );
    }

    #[tokio::test]
    async fn test_no_miner_fails_and_redelivers() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Record).await;
        let bus = MemoryBus::new();
        bus.publish(&job("https://example.test/a/1")).await.unwrap();
        let mut sub = bus.subscribe(FlowControl::default()).await.unwrap();

        let delivery = sub.next().await.unwrap();
        let disposition = worker.handle_payload(&delivery.data).await;
        assert_eq!(disposition, Disposition::Nack);
        delivery.nack().await.unwrap();

        let latest = fx
            .ledger
            .latest("https://example.test/a/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, MiningStatus::Failed);
        assert_eq!(latest.worker_id.as_deref(), Some("worker-test"));
        assert_eq!(failure_of(&latest), "no_miner");

        let redelivered = sub.next().await.unwrap();
        assert_eq!(redelivered.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_and_nacks() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Hang).await;
        let url = "https://arxiv.org/abs/slow";

        assert_eq!(worker.handle(&job(url)).await, Disposition::Nack);

        let latest = fx.ledger.latest(url).await.unwrap().unwrap();
        assert_eq!(latest.status, MiningStatus::Failed);
        assert_eq!(failure_of(&latest), "timeout");
    }

    #[tokio::test]
    async fn test_no_result_is_acked() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Nothing).await;
        let url = "https://arxiv.org/abs/empty";

        assert_eq!(worker.handle(&job(url)).await, Disposition::Ack);
        let latest = fx.ledger.latest(url).await.unwrap().unwrap();
        assert_eq!(latest.status, MiningStatus::NoResults);
        assert!(fx.storage.records("records").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_miner_error_is_tagged() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Fail).await;
        let url = "https://arxiv.org/abs/broken";

        assert_eq!(worker.handle(&job(url)).await, Disposition::Nack);
        let latest = fx.ledger.latest(url).await.unwrap().unwrap();
        assert_eq!(failure_of(&latest), "miner_error");
        assert_eq!(worker.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_record_write_failure_nacks() {
        let fx = fixture().await;
        // Record table deliberately not created.
        let mut worker = Worker::new(
            fx.ledger.clone(),
            fx.storage.clone(),
            "missing_records",
            registry(Behavior::Record),
            worker_config(),
        );
        fx.ledger.ensure_table().await.unwrap();
        let url = "https://arxiv.org/abs/2101.00002";

        assert_eq!(worker.handle(&job(url)).await, Disposition::Nack);
        let latest = fx.ledger.latest(url).await.unwrap().unwrap();
        assert_eq!(latest.status, MiningStatus::Failed);
        assert_eq!(failure_of(&latest), "record_write");
    }

    #[tokio::test]
    async fn test_ledger_failure_does_not_change_disposition() {
        let fx = fixture().await;
        fx.storage
            .ensure_table(&TableSchema::mined_records("records"))
            .await
            .unwrap();
        let ledger = StatusLedger::new(Arc::new(BrokenLedger), LedgerConfig::default());
        let mut worker = Worker::new(
            ledger,
            fx.storage.clone(),
            "records",
            registry(Behavior::Record),
            worker_config(),
        );

        let disposition = worker.handle(&job("https://arxiv.org/abs/1")).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(worker.stats().ledger_failures, 2);
        assert_eq!(worker.stats().finished, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_collapses_to_one_state() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Record).await;
        let url = "https://arxiv.org/abs/2101.00003";
        fx.ledger
            .insert_row(&WorkItem::discovered(
                url,
                "https://export.arxiv.org/find/all",
                false,
                Some("en".into()),
                None,
            ))
            .await
            .unwrap();

        worker.handle(&job(url)).await;
        worker.handle(&job(url)).await;

        let history = fx.ledger.history(url).await.unwrap();
        assert_eq!(history.len(), 5);
        let latest = fx.ledger.latest(url).await.unwrap().unwrap();
        assert_eq!(latest.status, MiningStatus::FinishedMining);
        assert!(fx.ledger.query_undone(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Record).await;

        assert_eq!(
            worker.handle_payload(b"not json").await,
            Disposition::Ack
        );
        assert_eq!(worker.stats().malformed, 1);
        assert!(fx.ledger.query_undone(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_until_close() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Nothing).await;
        let bus = MemoryBus::new();
        bus.publish(&job("https://arxiv.org/abs/1")).await.unwrap();
        bus.publish(&job("https://arxiv.org/abs/2")).await.unwrap();
        bus.close();

        let stats = worker.run(&bus, CancellationToken::new()).await.unwrap();

        assert_eq!(stats.received, 2);
        assert_eq!(stats.no_results, 2);
        assert_eq!(stats.acked, 2);
        assert_eq!(bus.stats().acked, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fx = fixture().await;
        let mut worker = worker(&fx, Behavior::Nothing).await;
        let bus = MemoryBus::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = worker.run(&bus, shutdown).await.unwrap();
        assert_eq!(stats.received, 0);
    }
}
