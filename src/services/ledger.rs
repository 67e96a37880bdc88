// src/services/ledger.rs

//! Status ledger service.
//!
//! The logical state of a URL is its latest row: maximum `timestamp`, ties
//! broken by insertion order. Rows are only ever appended, so concurrent
//! writers never conflict and the latest-wins read collapses duplicates.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{LedgerConfig, MiningStatus, TableSchema, WorkItem};
use crate::storage::{LedgerRow, LedgerStore};

/// Append-only lifecycle ledger for work items.
#[derive(Clone)]
pub struct StatusLedger {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl StatusLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Create a ledger and make sure its backing table exists.
    pub async fn open(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Result<Self> {
        let ledger = Self::new(store, config);
        ledger.ensure_table().await?;
        Ok(ledger)
    }

    pub fn table(&self) -> &str {
        &self.config.status_table
    }

    /// Get-or-create the work item table.
    pub async fn ensure_table(&self) -> Result<()> {
        self.store
            .ensure_table(&TableSchema::work_items(&self.config.status_table))
            .await
    }

    pub async fn insert_row(&self, item: &WorkItem) -> Result<()> {
        self.insert_rows(std::slice::from_ref(item)).await
    }

    pub async fn insert_rows(&self, items: &[WorkItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.store.append(&self.config.status_table, items).await?;
        tracing::debug!(
            table = %self.config.status_table,
            rows = items.len(),
            "Appended ledger rows"
        );
        Ok(())
    }

    /// Latest row per URL whose state is `NotMined`, oldest first.
    pub async fn query_undone(&self, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        let rows = self.store.scan(&self.config.status_table).await?;
        let limit = limit.unwrap_or(self.config.undone_page_size);
        Ok(undone(rows, self.config.skip_pdf, limit))
    }

    /// The row carrying the logical state of one URL.
    pub async fn latest(&self, article_url: &str) -> Result<Option<WorkItem>> {
        let rows = self.store.scan(&self.config.status_table).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.item.article_url == article_url)
            .max_by(|a, b| order_key(a).cmp(&order_key(b)))
            .map(|row| row.item))
    }

    /// Every row for one URL in insertion order.
    pub async fn history(&self, article_url: &str) -> Result<Vec<LedgerRow>> {
        let rows = self.store.scan(&self.config.status_table).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.item.article_url == article_url)
            .collect())
    }
}

fn order_key(row: &LedgerRow) -> (chrono::DateTime<chrono::Utc>, u64) {
    (row.item.timestamp, row.seq)
}

/// Collapse rows to their latest state per URL.
pub fn latest_rows(rows: Vec<LedgerRow>) -> Vec<LedgerRow> {
    let mut latest: HashMap<String, LedgerRow> = HashMap::new();
    for row in rows {
        match latest.get(&row.item.article_url) {
            Some(current) if order_key(current) >= order_key(&row) => {}
            _ => {
                latest.insert(row.item.article_url.clone(), row);
            }
        }
    }
    latest.into_values().collect()
}

fn undone(rows: Vec<LedgerRow>, skip_pdf: bool, limit: usize) -> Vec<WorkItem> {
    let mut pending: Vec<LedgerRow> = latest_rows(rows)
        .into_iter()
        .filter(|row| row.item.status == MiningStatus::NotMined)
        .filter(|row| !(skip_pdf && row.item.is_pdf()))
        .collect();

    pending.sort_by_key(order_key);
    pending.truncate(limit);
    pending.into_iter().map(|row| row.item).collect()
}
