//! Storage abstractions for the status ledger and mined records.
//!
//! Both stores are append-only tables checked against a [`TableSchema`]:
//! - Ledger: one [`WorkItem`] row per lifecycle event, read back in insertion order
//! - Records: one [`MinedRecord`] per successful mining, written once
//!
//! ## Backends
//!
//! - [`LocalStorage`]: JSON-lines files on disk, shared by processes on one host
//! - [`MemoryStorage`]: in-process tables for tests and single-process runs

pub mod local;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{MinedRecord, TableSchema, WorkItem};

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// A ledger row together with its insertion position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    /// Zero-based position of the row in its table
    pub seq: u64,
    pub item: WorkItem,
}

/// Get-or-create of a backing table.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create the table if missing, otherwise check it against `schema`.
    ///
    /// Idempotent, and safe when several processes race to create the table.
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()>;
}

/// Append-only work item table.
#[async_trait]
pub trait LedgerStore: TableStore {
    /// Append rows in order. Existing rows are never touched.
    async fn append(&self, table: &str, rows: &[WorkItem]) -> Result<()>;

    /// Read every row in insertion order.
    async fn scan(&self, table: &str) -> Result<Vec<LedgerRow>>;
}

/// Write-once store for mined records.
#[async_trait]
pub trait RecordStore: TableStore {
    async fn insert_record(&self, table: &str, record: &MinedRecord) -> Result<()>;

    /// Read every record in insertion order.
    async fn records(&self, table: &str) -> Result<Vec<MinedRecord>>;
}
