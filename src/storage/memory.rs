//! In-process storage backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::{MinedRecord, TableSchema, WorkItem};
use crate::storage::{LedgerRow, LedgerStore, RecordStore, TableStore};

#[derive(Default)]
struct Tables {
    schemas: HashMap<String, TableSchema>,
    ledger: HashMap<String, Vec<WorkItem>>,
    records: HashMap<String, Vec<MinedRecord>>,
}

/// Tables held in memory, lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(table: &str) -> AppError {
    AppError::ledger_write(format!("table '{table}' does not exist"))
}

#[async_trait]
impl TableStore for MemoryStorage {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.schemas.get(&schema.table) {
            Some(existing) => match schema.diff(existing) {
                Some(message) => Err(AppError::schema_mismatch(&schema.table, message)),
                None => Ok(()),
            },
            None => {
                tables
                    .schemas
                    .insert(schema.table.clone(), schema.clone());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStorage {
    async fn append(&self, table: &str, rows: &[WorkItem]) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.schemas.contains_key(table) {
            return Err(missing(table));
        }
        tables
            .ledger
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<LedgerRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .ledger
            .get(table)
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .map(|(seq, item)| LedgerRow {
                        seq: seq as u64,
                        item: item.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl RecordStore for MemoryStorage {
    async fn insert_record(&self, table: &str, record: &MinedRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.schemas.contains_key(table) {
            return Err(missing(table));
        }
        tables
            .records
            .entry(table.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn records(&self, table: &str) -> Result<Vec<MinedRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.records.get(table).cloned().unwrap_or_default())
    }
}
