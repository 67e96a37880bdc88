//! Local filesystem storage implementation.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── status.schema.json    # Expected columns, written once
//! ├── status.jsonl          # One WorkItem per line, append-only
//! ├── records.schema.json
//! └── records.jsonl         # One MinedRecord per line
//! ```
//!
//! Schema files are created atomically: the content goes to a temp file that
//! is then hard-linked into place, so a concurrent creator either wins or
//! observes the complete winner's file. A torn trailing line left by a crash
//! is skipped on read, and the next append starts on a fresh line.
//!
//! Rows are appended in groups of whole lines, each group one `O_APPEND`
//! write of at most [`MAX_APPEND_WRITE`] bytes, so appends from several
//! processes never interleave inside a row.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{MinedRecord, TableSchema, WorkItem};
use crate::storage::{LedgerRow, LedgerStore, RecordStore, TableStore};

/// Largest single write issued by an append.
pub const MAX_APPEND_WRITE: usize = 2 * 1024 * 1024;

/// Local filesystem storage backend.
pub struct LocalStorage {
    root_dir: PathBuf,
    append_lock: Mutex<()>,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn schema_path(&self, table: &str) -> PathBuf {
        self.root_dir.join(format!("{table}.schema.json"))
    }

    fn rows_path(&self, table: &str) -> PathBuf {
        self.root_dir.join(format!("{table}.jsonl"))
    }

    async fn read_schema(&self, table: &str) -> Result<Option<TableSchema>> {
        match tokio::fs::read(self.schema_path(table)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::ledger_init(format!("{table}: {e}"))),
        }
    }

    fn check_schema(expected: &TableSchema, found: &TableSchema) -> Result<()> {
        match expected.diff(found) {
            Some(message) => Err(AppError::schema_mismatch(&expected.table, message)),
            None => Ok(()),
        }
    }

    /// Create the schema file only if it does not exist yet.
    async fn create_schema(&self, schema: &TableSchema) -> Result<bool> {
        let path = self.schema_path(&schema.table);
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        let bytes = serde_json::to_vec_pretty(schema)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(AppError::ledger_init(format!("{}: {e}", schema.table))),
        }
    }

    async fn require_table(&self, table: &str) -> Result<()> {
        if tokio::fs::try_exists(self.schema_path(table)).await? {
            Ok(())
        } else {
            Err(AppError::ledger_write(format!(
                "table '{table}' does not exist"
            )))
        }
    }

    async fn append_lines<T: Serialize + Sync>(&self, table: &str, rows: &[T]) -> Result<()> {
        self.require_table(table).await?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let mut line = serde_json::to_vec(row)?;
            line.push(b'\n');
            lines.push(line);
        }
        let groups = group_lines(lines, MAX_APPEND_WRITE);

        let _guard = self.append_lock.lock().await;
        let path = self.rows_path(table);
        let repaired = tokio::task::spawn_blocking(move || append_groups(&path, groups))
            .await
            .map_err(AppError::ledger_write)?
            .map_err(AppError::ledger_write)?;
        if repaired {
            tracing::warn!(table, "Closed torn trailing line before append");
        }
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let content = match tokio::fs::read_to_string(self.rows_path(table)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut rows = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(row) => rows.push(row),
                Err(e) => tracing::warn!(
                    table,
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable row"
                ),
            }
        }
        Ok(rows)
    }
}

/// Pack whole lines into groups of at most `max` bytes.
///
/// A line longer than `max` gets a group of its own; lines are never split.
fn group_lines(lines: Vec<Vec<u8>>, max: usize) -> Vec<Vec<u8>> {
    let mut groups: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    for line in lines {
        if !current.is_empty() && current.len() + line.len() > max {
            groups.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&line);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Whether a non-empty file ends without a newline.
fn ends_torn(file: &mut std::fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Append each group with one write. Returns whether a torn line was closed.
fn append_groups(path: &Path, mut groups: Vec<Vec<u8>>) -> std::io::Result<bool> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let repaired = ends_torn(&mut file)?;
    if repaired && let Some(first) = groups.first_mut() {
        first.insert(0, b'\n');
    }
    for group in &groups {
        file.write_all(group)?;
    }
    file.flush()?;
    Ok(repaired)
}

#[async_trait]
impl TableStore for LocalStorage {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()> {
        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| AppError::ledger_init(format!("{:?}: {e}", self.root_dir)))?;

        if let Some(existing) = self.read_schema(&schema.table).await? {
            return Self::check_schema(schema, &existing);
        }

        if self.create_schema(schema).await? {
            tracing::info!(table = %schema.table, root = ?self.root_dir, "Created table");
            return Ok(());
        }

        // Lost the creation race; the winner's file is complete.
        let existing = self
            .read_schema(&schema.table)
            .await?
            .ok_or_else(|| AppError::ledger_init(format!("{} vanished", schema.table)))?;
        Self::check_schema(schema, &existing)
    }
}

#[async_trait]
impl LedgerStore for LocalStorage {
    async fn append(&self, table: &str, rows: &[WorkItem]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.append_lines(table, rows).await
    }

    async fn scan(&self, table: &str) -> Result<Vec<LedgerRow>> {
        let items: Vec<WorkItem> = self.read_lines(table).await?;
        Ok(items
            .into_iter()
            .enumerate()
            .map(|(seq, item)| LedgerRow {
                seq: seq as u64,
                item,
            })
            .collect())
    }
}

#[async_trait]
impl RecordStore for LocalStorage {
    async fn insert_record(&self, table: &str, record: &MinedRecord) -> Result<()> {
        self.append_lines(table, std::slice::from_ref(record)).await
    }

    async fn records(&self, table: &str) -> Result<Vec<MinedRecord>> {
        self.read_lines(table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MiningStatus;

    fn item(url: &str) -> WorkItem {
        WorkItem::discovered(url, "https://example.test/search?page=1", false, None, None)
    }

    #[tokio::test]
    async fn test_ensure_table_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let schema = TableSchema::work_items("status");

        storage.ensure_table(&schema).await.unwrap();
        storage.ensure_table(&schema).await.unwrap();

        assert!(dir.path().join("status.schema.json").exists());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_table() {
        let dir = tempfile::tempdir().unwrap();
        let a = LocalStorage::new(dir.path());
        let b = LocalStorage::new(dir.path());
        let schema = TableSchema::work_items("status");

        let (ra, rb) = tokio::join!(a.ensure_table(&schema), b.ensure_table(&schema));
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .ensure_table(&TableSchema::mined_records("status"))
            .await
            .unwrap();
        let err = storage
            .ensure_table(&TableSchema::work_items("status"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_append_and_scan_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage
            .ensure_table(&TableSchema::work_items("status"))
            .await
            .unwrap();

        storage
            .append("status", &[item("https://a.test/1"), item("https://a.test/2")])
            .await
            .unwrap();
        let mut started = item("https://a.test/1");
        started.status = MiningStatus::StartedMining;
        storage.append("status", &[started]).await.unwrap();

        let rows = storage.scan("status").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].seq, 2);
        assert_eq!(rows[2].item.status, MiningStatus::StartedMining);
        assert_eq!(rows[1].item.article_url, "https://a.test/2");
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage
            .ensure_table(&TableSchema::work_items("status"))
            .await
            .unwrap();
        storage
            .append("status", &[item("https://a.test/1")])
            .await
            .unwrap();

        let path = dir.path().join("status.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"article_url\":\"https://a.te");
        std::fs::write(&path, content).unwrap();

        let rows = storage.scan("status").await.unwrap();
        assert_eq!(rows.len(), 1);

        storage
            .append("status", &[item("https://a.test/2")])
            .await
            .unwrap();
        let urls: Vec<String> = storage
            .scan("status")
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.item.article_url)
            .collect();
        assert_eq!(urls, vec!["https://a.test/1", "https://a.test/2"]);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn test_group_lines_keeps_rows_whole() {
        let lines: Vec<Vec<u8>> = ["aaaa\n", "bbbb\n", "cccccccccccc\n", "d\n"]
            .iter()
            .map(|line| line.as_bytes().to_vec())
            .collect();

        let groups = group_lines(lines, 10);

        assert_eq!(
            groups,
            vec![
                b"aaaa\nbbbb\n".to_vec(),
                b"cccccccccccc\n".to_vec(),
                b"d\n".to_vec()
            ]
        );
        assert!(groups.iter().all(|g| g.ends_with(b"\n")));
    }

    #[tokio::test]
    async fn test_concurrent_appends_from_separate_handles() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher_side = LocalStorage::new(dir.path());
        let worker_side = LocalStorage::new(dir.path());
        dispatcher_side
            .ensure_table(&TableSchema::work_items("status"))
            .await
            .unwrap();

        let batch: Vec<WorkItem> = (0..2_000)
            .map(|n| item(&format!("https://a.test/batch/{n}")))
            .collect();
        let single = async {
            for n in 0..50 {
                worker_side
                    .append("status", &[item(&format!("https://a.test/single/{n}"))])
                    .await
                    .unwrap();
            }
        };
        let (batched, ()) = tokio::join!(dispatcher_side.append("status", &batch), single);
        batched.unwrap();

        let rows = dispatcher_side.scan("status").await.unwrap();
        assert_eq!(rows.len(), 2_050);
    }

    #[tokio::test]
    async fn test_append_requires_table() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let err = storage
            .append("status", &[item("https://a.test/1")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LedgerWrite(_)));
    }
}
