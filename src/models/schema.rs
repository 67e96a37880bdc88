//! Table schemas for the ledger and record tables.

use serde::{Deserialize, Serialize};

/// Column type in a backing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    Integer,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    pub required: bool,
}

/// Expected shape of a backing table, checked by `ensure_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Schema of the status ledger.
    pub fn work_items(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: vec![
                column("article_url", ColumnType::String, true),
                column("catalog_url", ColumnType::String, true),
                column("is_pdf", ColumnType::Integer, true),
                column("language", ColumnType::String, false),
                column("status", ColumnType::String, true),
                column("timestamp", ColumnType::Timestamp, true),
                column("worker_id", ColumnType::String, false),
                column("meta_info", ColumnType::String, false),
            ],
        }
    }

    /// Schema of the mined record table.
    pub fn mined_records(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: vec![
                column("abstract", ColumnType::String, true),
                column("title", ColumnType::String, true),
                column("authors", ColumnType::String, true),
                column("language", ColumnType::String, true),
                column("doi", ColumnType::String, false),
                column("acquisition_date", ColumnType::Timestamp, true),
                column("publication_date", ColumnType::Timestamp, false),
                column("link", ColumnType::String, true),
                column("source", ColumnType::String, true),
                column("meta_info", ColumnType::String, false),
                column("body", ColumnType::String, false),
            ],
        }
    }

    /// Describe the first difference from `other`, if any.
    pub fn diff(&self, other: &TableSchema) -> Option<String> {
        if self.columns.len() != other.columns.len() {
            return Some(format!(
                "expected {} columns, found {}",
                self.columns.len(),
                other.columns.len()
            ));
        }
        self.columns
            .iter()
            .zip(&other.columns)
            .find(|(a, b)| a != b)
            .map(|(a, b)| format!("expected column {a:?}, found {b:?}"))
    }
}

fn column(name: &str, kind: ColumnType, required: bool) -> Column {
    Column {
        name: name.to_string(),
        kind,
        required,
    }
}
