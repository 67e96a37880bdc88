//! Work item rows and the job payload sent over the message bus.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, Result};

/// Lifecycle status of a work item row.
///
/// The set is closed: anything else read from the ledger is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiningStatus {
    NotMined,
    StartedMining,
    FinishedMining,
    Failed,
    NoResults,
}

impl MiningStatus {
    /// Wire string stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            MiningStatus::NotMined => "Not Mined",
            MiningStatus::StartedMining => "Started Mining",
            MiningStatus::FinishedMining => "Finished Mining",
            MiningStatus::Failed => "Failed",
            MiningStatus::NoResults => "No results",
        }
    }

    /// Whether no further worker transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MiningStatus::FinishedMining | MiningStatus::NoResults
        )
    }
}

impl fmt::Display for MiningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MiningStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "not mined" => Ok(MiningStatus::NotMined),
            "started mining" => Ok(MiningStatus::StartedMining),
            "finished mining" => Ok(MiningStatus::FinishedMining),
            "failed" => Ok(MiningStatus::Failed),
            "no results" => Ok(MiningStatus::NoResults),
            other => Err(AppError::validation(format!("unknown status '{other}'"))),
        }
    }
}

impl Serialize for MiningStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MiningStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One ledger row. Rows are never edited; every transition appends a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    /// Canonical document URL, the dedup key
    pub article_url: String,

    /// Search or listing page the URL was discovered on
    pub catalog_url: String,

    /// 1 when the URL looks like a PDF link
    pub is_pdf: u8,

    /// Best-effort language guess
    #[serde(default)]
    pub language: Option<String>,

    pub status: MiningStatus,

    /// Write time of this row
    pub timestamp: DateTime<Utc>,

    /// Worker that produced this row; empty until claimed
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Opaque JSON blob with site-specific extras
    #[serde(default)]
    pub meta_info: Option<String>,
}

impl WorkItem {
    /// A freshly discovered item in the `NotMined` state.
    pub fn discovered(
        article_url: impl Into<String>,
        catalog_url: impl Into<String>,
        is_pdf: bool,
        language: Option<String>,
        meta_info: Option<String>,
    ) -> Self {
        Self {
            article_url: article_url.into(),
            catalog_url: catalog_url.into(),
            is_pdf: u8::from(is_pdf),
            language,
            status: MiningStatus::NotMined,
            timestamp: Utc::now(),
            worker_id: None,
            meta_info,
        }
    }

    pub fn is_pdf(&self) -> bool {
        self.is_pdf != 0
    }

    /// Strip status and timestamp for publishing.
    pub fn to_message(&self) -> JobMessage {
        JobMessage {
            article_url: self.article_url.clone(),
            catalog_url: self.catalog_url.clone(),
            is_pdf: self.is_pdf,
            language: self.language.clone(),
            meta_info: self.meta_info.clone(),
            worker_id: self.worker_id.clone(),
        }
    }
}

/// Payload published to the message bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobMessage {
    pub article_url: String,
    pub catalog_url: String,
    pub is_pdf: u8,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub meta_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl JobMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Build the status row a worker writes for this job.
    pub fn status_row(&self, status: MiningStatus, worker_id: &str) -> WorkItem {
        WorkItem {
            article_url: self.article_url.clone(),
            catalog_url: self.catalog_url.clone(),
            is_pdf: self.is_pdf,
            language: self.language.clone(),
            status,
            timestamp: Utc::now(),
            worker_id: Some(worker_id.to_string()),
            meta_info: self.meta_info.clone(),
        }
    }

    /// Like [`status_row`](Self::status_row), tagging `meta_info` with a failure cause.
    pub fn failed_row(&self, worker_id: &str, cause: &str) -> WorkItem {
        let mut row = self.status_row(MiningStatus::Failed, worker_id);
        row.meta_info = Some(tag_failure(self.meta_info.as_deref(), cause));
        row
    }
}

/// Merge a `"failure"` key into a meta_info blob, keeping whatever was there.
fn tag_failure(meta_info: Option<&str>, cause: &str) -> String {
    let mut value = meta_info
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .unwrap_or_else(|| serde_json::json!({}));

    match value.as_object_mut() {
        Some(map) => {
            map.insert("failure".into(), serde_json::Value::from(cause));
        }
        None => {
            value = serde_json::json!({ "failure": cause, "meta_info": value });
        }
    }
    value.to_string()
}
