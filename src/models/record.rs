//! Mined article record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured record produced by a successful mining.
///
/// Written once to the record store and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinedRecord {
    pub title: String,

    /// Author list as a single display string
    pub authors: String,

    #[serde(rename = "abstract")]
    pub abstract_text: String,

    #[serde(default)]
    pub body: Option<String>,

    /// Site the record was mined from
    pub source: String,

    /// Article URL the record was mined from
    pub link: String,

    pub language: String,

    #[serde(default)]
    pub publication_date: Option<DateTime<Utc>>,

    pub acquisition_date: DateTime<Utc>,

    #[serde(default)]
    pub doi: Option<String>,

    #[serde(default)]
    pub meta_info: Option<String>,
}

impl MinedRecord {
    /// A record is usable when it carries a title and some text.
    pub fn has_content(&self) -> bool {
        let has_text = !self.abstract_text.trim().is_empty()
            || self.body.as_deref().is_some_and(|b| !b.trim().is_empty());
        !self.title.trim().is_empty() && has_text
    }
}
