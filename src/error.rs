// src/error.rs

//! Unified error handling for the crawler pipeline.

use std::fmt;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// A frontier page could not be fetched after all retries
    #[error("Fetch error for {url} after {attempts} attempt(s): {message}")]
    Fetch {
        url: String,
        attempts: u32,
        message: String,
    },

    /// No miner is registered for the document's domain
    #[error("No miner registered for domain '{0}'")]
    NoMiner(String),

    /// Mining did not finish within the allowed time
    #[error("Mining timed out after {timeout_secs}s for {url}")]
    MiningTimeout { url: String, timeout_secs: u64 },

    /// The page had no extractable content
    #[error("No result for {0}")]
    NoResult(String),

    /// The miner failed for a reason other than a timeout
    #[error("Miner error for {url}: {message}")]
    Miner { url: String, message: String },

    /// Appending to the ledger or record store failed
    #[error("Ledger write error: {0}")]
    LedgerWrite(String),

    /// The backing table could not be opened or created
    #[error("Ledger init error: {0}")]
    LedgerInit(String),

    /// An existing table does not match the expected schema
    #[error("Schema mismatch for table '{table}': {message}")]
    SchemaMismatch { table: String, message: String },

    /// Publishing a job to the message bus failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscribing to or acknowledging on the message bus failed
    #[error("Message bus error: {0}")]
    Bus(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a fetch error for a frontier page.
    pub fn fetch(url: impl Into<String>, attempts: u32, message: impl fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            attempts,
            message: message.to_string(),
        }
    }

    /// Create a mining timeout error.
    pub fn mining_timeout(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self::MiningTimeout {
            url: url.into(),
            timeout_secs,
        }
    }

    /// Create a miner error.
    pub fn miner(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Miner {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create a ledger write error.
    pub fn ledger_write(message: impl fmt::Display) -> Self {
        Self::LedgerWrite(message.to_string())
    }

    /// Create a ledger initialization error.
    pub fn ledger_init(message: impl fmt::Display) -> Self {
        Self::LedgerInit(message.to_string())
    }

    /// Create a schema mismatch error.
    pub fn schema_mismatch(table: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a publish error.
    pub fn publish(message: impl fmt::Display) -> Self {
        Self::Publish(message.to_string())
    }

    /// Create a message bus error.
    pub fn bus(message: impl fmt::Display) -> Self {
        Self::Bus(message.to_string())
    }

    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether a worker should hand the message back for redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. }
                | Self::NoMiner(_)
                | Self::MiningTimeout { .. }
                | Self::Miner { .. }
                | Self::Http(_)
                | Self::Io(_)
        )
    }
}
