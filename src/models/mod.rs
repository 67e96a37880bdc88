//! Data models for the crawler pipeline.

mod config;
mod record;
mod schema;
mod site;
mod work_item;

pub use config::{Config, CrawlerConfig, DispatcherConfig, LedgerConfig, WorkerConfig};
pub use record::MinedRecord;
pub use schema::{Column, ColumnType, TableSchema};
pub use site::{LinkFilter, MinerSelectors, SiteConfig};
pub use work_item::{JobMessage, MiningStatus, WorkItem};
