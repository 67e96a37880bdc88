//! Service layer for the crawler application.
//!
//! This module contains the pipeline stages:
//! - Search-result paging (`FrontierCollector`)
//! - Status bookkeeping (`StatusLedger`)
//! - Batched write-then-publish (`Dispatcher`)
//! - Site miners (`MinerRegistry`, `SelectorMiner`)
//! - Message consumption (`Worker`)

mod dispatcher;
mod frontier;
mod ledger;
mod miner;
mod worker;

pub use dispatcher::{DispatchSummary, Discovery, Dispatcher};
pub use frontier::{Frontier, FrontierCollector, FrontierPage};
pub use ledger::{StatusLedger, latest_rows};
pub use miner::{MineOutcome, MinerRegistry, PageMiner, SelectorMiner};
pub use worker::{Disposition, FailureCause, Worker, WorkerStats};
