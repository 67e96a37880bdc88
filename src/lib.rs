// src/lib.rs

//! Article Crawler Library
//!
//! Search-result crawling into a status ledger, batched dispatch over a
//! message bus, and per-site mining workers.

pub mod bus;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use error::{AppError, Result};
pub use models::{Config, JobMessage, MinedRecord, MiningStatus, WorkItem};
