//! Usage-event ingestion for the OpenClaw agent runtime.
//!
//! Session logs are discovered on disk, decoded line by line into usage
//! events, folded into hourly buckets per provider and model, and written
//! idempotently into a store on a schedule.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod cost;
pub mod error;
pub mod extract;
pub mod logging;
pub mod output;
pub mod pricing;
pub mod providers;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod storage;
pub mod sync;
pub mod tools;
pub mod types;

pub use error::{Error, Result};
