pub mod bitcode_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{DateRange, SyncOutcome, UsageBucket};

/// A persisted usage row and when it was last recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBucket {
    pub bucket: UsageBucket,
    pub synced_at: DateTime<Utc>,
}

/// Durable home of the materialized usage view and the sync audit trail.
///
/// Rows are keyed by (provider, model, date, hour). Writes replace the row
/// under the same key, so re-running a sync never adds to prior totals.
pub trait UsageStore: Send {
    /// Replace-on-conflict by composite key. Returns the number of rows written.
    fn upsert_buckets(&mut self, rows: &[UsageBucket], synced_at: DateTime<Utc>) -> Result<usize>;

    /// Append to the audit trail, dropping the oldest entries past retention.
    fn append_outcome(&mut self, outcome: &SyncOutcome) -> Result<()>;

    /// Rows in key order, optionally limited to a date range.
    fn buckets(&self, range: Option<&DateRange>) -> Result<Vec<StoredBucket>>;

    /// Most recent first.
    fn recent_outcomes(&self, limit: usize) -> Result<Vec<SyncOutcome>>;

    /// The most recent outcome of each provider, ordered by provider.
    fn latest_outcomes(&self) -> Result<Vec<SyncOutcome>>;

    /// Drop every usage row. The audit trail is kept. Returns rows removed.
    fn rebuild(&mut self) -> Result<usize>;
}

/// Keep only the newest outcome per provider from a newest-first list.
pub(crate) fn latest_per_provider(recent: Vec<SyncOutcome>) -> Vec<SyncOutcome> {
    let mut latest: Vec<SyncOutcome> = Vec::new();
    for outcome in recent {
        if !latest.iter().any(|o| o.provider == outcome.provider) {
            latest.push(outcome);
        }
    }
    latest.sort_by(|a, b| a.provider.cmp(&b.provider));
    latest
}

pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "clawmeter").map(|d| d.data_dir().to_path_buf())
}

/// Open the configured backend under the user data directory, or an
/// in-memory store when no home directory can be resolved.
pub fn default_storage(outcome_retention: usize) -> Result<Box<dyn UsageStore>> {
    #[cfg(feature = "sqlite")]
    {
        match data_dir() {
            Some(dir) => Ok(Box::new(sqlite_store::SqliteStore::open(
                &dir.join("usage.db"),
                outcome_retention,
            )?)),
            None => Ok(Box::new(sqlite_store::SqliteStore::in_memory(
                outcome_retention,
            )?)),
        }
    }
    #[cfg(not(feature = "sqlite"))]
    {
        match data_dir() {
            Some(dir) => Ok(Box::new(bitcode_store::BitcodeStore::open(
                dir.join("usage.bin"),
                outcome_retention,
            ))),
            None => Ok(Box::new(bitcode_store::BitcodeStore::in_memory(
                outcome_retention,
            ))),
        }
    }
}
