//! Fetch, aggregate and persist, one provider at a time.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::providers::UsageProvider;
use crate::storage::UsageStore;
use crate::types::{DateRange, SyncOutcome, SyncStatus};

/// Longest error detail kept in the audit trail, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_MESSAGE_CHARS).collect()
}

pub struct SyncDriver {
    providers: Vec<Box<dyn UsageProvider>>,
    store: Mutex<Box<dyn UsageStore>>,
}

impl SyncDriver {
    pub fn new(providers: Vec<Box<dyn UsageProvider>>, store: Box<dyn UsageStore>) -> Self {
        Self {
            providers,
            store: Mutex::new(store),
        }
    }

    pub fn providers(&self) -> &[Box<dyn UsageProvider>] {
        &self.providers
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, Box<dyn UsageStore>>> {
        self.store
            .lock()
            .map_err(|_| Error::Persistence("store lock poisoned".into()))
    }

    /// Run `f` with exclusive access to the store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut dyn UsageStore) -> Result<R>) -> Result<R> {
        let mut store = self.lock_store()?;
        f(&mut **store)
    }

    /// Sync one provider over `range`.
    ///
    /// Unknown and unconfigured providers return an outcome without touching
    /// the store. Fetch failures are recorded as an error outcome. Only a
    /// failure to persist is returned as `Err`.
    pub fn sync_provider(&self, id: &str, range: &DateRange) -> Result<SyncOutcome> {
        let Some(provider) = self.providers.iter().find(|p| p.id() == id) else {
            warn!(provider = id, "sync requested for unknown provider");
            return Ok(SyncOutcome::new(
                id,
                SyncStatus::Error,
                Error::UnknownProvider(id.to_string()).to_string(),
            ));
        };

        if !provider.is_configured() {
            let message = format!("{}: not configured, skipping", provider.display_name());
            info!(provider = id, "{message}");
            return Ok(SyncOutcome::new(id, SyncStatus::Skipped, message));
        }

        let synced_at = Utc::now();
        let rows = match provider.fetch_usage(range) {
            Ok(rows) => rows,
            Err(e) => {
                let message = truncate_message(&e.to_string());
                error!(provider = id, %range, error = %message, "fetch failed");
                let mut outcome = SyncOutcome::new(id, SyncStatus::Error, message);
                outcome.synced_at = synced_at;
                self.lock_store()?.append_outcome(&outcome)?;
                return Ok(outcome);
            }
        };

        // Rows and their outcome land under one lock so a concurrent pass
        // never interleaves its audit entry between them.
        let mut store = self.lock_store()?;
        let written = store.upsert_buckets(&rows, synced_at)?;
        let mut outcome = SyncOutcome::new(
            id,
            SyncStatus::Ok,
            format!("{written} rows upserted"),
        );
        outcome.synced_at = synced_at;
        outcome.rows = written;
        store.append_outcome(&outcome)?;
        drop(store);

        info!(provider = id, %range, rows = written, "synced");
        Ok(outcome)
    }

    /// Sync every registered provider in order. A failure in one never
    /// changes the outcome of another.
    pub fn sync_all(&self, range: &DateRange) -> Vec<SyncOutcome> {
        info!(%range, providers = self.providers.len(), "starting full sync");
        let outcomes: Vec<SyncOutcome> = self
            .providers
            .iter()
            .map(|p| {
                self.sync_provider(p.id(), range).unwrap_or_else(|e| {
                    error!(provider = p.id(), error = %e, "persisting sync result failed");
                    SyncOutcome::new(p.id(), SyncStatus::Error, truncate_message(&e.to_string()))
                })
            })
            .collect();
        info!(
            ok = outcomes.iter().filter(|o| o.status == SyncStatus::Ok).count(),
            "full sync complete"
        );
        outcomes
    }

    /// Drop every usage row, then recompute `range` from source.
    pub fn rebuild(&self, range: &DateRange) -> Result<(usize, Vec<SyncOutcome>)> {
        let removed = self.lock_store()?.rebuild()?;
        info!(rows = removed, "dropped usage rows for rebuild");
        Ok((removed, self.sync_all(range)))
    }
}
