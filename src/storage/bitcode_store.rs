use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{latest_per_provider, StoredBucket, UsageStore};
use crate::error::{Error, Result};
use crate::types::{BucketKey, DateRange, SyncOutcome, UsageBucket};

const FORMAT_VERSION: u32 = 1;

/// Single-file store: `~/.local/share/clawmeter/usage.bin`.
///
/// Every mutation runs under an advisory lock on `usage.bin.lock`: the file
/// is re-read, the change applied, and the result written through a temp
/// file and a rename. Writes from another process in between are kept. The
/// in-memory state only changes once the write succeeded.
pub struct BitcodeStore {
    path: Option<PathBuf>,
    state: State,
    retention: usize,
}

#[derive(Debug, Clone, Default)]
struct State {
    rows: BTreeMap<BucketKey, StoredBucket>,
    outcomes: VecDeque<SyncOutcome>,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    version: u32,
    rows: Vec<StoredBucket>,
    outcomes: Vec<SyncOutcome>,
}

impl From<StoreFile> for State {
    fn from(file: StoreFile) -> Self {
        Self {
            rows: file
                .rows
                .into_iter()
                .map(|row| (row.bucket.key.clone(), row))
                .collect(),
            outcomes: file.outcomes.into(),
        }
    }
}

impl State {
    fn to_file(&self) -> StoreFile {
        StoreFile {
            version: FORMAT_VERSION,
            rows: self.rows.values().cloned().collect(),
            outcomes: self.outcomes.iter().cloned().collect(),
        }
    }
}

fn load(path: &Path) -> StoreFile {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StoreFile::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read store, starting empty");
            return StoreFile::default();
        }
    };
    match bitcode::deserialize::<StoreFile>(&data) {
        Ok(file) if file.version == FORMAT_VERSION => file,
        Ok(file) => {
            // Rows are recomputed from the session logs on the next sync.
            warn!(
                found = file.version,
                expected = FORMAT_VERSION,
                "store format changed, starting empty"
            );
            StoreFile::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "store is unreadable, starting empty");
            StoreFile::default()
        }
    }
}

fn write(path: &Path, state: &State) -> Result<()> {
    let data = bitcode::serialize(&state.to_file())?;
    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, data).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}

impl BitcodeStore {
    pub fn open(path: PathBuf, retention: usize) -> Self {
        let file = load(&path);
        debug!(
            path = %path.display(),
            rows = file.rows.len(),
            outcomes = file.outcomes.len(),
            "opened store"
        );
        Self {
            path: Some(path),
            state: file.into(),
            retention,
        }
    }

    pub fn in_memory(retention: usize) -> Self {
        Self {
            path: None,
            state: State::default(),
            retention,
        }
    }

    /// Apply `change` to the latest persisted state and write it back.
    fn update<R>(&mut self, change: impl FnOnce(&mut State) -> R) -> Result<R> {
        let Some(path) = &self.path else {
            let mut next = self.state.clone();
            let out = change(&mut next);
            self.state = next;
            return Ok(out);
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let lock_path = path.with_extension("bin.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::io(&lock_path, e))?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock.write().map_err(|e| Error::io(&lock_path, e))?;

        let mut next = State::from(load(path));
        let out = change(&mut next);
        write(path, &next)?;
        self.state = next;
        Ok(out)
    }
}

impl UsageStore for BitcodeStore {
    fn upsert_buckets(&mut self, rows: &[UsageBucket], synced_at: DateTime<Utc>) -> Result<usize> {
        self.update(|state| {
            for bucket in rows {
                state.rows.insert(
                    bucket.key.clone(),
                    StoredBucket {
                        bucket: bucket.clone(),
                        synced_at,
                    },
                );
            }
        })?;
        Ok(rows.len())
    }

    fn append_outcome(&mut self, outcome: &SyncOutcome) -> Result<()> {
        let retention = self.retention;
        self.update(|state| {
            state.outcomes.push_back(outcome.clone());
            while state.outcomes.len() > retention {
                state.outcomes.pop_front();
            }
        })
    }

    fn buckets(&self, range: Option<&DateRange>) -> Result<Vec<StoredBucket>> {
        Ok(self
            .state
            .rows
            .values()
            .filter(|row| range.map_or(true, |r| r.contains(row.bucket.key.date)))
            .cloned()
            .collect())
    }

    fn recent_outcomes(&self, limit: usize) -> Result<Vec<SyncOutcome>> {
        Ok(self.state.outcomes.iter().rev().take(limit).cloned().collect())
    }

    fn latest_outcomes(&self) -> Result<Vec<SyncOutcome>> {
        Ok(latest_per_provider(
            self.state.outcomes.iter().rev().cloned().collect(),
        ))
    }

    fn rebuild(&mut self) -> Result<usize> {
        self.update(|state| {
            let removed = state.rows.len();
            state.rows.clear();
            removed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SyncStatus, UsageCounters};
    use tempfile::tempdir;

    fn bucket(provider: &str, model: &str, date: &str, hour: u8, input: u64) -> UsageBucket {
        UsageBucket {
            key: BucketKey {
                provider: provider.into(),
                label: model.into(),
                date: date.parse().unwrap(),
                hour,
            },
            counters: UsageCounters {
                input_tokens: input,
                request_count: 1,
                ..UsageCounters::default()
            },
        }
    }

    #[test]
    fn upsert_replaces_instead_of_adding() {
        let mut store = BitcodeStore::in_memory(10);
        let now = Utc::now();
        store
            .upsert_buckets(&[bucket("p", "m", "2026-02-18", 8, 100)], now)
            .expect("first upsert");
        store
            .upsert_buckets(&[bucket("p", "m", "2026-02-18", 8, 40)], now)
            .expect("second upsert");
        let rows = store.buckets(None).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket.counters.input_tokens, 40);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested/usage.bin");
        {
            let mut store = BitcodeStore::open(path.clone(), 10);
            store
                .upsert_buckets(
                    &[
                        bucket("p", "m", "2026-02-18", 9, 1),
                        bucket("a", "m", "2026-02-18", 8, 2),
                    ],
                    Utc::now(),
                )
                .expect("upsert");
            store
                .append_outcome(&SyncOutcome::new("p", SyncStatus::Ok, "2 rows upserted"))
                .expect("outcome");
        }
        let store = BitcodeStore::open(path, 10);
        let rows = store.buckets(None).expect("rows");
        let providers: Vec<&str> = rows.iter().map(|r| r.bucket.key.provider.as_str()).collect();
        assert_eq!(providers, vec!["a", "p"]);
        assert_eq!(store.recent_outcomes(5).expect("outcomes").len(), 1);
    }

    #[test]
    fn two_handles_on_one_file_keep_each_others_writes() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("usage.bin");
        let mut manual = BitcodeStore::open(path.clone(), 10);
        let mut daemon = BitcodeStore::open(path.clone(), 10);

        manual
            .upsert_buckets(&[bucket("moonshot", "kimi-k2.5", "2026-02-18", 8, 5)], Utc::now())
            .expect("manual upsert");
        manual
            .append_outcome(&SyncOutcome::new("moonshot", SyncStatus::Ok, "manual"))
            .expect("manual outcome");
        daemon
            .upsert_buckets(&[bucket("google", "gemini-3-pro", "2026-02-18", 9, 7)], Utc::now())
            .expect("daemon upsert");
        daemon
            .append_outcome(&SyncOutcome::new("google", SyncStatus::Ok, "timer"))
            .expect("daemon outcome");

        let reopened = BitcodeStore::open(path, 10);
        let trail: Vec<String> = reopened
            .recent_outcomes(10)
            .expect("outcomes")
            .into_iter()
            .map(|o| o.message)
            .collect();
        assert_eq!(trail, vec!["timer", "manual"]);
        assert_eq!(reopened.buckets(None).expect("rows").len(), 2);
        assert_eq!(daemon.buckets(None).expect("rows").len(), 2);
    }

    #[test]
    fn failed_write_leaves_state_untouched() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("usage.bin");
        fs::create_dir_all(&path).expect("directory in place of the store");
        let mut store = BitcodeStore::open(path, 10);

        let result = store.upsert_buckets(&[bucket("p", "m", "2026-02-18", 8, 1)], Utc::now());
        assert!(result.is_err());
        assert!(store.buckets(None).expect("rows").is_empty());

        assert!(store
            .append_outcome(&SyncOutcome::new("p", SyncStatus::Ok, "never written"))
            .is_err());
        assert!(store.recent_outcomes(10).expect("outcomes").is_empty());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("usage.bin");
        fs::write(&path, b"definitely not bitcode").expect("write garbage");
        let store = BitcodeStore::open(path, 10);
        assert!(store.buckets(None).expect("rows").is_empty());
    }

    #[test]
    fn outcome_retention_drops_oldest() {
        let mut store = BitcodeStore::in_memory(2);
        for msg in ["one", "two", "three"] {
            store
                .append_outcome(&SyncOutcome::new("p", SyncStatus::Ok, msg))
                .expect("append");
        }
        let recent = store.recent_outcomes(10).expect("recent");
        let messages: Vec<&str> = recent.iter().map(|o| o.message.as_str()).collect();
        assert_eq!(messages, vec!["three", "two"]);
    }

    #[test]
    fn rebuild_keeps_audit_trail() {
        let mut store = BitcodeStore::in_memory(10);
        store
            .upsert_buckets(&[bucket("p", "m", "2026-02-18", 8, 1)], Utc::now())
            .expect("upsert");
        store
            .append_outcome(&SyncOutcome::new("p", SyncStatus::Ok, "1 rows upserted"))
            .expect("append");
        assert_eq!(store.rebuild().expect("rebuild"), 1);
        assert!(store.buckets(None).expect("rows").is_empty());
        assert_eq!(store.latest_outcomes().expect("latest").len(), 1);
    }

    #[test]
    fn range_filter_is_inclusive() {
        let mut store = BitcodeStore::in_memory(10);
        store
            .upsert_buckets(
                &[
                    bucket("p", "m", "2026-02-17", 23, 1),
                    bucket("p", "m", "2026-02-18", 0, 1),
                    bucket("p", "m", "2026-02-19", 0, 1),
                ],
                Utc::now(),
            )
            .expect("upsert");
        let range = DateRange::new("2026-02-18".parse().unwrap(), "2026-02-19".parse().unwrap())
            .unwrap();
        assert_eq!(store.buckets(Some(&range)).expect("rows").len(), 2);
    }
}
