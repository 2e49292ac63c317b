//! Periodic and on-demand sync passes on a background thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::source::{classify, FileKind};
use crate::sync::SyncDriver;
use crate::types::DateRange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Sync one provider, or all of them when `None`.
    Manual(Option<String>),
    FilesChanged,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub lookback_days: u32,
    /// Directory to watch for session writes; `None` disables watching.
    pub watch_root: Option<PathBuf>,
    pub debounce: Duration,
}

pub struct SchedulerHandle {
    tx: Sender<Trigger>,
    thread: Option<JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl SchedulerHandle {
    /// Queue a sync. It runs after whatever pass is in progress.
    pub fn request_sync(&self, provider: Option<String>) -> Result<()> {
        self.tx
            .send(Trigger::Manual(provider))
            .context("scheduler thread has stopped")
    }

    /// Block until the scheduler thread exits.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }

    /// Stop after the current pass and wait for the thread.
    pub fn shutdown(self) {
        let _ = self.tx.send(Trigger::Shutdown);
        self.join();
    }
}

fn lookback_range(days: u32) -> DateRange {
    DateRange::trailing_days(Utc::now().date_naive(), days)
}

/// Swallow further file events until none arrive for `window`. Returns the
/// first non-file trigger that interrupted the wait, if any.
fn debounce(rx: &Receiver<Trigger>, window: Duration) -> Option<Trigger> {
    let mut deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match rx.recv_timeout(remaining) {
            Ok(Trigger::FilesChanged) => deadline = Instant::now() + window,
            Ok(other) => return Some(other),
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => return Some(Trigger::Shutdown),
        }
    }
}

fn run_manual(driver: &SyncDriver, provider: Option<String>, range: &DateRange) {
    match provider {
        Some(id) => match driver.sync_provider(&id, range) {
            Ok(outcome) => info!(provider = %id, status = %outcome.status, "manual sync done"),
            Err(e) => error!(provider = %id, error = %e, "manual sync failed to persist"),
        },
        None => {
            driver.sync_all(range);
        }
    }
}

fn run_loop(driver: Arc<SyncDriver>, config: ScheduleConfig, rx: Receiver<Trigger>) {
    driver.sync_all(&lookback_range(config.lookback_days));
    let mut next_due = Instant::now() + config.interval;
    let mut pending: Option<Trigger> = None;

    loop {
        let trigger = match pending.take() {
            Some(t) => t,
            None => {
                let wait = next_due.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(t) => t,
                    Err(RecvTimeoutError::Timeout) => {
                        debug!("sync interval elapsed");
                        driver.sync_all(&lookback_range(config.lookback_days));
                        next_due = Instant::now() + config.interval;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        match trigger {
            Trigger::Manual(provider) => {
                run_manual(&driver, provider, &lookback_range(config.lookback_days));
            }
            Trigger::FilesChanged => {
                pending = debounce(&rx, config.debounce);
                debug!("session files changed");
                driver.sync_all(&lookback_range(config.lookback_days));
            }
            Trigger::Shutdown => break,
        }
    }
    info!("scheduler stopped");
}

fn start_watcher(root: &Path, tx: Sender<Trigger>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        // Lock markers come and go with every turn and carry no usage.
        let relevant = event
            .paths
            .iter()
            .any(|p| matches!(classify(p), Some(kind) if kind != FileKind::Lock));
        if relevant {
            let _ = tx.send(Trigger::FilesChanged);
        }
    })?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("cannot watch {}", root.display()))?;
    Ok(watcher)
}

/// Run a full pass now, then every `interval`, plus on request and (when a
/// watch root is set) after session files settle.
pub fn spawn(driver: Arc<SyncDriver>, config: ScheduleConfig) -> Result<SchedulerHandle> {
    let (tx, rx) = mpsc::channel();

    let watcher = match &config.watch_root {
        Some(root) if root.exists() => Some(start_watcher(root, tx.clone())?),
        Some(root) => {
            warn!(root = %root.display(), "watch root does not exist, relying on the timer");
            None
        }
        None => None,
    };

    info!(
        interval_secs = config.interval.as_secs(),
        lookback_days = config.lookback_days,
        watching = watcher.is_some(),
        "scheduler started"
    );
    let thread = std::thread::Builder::new()
        .name("clawmeter-sync".into())
        .spawn(move || run_loop(driver, config, rx))
        .context("cannot start scheduler thread")?;

    Ok(SchedulerHandle {
        tx,
        thread: Some(thread),
        _watcher: watcher,
    })
}
