//! Running totals for the session the agent runtime is writing right now.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::cost::PricingMap;
use crate::error::Result;
use crate::extract::{extract_session_event, message_role, session_timestamp, Object};
use crate::source::{discover_lock_markers, read_json_lines, session_id_from_path};
use crate::types::{ModelTotals, SessionSnapshot};

/// The session file whose lock marker is present, most recently modified
/// first. The lock is a liveness hint left by the runtime, not a real lock.
pub fn find_active_session(root: &Path) -> Option<PathBuf> {
    discover_lock_markers(root)
        .files
        .into_iter()
        .filter_map(|lock| {
            let name = lock.path.file_name()?.to_str()?;
            let companion = lock.path.with_file_name(name.strip_suffix(".lock")?);
            let mtime = std::fs::metadata(&companion).ok()?.modified().ok()?;
            Some((mtime, companion))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}

/// Fold one session's lines. No time bucketing and no filters.
///
/// `started_at` is the earliest timestamp on any line. Every assistant line
/// counts as a message, with or without usage.
pub fn snapshot_from_lines(session_id: &str, lines: &[Object]) -> SessionSnapshot {
    let mut started_at: Option<DateTime<Utc>> = None;
    let mut last_activity: Option<DateTime<Utc>> = None;
    let mut message_count = 0;
    let mut by_model: BTreeMap<String, ModelTotals> = BTreeMap::new();

    for line in lines {
        if let Some(ts) = session_timestamp(line) {
            started_at = Some(started_at.map_or(ts, |s| s.min(ts)));
            last_activity = Some(last_activity.map_or(ts, |l| l.max(ts)));
        }
        if message_role(line) != Some("assistant") {
            continue;
        }
        message_count += 1;
        if let Some(event) = extract_session_event(line).filter(|e| e.has_signal()) {
            by_model
                .entry(event.model_or_unknown().to_string())
                .or_default()
                .accumulate(&event);
        }
    }

    SessionSnapshot {
        session_id: session_id.to_string(),
        started_at,
        last_activity,
        message_count,
        by_model,
    }
}

/// Read a session file in a single open/read/close and fold it.
pub fn read_session(path: &Path) -> Result<SessionSnapshot> {
    let (lines, stats) = read_json_lines(path)?;
    debug!(
        path = %path.display(),
        lines = stats.lines,
        malformed = stats.malformed,
        truncated_tail = stats.truncated_tail,
        "read session file"
    );
    Ok(snapshot_from_lines(&session_id_from_path(path), &lines))
}

impl SessionSnapshot {
    /// Cost from the pricing table per model, falling back to the costs
    /// embedded in the log for models the table does not know.
    pub fn total_cost(&self, pricing: &dyn PricingMap) -> f64 {
        self.by_model
            .iter()
            .map(|(model, totals)| {
                pricing
                    .cost_for_totals(model, totals)
                    .or(totals.embedded_cost)
                    .unwrap_or(0.0)
            })
            .sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.by_model
            .values()
            .map(ModelTotals::total_tokens)
            .fold(0, u64::saturating_add)
    }

    pub fn duration_minutes(&self) -> i64 {
        match (self.started_at, self.last_activity) {
            (Some(start), Some(end)) => (end - start).num_minutes(),
            _ => 0,
        }
    }

    pub fn models_used(&self) -> Vec<&str> {
        self.by_model.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cost_usd: f64,
    pub tokens: u64,
}

/// A snapshot plus the derived figures a status view or alert needs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub duration_minutes: i64,
    pub cost_warning: bool,
    pub token_warning: bool,
    pub warning_threshold_usd: f64,
    pub warning_threshold_tokens: u64,
}

pub fn evaluate(
    snapshot: SessionSnapshot,
    pricing: &dyn PricingMap,
    thresholds: Thresholds,
) -> SessionStatus {
    let total_cost_usd = snapshot.total_cost(pricing);
    let total_tokens = snapshot.total_tokens();
    SessionStatus {
        duration_minutes: snapshot.duration_minutes(),
        cost_warning: total_cost_usd >= thresholds.cost_usd,
        token_warning: total_tokens >= thresholds.tokens,
        warning_threshold_usd: thresholds.cost_usd,
        warning_threshold_tokens: thresholds.tokens,
        total_cost_usd,
        total_tokens,
        snapshot,
    }
}
