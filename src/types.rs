use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Days, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const UNKNOWN: &str = "unknown";

/// One decoded usage-bearing line, before any bucketing.
///
/// Every field is resolved independently, so a line may carry a model but
/// no timestamp, or tokens but no provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogicalEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub provider: String,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    /// Embedded cost in USD. `None` means unknown, not free.
    pub cost: Option<f64>,
}

impl LogicalEvent {
    /// True when at least one token counter or an embedded cost is non-zero.
    pub fn has_signal(&self) -> bool {
        self.input_tokens > 0
            || self.output_tokens > 0
            || self.cache_read_tokens > 0
            || self.cache_write_tokens > 0
            || self.cost.is_some_and(|c| c > 0.0)
    }

    pub fn model_or_unknown(&self) -> &str {
        self.model.as_deref().unwrap_or(UNKNOWN)
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> crate::Result<Self> {
        if start > end {
            return Err(crate::Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// The last `days` days up to and including `today`. A window reaching
    /// past the earliest representable date starts there.
    pub fn trailing_days(today: NaiveDate, days: u32) -> Self {
        Self {
            start: today
                .checked_sub_days(Days::new(u64::from(days)))
                .unwrap_or(NaiveDate::MIN),
            end: today,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Composite key of a materialized row.
///
/// For usage rows `label` is the model; for tool rows it is the tool name and
/// `provider` holds the tool category. Field order gives the sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub provider: String,
    pub label: String,
    pub date: NaiveDate,
    pub hour: u8,
}

impl BucketKey {
    pub fn at(provider: &str, label: &str, ts: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            label: label.to_string(),
            date: ts.date_naive(),
            hour: ts.hour() as u8,
        }
    }
}

/// Counters of a usage bucket. Pure sums, so folding is order-independent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub request_count: u64,
    pub estimated_cost_usd: f64,
}

impl UsageCounters {
    /// Input + output only. Cache tokens never count as billable.
    pub fn billable_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Fold one event into the counters as one request. Counters saturate
    /// at `u64::MAX`.
    pub fn accumulate(&mut self, event: &LogicalEvent, cost: f64) {
        self.input_tokens = self.input_tokens.saturating_add(event.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(event.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(event.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.saturating_add(event.cache_write_tokens);
        self.request_count = self.request_count.saturating_add(1);
        self.estimated_cost_usd += cost;
    }

    /// Accumulate all counters from another set of counters.
    pub fn accumulate_from(&mut self, other: &UsageCounters) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.saturating_add(other.cache_write_tokens);
        self.request_count = self.request_count.saturating_add(other.request_count);
        self.estimated_cost_usd += other.estimated_cost_usd;
    }
}

/// One row of the usage view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub key: BucketKey,
    pub counters: UsageCounters,
}

impl UsageBucket {
    pub fn billable_tokens(&self) -> u64 {
        self.counters.billable_tokens()
    }
}

/// One row of the tool-call view: call counts only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBucket {
    /// `provider` is the tool category, `label` the raw tool name.
    pub key: BucketKey,
    pub call_count: u64,
}

impl From<ToolBucket> for UsageBucket {
    fn from(tool: ToolBucket) -> Self {
        UsageBucket {
            key: tool.key,
            counters: UsageCounters {
                request_count: tool.call_count,
                ..UsageCounters::default()
            },
        }
    }
}

/// Running totals of one model inside a live session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub requests: u64,
    /// Sum of embedded costs; `None` until a line carries one.
    pub embedded_cost: Option<f64>,
}

/// Merge an optional cost into an existing optional accumulator.
fn merge_cost(target: &mut Option<f64>, source: Option<f64>) {
    match (target, source) {
        (Some(ref mut c), Some(v)) => *c += v,
        (t @ None, Some(v)) => *t = Some(v),
        _ => {}
    }
}

impl ModelTotals {
    pub fn accumulate(&mut self, event: &LogicalEvent) {
        self.input_tokens = self.input_tokens.saturating_add(event.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(event.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(event.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.saturating_add(event.cache_write_tokens);
        self.requests = self.requests.saturating_add(1);
        merge_cost(&mut self.embedded_cost, event.cost);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_write_tokens)
    }
}

/// Running totals of the one session file currently being written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub by_model: BTreeMap<String, ModelTotals>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Ok,
    Error,
    Skipped,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Ok => "ok",
            SyncStatus::Error => "error",
            SyncStatus::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ok" => Some(SyncStatus::Ok),
            "error" => Some(SyncStatus::Error),
            "skipped" => Some(SyncStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only sync audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub provider: String,
    pub status: SyncStatus,
    pub message: String,
    pub synced_at: DateTime<Utc>,
    /// Rows written by this attempt; zero unless `status` is ok.
    #[serde(default)]
    pub rows: usize,
}

impl SyncOutcome {
    pub fn new(provider: &str, status: SyncStatus, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            status,
            message: message.into(),
            synced_at: Utc::now(),
            rows: 0,
        }
    }
}
