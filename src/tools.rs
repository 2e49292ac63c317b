//! Tool invocation counts from assistant message content.

use std::collections::HashMap;

use crate::extract::{first_string, message_of, session_timestamp, Object};
use crate::types::{BucketKey, DateRange, ToolBucket, UNKNOWN};

pub const TOOL_CALL_TYPES: &[&str] = &["toolCall", "tool_use", "tool_call"];
pub const TOOL_NAME_KEYS: &[&str] = &["name", "toolName", "tool_name"];

pub const OTHER_CATEGORY: &str = "other";

/// Raw tool name → coarse category. Names not listed land in `other`.
const CATEGORIES: &[(&str, &str)] = &[
    ("web_search", "web"),
    ("web_fetch", "web"),
    ("browser", "browser"),
    ("exec", "shell"),
    ("process", "shell"),
    ("bash", "shell"),
    ("read", "filesystem"),
    ("write", "filesystem"),
    ("edit", "filesystem"),
    ("apply_patch", "filesystem"),
    ("image", "image"),
    ("message", "messaging"),
    ("cron", "scheduler"),
    ("sessions_spawn", "sessions"),
    ("sessions_send", "sessions"),
    ("sessions_list", "sessions"),
    ("sessions_history", "sessions"),
    ("memory_search", "memory"),
    ("memory_get", "memory"),
];

pub fn category_for(tool: &str) -> &'static str {
    CATEGORIES
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, category)| *category)
        .unwrap_or(OTHER_CATEGORY)
}

/// Names of the tool invocations in one assistant line, in content order.
pub fn tool_calls(line: &Object) -> Vec<&str> {
    let Some(message) = message_of(line) else {
        return Vec::new();
    };
    if message.get("role").and_then(|v| v.as_str()) != Some("assistant") {
        return Vec::new();
    }
    let Some(content) = message.get("content").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    content
        .iter()
        .filter_map(|item| item.as_object())
        .filter(|item| {
            item.get("type")
                .and_then(|t| t.as_str())
                .is_some_and(|t| TOOL_CALL_TYPES.contains(&t))
        })
        .map(|item| first_string(item, TOOL_NAME_KEYS).unwrap_or(UNKNOWN))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolStats {
    /// Invocations that landed in a bucket.
    pub counted: u64,
    /// Invocations on lines without a usable timestamp.
    pub untimed: u64,
    pub out_of_range: u64,
}

pub struct ToolCallAggregator {
    range: Option<DateRange>,
    buckets: HashMap<BucketKey, u64>,
    stats: ToolStats,
}

impl ToolCallAggregator {
    pub fn new(range: Option<DateRange>) -> Self {
        Self {
            range,
            buckets: HashMap::new(),
            stats: ToolStats::default(),
        }
    }

    pub fn fold_line(&mut self, line: &Object) {
        let calls = tool_calls(line);
        if calls.is_empty() {
            return;
        }
        let Some(ts) = session_timestamp(line) else {
            self.stats.untimed += calls.len() as u64;
            return;
        };
        if self.range.is_some_and(|r| !r.contains(ts.date_naive())) {
            self.stats.out_of_range += calls.len() as u64;
            return;
        }
        for name in calls {
            *self
                .buckets
                .entry(BucketKey::at(category_for(name), name, ts))
                .or_default() += 1;
            self.stats.counted += 1;
        }
    }

    pub fn merge(&mut self, other: ToolCallAggregator) {
        for (key, count) in other.buckets {
            *self.buckets.entry(key).or_default() += count;
        }
        self.stats.counted += other.stats.counted;
        self.stats.untimed += other.stats.untimed;
        self.stats.out_of_range += other.stats.out_of_range;
    }

    pub fn stats(&self) -> ToolStats {
        self.stats
    }

    /// Rows sorted by (category, tool, date, hour).
    pub fn finish(self) -> Vec<ToolBucket> {
        let mut rows: Vec<ToolBucket> = self
            .buckets
            .into_iter()
            .map(|(key, call_count)| ToolBucket { key, call_count })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}
