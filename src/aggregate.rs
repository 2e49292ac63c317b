use std::collections::HashMap;

use crate::cost::{resolve_event_cost, PricingMap};
use crate::types::{BucketKey, DateRange, LogicalEvent, UsageBucket, UsageCounters};

/// Which events an aggregation pass keeps.
#[derive(Debug, Clone, Default)]
pub struct AggregateFilter {
    /// Case-insensitive model-name prefixes. Empty keeps every model.
    pub model_prefixes: Vec<String>,
    /// Inclusive calendar-date bounds on the event's UTC date.
    pub range: Option<DateRange>,
    /// Key buckets under this provider instead of the event's own.
    pub provider_label: Option<String>,
}

impl AggregateFilter {
    /// How many times the event is folded: once per matching prefix, or once
    /// when no prefixes are configured.
    fn prefix_matches(&self, model: &str) -> usize {
        if self.model_prefixes.is_empty() {
            return 1;
        }
        let model = model.to_lowercase();
        self.model_prefixes
            .iter()
            .filter(|p| model.starts_with(&p.to_lowercase()))
            .count()
    }
}

/// Why events were left out of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub folded: usize,
    pub no_timestamp: usize,
    pub no_signal: usize,
    pub out_of_range: usize,
    pub prefix_mismatch: usize,
}

/// Accumulator for one aggregation pass. Owned by the caller, never shared
/// between passes.
pub struct Aggregator<'a> {
    filter: &'a AggregateFilter,
    pricing: Option<&'a dyn PricingMap>,
    buckets: HashMap<BucketKey, UsageCounters>,
    stats: FoldStats,
}

impl<'a> Aggregator<'a> {
    pub fn new(filter: &'a AggregateFilter, pricing: Option<&'a dyn PricingMap>) -> Self {
        Self {
            filter,
            pricing,
            buckets: HashMap::new(),
            stats: FoldStats::default(),
        }
    }

    pub fn fold(&mut self, event: &LogicalEvent) {
        let Some(ts) = event.timestamp else {
            self.stats.no_timestamp += 1;
            return;
        };
        if !event.has_signal() {
            self.stats.no_signal += 1;
            return;
        }
        if let Some(range) = &self.filter.range {
            if !range.contains(ts.date_naive()) {
                self.stats.out_of_range += 1;
                return;
            }
        }
        let model = event.model_or_unknown();
        let matches = self.filter.prefix_matches(model);
        if matches == 0 {
            self.stats.prefix_mismatch += 1;
            return;
        }

        let provider = self
            .filter
            .provider_label
            .as_deref()
            .unwrap_or(&event.provider);
        let cost = resolve_event_cost(event, self.pricing).unwrap_or(0.0);

        // Single entry lookup per event
        let counters = self
            .buckets
            .entry(BucketKey::at(provider, model, ts))
            .or_default();
        for _ in 0..matches {
            counters.accumulate(event, cost);
        }
        self.stats.folded += 1;
    }

    pub fn stats(&self) -> FoldStats {
        self.stats
    }

    /// Flatten into rows sorted by (provider, model, date, hour).
    pub fn finish(self) -> Vec<UsageBucket> {
        let mut rows: Vec<UsageBucket> = self
            .buckets
            .into_iter()
            .map(|(key, counters)| UsageBucket { key, counters })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}

pub fn aggregate<'e, I>(
    events: I,
    filter: &AggregateFilter,
    pricing: Option<&dyn PricingMap>,
) -> Vec<UsageBucket>
where
    I: IntoIterator<Item = &'e LogicalEvent>,
{
    let mut agg = Aggregator::new(filter, pricing);
    for event in events {
        agg.fold(event);
    }
    agg.finish()
}
