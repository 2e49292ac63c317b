use tracing::info;

use super::{scan_session_files, EventSources, UsageProvider};
use crate::error::Result;
use crate::tools::ToolCallAggregator;
use crate::types::{DateRange, UsageBucket};

/// Tool invocations from every session, stored as call-count rows with the
/// tool category as provider and the tool name as model.
pub struct ToolCallProvider {
    sources: EventSources,
}

impl ToolCallProvider {
    pub fn new(sources: EventSources) -> Self {
        Self { sources }
    }
}

impl UsageProvider for ToolCallProvider {
    fn id(&self) -> &str {
        "tools"
    }

    fn display_name(&self) -> &str {
        "Tool Calls"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn fetch_usage(&self, range: &DateRange) -> Result<Vec<UsageBucket>> {
        let range = *range;
        let per_file = scan_session_files(self.id(), &self.sources.sessions_root(), |lines| {
            let mut agg = ToolCallAggregator::new(Some(range));
            for line in lines {
                agg.fold_line(line);
            }
            agg
        })?;

        let mut total = ToolCallAggregator::new(Some(range));
        for agg in per_file {
            total.merge(agg);
        }
        let stats = total.stats();
        let rows: Vec<UsageBucket> = total.finish().into_iter().map(UsageBucket::from).collect();

        info!(
            provider = self.id(),
            %range,
            calls = stats.counted,
            untimed = stats.untimed,
            rows = rows.len(),
            "aggregated tool calls"
        );
        Ok(rows)
    }
}
