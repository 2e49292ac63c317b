use std::sync::Arc;

use tracing::{debug, info};

use super::{scan_session_files, Credential, EventSources, ProviderSpec, UsageProvider};
use crate::aggregate::{AggregateFilter, Aggregator};
use crate::cost::PricingMap;
use crate::error::{Error, Result};
use crate::extract::{extract_gateway_event, extract_session_event};
use crate::source::read_json_lines;
use crate::types::{DateRange, LogicalEvent, UsageBucket};

/// Usage for one vendor, read from the runtime's own logs and selected by
/// model-name prefix.
pub struct LogProvider {
    id: String,
    display_name: String,
    model_prefixes: Vec<String>,
    credential: Credential,
    sources: EventSources,
    pricing: Arc<dyn PricingMap + Send + Sync>,
}

impl LogProvider {
    pub fn new(
        id: &str,
        display_name: &str,
        model_prefixes: &[&str],
        credential: Credential,
        sources: EventSources,
        pricing: Arc<dyn PricingMap + Send + Sync>,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            model_prefixes: model_prefixes.iter().map(|p| p.to_string()).collect(),
            credential,
            sources,
            pricing,
        }
    }

    pub fn from_spec(
        spec: &ProviderSpec,
        sources: EventSources,
        pricing: Arc<dyn PricingMap + Send + Sync>,
    ) -> Self {
        Self::new(
            spec.id,
            spec.display_name,
            spec.model_prefixes,
            spec.credential,
            sources,
            pricing,
        )
    }

    fn session_events(&self) -> Result<Vec<LogicalEvent>> {
        let per_file = scan_session_files(&self.id, &self.sources.sessions_root(), |lines| {
            lines
                .iter()
                .filter_map(extract_session_event)
                .collect::<Vec<_>>()
        })?;
        Ok(per_file.into_iter().flatten().collect())
    }

    fn gateway_events(&self) -> Result<Vec<LogicalEvent>> {
        let Some(path) = &self.sources.gateway_log else {
            return Ok(Vec::new());
        };
        match read_json_lines(path) {
            Ok((lines, stats)) => {
                debug!(
                    provider = %self.id,
                    path = %path.display(),
                    lines = stats.lines,
                    malformed = stats.malformed,
                    "read gateway log"
                );
                Ok(lines.iter().map(extract_gateway_event).collect())
            }
            Err(e) if e.is_source_absent() => {
                debug!(provider = %self.id, path = %path.display(), "gateway log absent");
                Ok(Vec::new())
            }
            Err(e) => Err(Error::fetch(&self.id, e)),
        }
    }
}

impl UsageProvider for LogProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn is_configured(&self) -> bool {
        self.credential.is_present()
    }

    fn requirement(&self) -> Option<&str> {
        match self.credential {
            Credential::Env(var) => Some(var),
            Credential::Always => None,
        }
    }

    fn fetch_usage(&self, range: &DateRange) -> Result<Vec<UsageBucket>> {
        let mut events = self.session_events()?;
        events.extend(self.gateway_events()?);

        let filter = AggregateFilter {
            model_prefixes: self.model_prefixes.clone(),
            range: Some(*range),
            provider_label: Some(self.id.clone()),
        };
        let pricing: &dyn PricingMap = self.pricing.as_ref();
        let mut agg = Aggregator::new(&filter, Some(pricing));
        for event in &events {
            agg.fold(event);
        }
        let stats = agg.stats();
        let rows = agg.finish();

        info!(
            provider = %self.id,
            %range,
            events = events.len(),
            folded = stats.folded,
            rows = rows.len(),
            "aggregated usage from logs"
        );
        Ok(rows)
    }
}
