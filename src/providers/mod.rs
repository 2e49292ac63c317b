pub mod logs;
pub mod tool_calls;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::cost::PricingMap;
use crate::error::{Error, Result};
use crate::extract::Object;
use crate::source::{discover_event_files, read_json_lines, DiscoveredFile, LineStats};
use crate::types::{DateRange, UsageBucket};

pub use logs::LogProvider;
pub use tool_calls::ToolCallProvider;

/// One upstream source of usage, synced as a unit.
pub trait UsageProvider: Send + Sync {
    /// Store key, e.g. "anthropic".
    fn id(&self) -> &str;
    fn display_name(&self) -> &str;
    /// False is the normal state for a source the operator has not enabled.
    fn is_configured(&self) -> bool;
    /// Recompute the full truth for `range` from source. Never incremental.
    fn fetch_usage(&self, range: &DateRange) -> Result<Vec<UsageBucket>>;
    /// What the user has to set to enable this provider.
    fn requirement(&self) -> Option<&str> {
        None
    }
}

/// How a provider decides it is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    /// A non-blank environment variable.
    Env(&'static str),
    Always,
}

impl Credential {
    pub fn is_present(&self) -> bool {
        match self {
            Credential::Env(var) => std::env::var(var).is_ok_and(|v| !v.trim().is_empty()),
            Credential::Always => true,
        }
    }
}

/// Where the agent runtime writes its logs.
#[derive(Debug, Clone)]
pub struct EventSources {
    /// Runtime state directory; sessions live under `agents/<agent>/sessions/`.
    pub state_dir: PathBuf,
    /// Optional flat gateway log, read as an extra input.
    pub gateway_log: Option<PathBuf>,
}

impl EventSources {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            gateway_log: None,
        }
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.state_dir.join("agents")
    }
}

/// A log-backed provider: the model prefixes it owns and its enable check.
pub struct ProviderSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub model_prefixes: &'static [&'static str],
    pub credential: Credential,
}

pub const LOG_PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        id: "anthropic",
        display_name: "Anthropic",
        model_prefixes: &["claude-"],
        credential: Credential::Env("ANTHROPIC_API_KEY"),
    },
    ProviderSpec {
        id: "google",
        display_name: "Google Gemini",
        model_prefixes: &["gemini-"],
        credential: Credential::Env("GEMINI_API_KEY"),
    },
    ProviderSpec {
        id: "moonshot",
        display_name: "Moonshot / Kimi",
        model_prefixes: &["kimi-", "moonshot-"],
        credential: Credential::Env("MOONSHOT_API_KEY"),
    },
];

pub fn all_providers(
    sources: &EventSources,
    pricing: Arc<dyn PricingMap + Send + Sync>,
) -> Vec<Box<dyn UsageProvider>> {
    let mut providers: Vec<Box<dyn UsageProvider>> = LOG_PROVIDERS
        .iter()
        .map(|spec| {
            Box::new(LogProvider::from_spec(spec, sources.clone(), pricing.clone()))
                as Box<dyn UsageProvider>
        })
        .collect();
    providers.push(Box::new(ToolCallProvider::new(sources.clone())));
    providers
}

/// Discover every session file under `root` and run `parse` over each one
/// in parallel. Files that vanish between discovery and read count as empty.
pub(crate) fn scan_session_files<F, T>(provider: &str, root: &Path, parse: F) -> Result<Vec<T>>
where
    F: Fn(&[Object]) -> T + Sync,
    T: Send,
{
    let discovery = discover_event_files(root);
    if discovery.source_absent {
        debug!(provider, root = %root.display(), "no session directory, nothing to scan");
        return Ok(Vec::new());
    }

    let results: Vec<Result<Option<(T, LineStats)>>> = discovery
        .files
        .par_iter()
        .map(|file| parse_one(file, &parse))
        .collect();

    let mut out = Vec::with_capacity(results.len());
    let mut totals = LineStats::default();
    for result in results {
        if let Some((parsed, stats)) = result.map_err(|e| Error::fetch(provider, e))? {
            totals.merge(&stats);
            out.push(parsed);
        }
    }

    debug!(
        provider,
        files = discovery.files.len(),
        lines = totals.lines,
        malformed = totals.malformed,
        "scanned session files"
    );
    Ok(out)
}

fn parse_one<F, T>(file: &DiscoveredFile, parse: &F) -> Result<Option<(T, LineStats)>>
where
    F: Fn(&[Object]) -> T,
{
    match read_json_lines(&file.path) {
        Ok((lines, stats)) => {
            if stats.malformed > 0 {
                warn!(
                    path = %file.path.display(),
                    malformed = stats.malformed,
                    "skipped malformed lines"
                );
            }
            Ok(Some((parse(&lines), stats)))
        }
        Err(e) if e.is_source_absent() => {
            debug!(path = %file.path.display(), "session file vanished before read");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::NoPricing;

    #[test]
    fn registry_lists_every_provider_once() {
        let providers = all_providers(&EventSources::new("/nonexistent"), Arc::new(NoPricing));
        let ids: Vec<&str> = providers.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["anthropic", "google", "moonshot", "tools"]);
    }

    #[test]
    fn tool_provider_needs_no_credential() {
        let providers = all_providers(&EventSources::new("/nonexistent"), Arc::new(NoPricing));
        let tools = providers.iter().find(|p| p.id() == "tools").expect("tools");
        assert!(tools.is_configured());
        assert!(tools.requirement().is_none());
    }

    #[test]
    fn blank_credential_is_not_present() {
        assert!(Credential::Always.is_present());
        assert!(!Credential::Env("CLAWMETER_TEST_SURELY_UNSET_VAR").is_present());
    }

    #[test]
    fn missing_root_scans_to_nothing() {
        let out = scan_session_files("p", Path::new("/nonexistent/agents"), |lines| lines.len())
            .expect("scan");
        assert!(out.is_empty());
    }
}
