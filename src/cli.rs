use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::pricing::PricingSource;
use crate::types::DateRange;

#[derive(Parser, Debug)]
#[command(
    name = "clawmeter",
    version,
    about = "Hourly usage and cost buckets from OpenClaw session logs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Runtime state directory (default: $OPENCLAW_HOME or ~/.openclaw)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Pricing source: builtin, litellm
    #[arg(long, global = true)]
    pub pricing_source: Option<PricingSource>,

    /// Use cached pricing only, don't fetch
    #[arg(long, global = true)]
    pub offline: bool,

    /// Output format: table (default), json
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,
}

/// Date window of a sync pass. Defaults to the configured lookback.
#[derive(Args, Debug, Clone, Default)]
pub struct RangeArgs {
    /// Trailing window in days, ending today
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub days: Option<u32>,

    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// End date (YYYY-MM-DD), default today
    #[arg(long)]
    pub to: Option<NaiveDate>,
}

impl RangeArgs {
    pub fn resolve(&self, today: NaiveDate, default_days: u32) -> crate::Result<DateRange> {
        match (self.days, self.from, self.to) {
            (Some(days), ..) => Ok(DateRange::trailing_days(today, days)),
            (None, None, None) => Ok(DateRange::trailing_days(today, default_days)),
            (None, from, to) => {
                let end = to.unwrap_or(today);
                let start = from.unwrap_or_else(|| DateRange::trailing_days(end, default_days).start);
                DateRange::new(start, end)
            }
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one sync pass and exit
    Sync {
        /// Only this provider (anthropic, google, moonshot, tools)
        #[arg(long)]
        provider: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Sync now, then on a timer until interrupted
    Run {
        #[arg(long)]
        interval_hours: Option<u64>,
        /// Also sync when session files change
        #[arg(long)]
        watch: bool,
    },
    /// Drop all usage rows and recompute them from the logs
    Rebuild {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Show stored usage rows
    Usage {
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// End date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Show the sync audit trail, newest first
    Log {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List providers, whether they are configured and their last sync
    Providers,
    /// Running totals of the active session (or the given file)
    Session {
        path: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Table,
    Json,
}
