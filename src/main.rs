use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use tracing::warn;

use clawmeter::cli::{Cli, Command, OutputFormat};
use clawmeter::config::{self, Config};
use clawmeter::cost::{NoPricing, PricingMap};
use clawmeter::pricing::{self, CachedPricing};
use clawmeter::providers;
use clawmeter::scheduler::{self, ScheduleConfig};
use clawmeter::session::{self, Thresholds};
use clawmeter::storage::{self, UsageStore};
use clawmeter::sync::SyncDriver;
use clawmeter::types::{DateRange, SyncOutcome};
use clawmeter::{logging, output};

fn load_pricing(cli: &Cli, config: &Config) -> Arc<CachedPricing> {
    let source = cli.pricing_source.or(config.pricing_source).unwrap_or_default();
    let pricing = pricing::load_pricing(source, cli.offline, &config.pricing.models)
        .unwrap_or_else(|e| {
            warn!(error = %e, "pricing unavailable, using built-in rates");
            CachedPricing::builtin().with_overrides(&config.pricing.models)
        });
    Arc::new(pricing)
}

fn open_store(config: &Config) -> Result<Box<dyn UsageStore>> {
    Ok(storage::default_storage(config.sync.outcome_retention)?)
}

fn build_driver(cli: &Cli, config: &Config) -> Result<SyncDriver> {
    let providers = providers::all_providers(&config.event_sources(), load_pricing(cli, config));
    Ok(SyncDriver::new(providers, open_store(config)?))
}

fn print_outcomes(format: OutputFormat, outcomes: &[SyncOutcome]) -> Result<()> {
    match format {
        OutputFormat::Json => output::print_json(outcomes)?,
        OutputFormat::Table => println!("{}", output::outcomes_table(outcomes)),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = config::load_config();
    if let Some(dir) = &cli.state_dir {
        config.sources.state_dir = Some(dir.clone());
    }
    logging::init(&config.logging);

    let today = Utc::now().date_naive();
    let lookback = config.sync.lookback_days;

    match &cli.command {
        Command::Sync { provider, range } => {
            let range = range.resolve(today, lookback)?;
            let driver = build_driver(&cli, &config)?;
            let outcomes = match provider {
                Some(id) => vec![driver.sync_provider(id, &range)?],
                None => driver.sync_all(&range),
            };
            print_outcomes(cli.format, &outcomes)?;
        }
        Command::Run {
            interval_hours,
            watch,
        } => {
            let hours = interval_hours.unwrap_or(config.sync.interval_hours).max(1);
            let watch = *watch || config.sync.watch;
            let schedule = ScheduleConfig {
                interval: Duration::from_secs(hours * 60 * 60),
                lookback_days: lookback,
                watch_root: watch.then(|| config.event_sources().sessions_root()),
                debounce: Duration::from_secs(config.sync.debounce_secs),
            };
            let driver = Arc::new(build_driver(&cli, &config)?);
            scheduler::spawn(driver, schedule)?.join();
        }
        Command::Rebuild { range } => {
            let range = range.resolve(today, lookback)?;
            let driver = build_driver(&cli, &config)?;
            let (removed, outcomes) = driver.rebuild(&range)?;
            eprintln!("Dropped {removed} rows, recomputed {range}.");
            print_outcomes(cli.format, &outcomes)?;
        }
        Command::Usage { from, to } => {
            let range = match (from, to) {
                (None, None) => None,
                (from, to) => Some(DateRange::new(
                    from.unwrap_or(NaiveDate::MIN),
                    to.unwrap_or(today),
                )?),
            };
            let rows = open_store(&config)?.buckets(range.as_ref())?;
            if rows.is_empty() && cli.format == OutputFormat::Table {
                eprintln!("No usage rows stored. Run `clawmeter sync` first.");
                return Ok(());
            }
            match cli.format {
                OutputFormat::Json => output::print_json(&rows)?,
                OutputFormat::Table => println!("{}", output::usage_table(&rows)),
            }
        }
        Command::Log { limit } => {
            let outcomes = open_store(&config)?.recent_outcomes(*limit)?;
            print_outcomes(cli.format, &outcomes)?;
        }
        Command::Providers => {
            let providers = providers::all_providers(&config.event_sources(), Arc::new(NoPricing));
            let latest = open_store(&config)?.latest_outcomes()?;
            match cli.format {
                OutputFormat::Json => {
                    let list: Vec<serde_json::Value> = providers
                        .iter()
                        .map(|p| {
                            serde_json::json!({
                                "id": p.id(),
                                "name": p.display_name(),
                                "configured": p.is_configured(),
                                "requires": p.requirement(),
                                "last_sync": latest.iter().find(|o| o.provider == p.id()),
                            })
                        })
                        .collect();
                    output::print_json(&list)?;
                }
                OutputFormat::Table => {
                    println!("{}", output::providers_table(&providers, &latest))
                }
            }
        }
        Command::Session { path } => {
            let root = config.event_sources().sessions_root();
            let Some(path) = path.clone().or_else(|| session::find_active_session(&root)) else {
                bail!("No active session under {}", root.display());
            };
            let snapshot = session::read_session(&path)?;
            let pricing = load_pricing(&cli, &config);
            let unpriced = pricing.unpriced_models(snapshot.models_used());
            if !unpriced.is_empty() {
                warn!(models = %unpriced.join(", "), "no pricing data, using embedded costs");
            }
            let status = session::evaluate(
                snapshot,
                &*pricing,
                Thresholds {
                    cost_usd: config.alerts.session_cost_warning_usd,
                    tokens: config.alerts.session_token_warning,
                },
            );
            match cli.format {
                OutputFormat::Json => output::print_json(&status)?,
                OutputFormat::Table => output::print_session(&status),
            }
        }
    }

    Ok(())
}
