use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::error::Result;
use crate::providers::UsageProvider;
use crate::session::SessionStatus;
use crate::storage::StoredBucket;
use crate::types::{SyncOutcome, UsageCounters};

fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn format_cost(cost: f64) -> String {
    format!("${:.2}", cost)
}

fn new_table<I, S>(header: I) -> Table
where
    I: IntoIterator<Item = S>,
    S: Into<Cell>,
{
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

fn right(text: String) -> Cell {
    Cell::new(text).set_alignment(CellAlignment::Right)
}

fn counter_cells(c: &UsageCounters) -> Vec<Cell> {
    vec![
        right(format_tokens(c.input_tokens)),
        right(format_tokens(c.output_tokens)),
        right(format_tokens(c.cache_read_tokens)),
        right(format_tokens(c.cache_write_tokens)),
        right(format_tokens(c.billable_tokens())),
        right(c.request_count.to_string()),
        right(format_cost(c.estimated_cost_usd)),
    ]
}

pub fn usage_table(rows: &[StoredBucket]) -> Table {
    let mut table = new_table([
        "Provider",
        "Model / Tool",
        "Date",
        "Hour",
        "Input",
        "Output",
        "Cache Read",
        "Cache Write",
        "Billable",
        "Requests",
        "Cost",
    ]);

    let mut totals = UsageCounters::default();
    for row in rows {
        let key = &row.bucket.key;
        let mut cells = vec![
            Cell::new(&key.provider),
            Cell::new(&key.label),
            Cell::new(key.date),
            Cell::new(format!("{:02}:00", key.hour)),
        ];
        cells.extend(counter_cells(&row.bucket.counters));
        table.add_row(cells);
        totals.accumulate_from(&row.bucket.counters);
    }

    let mut cells = vec![Cell::new("TOTAL"), Cell::new(""), Cell::new(""), Cell::new("")];
    cells.extend(counter_cells(&totals));
    table.add_row(cells);
    table
}

pub fn outcomes_table(outcomes: &[SyncOutcome]) -> Table {
    let mut table = new_table(["Synced At", "Provider", "Status", "Rows", "Message"]);
    for o in outcomes {
        table.add_row(vec![
            Cell::new(o.synced_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&o.provider),
            Cell::new(o.status),
            right(o.rows.to_string()),
            Cell::new(&o.message),
        ]);
    }
    table
}

pub fn providers_table(providers: &[Box<dyn UsageProvider>], latest: &[SyncOutcome]) -> Table {
    let mut table = new_table(["Provider", "Name", "Configured", "Requires", "Last Sync"]);
    for p in providers {
        let last = latest
            .iter()
            .find(|o| o.provider == p.id())
            .map(|o| {
                let when = o.synced_at.format("%Y-%m-%d %H:%M");
                match o.status {
                    crate::types::SyncStatus::Error => format!("{when} last error: {}", o.message),
                    status => format!("{when} {status}"),
                }
            })
            .unwrap_or_else(|| "never synced".to_string());
        table.add_row(vec![
            Cell::new(p.id()),
            Cell::new(p.display_name()),
            Cell::new(if p.is_configured() { "yes" } else { "no" }),
            Cell::new(p.requirement().unwrap_or("-")),
            Cell::new(last),
        ]);
    }
    table
}

pub fn session_table(status: &SessionStatus) -> Table {
    let mut table = new_table(["Model", "Input", "Output", "Cache Read", "Cache Write", "Requests"]);
    for (model, t) in &status.snapshot.by_model {
        table.add_row(vec![
            Cell::new(model),
            right(format_tokens(t.input_tokens)),
            right(format_tokens(t.output_tokens)),
            right(format_tokens(t.cache_read_tokens)),
            right(format_tokens(t.cache_write_tokens)),
            right(t.requests.to_string()),
        ]);
    }
    table
}

pub fn print_session(status: &SessionStatus) {
    let snap = &status.snapshot;
    println!("Session   {}", snap.session_id);
    if let Some(start) = snap.started_at {
        println!("Started   {}", start.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "Duration  {} min, {} assistant messages",
        status.duration_minutes, snap.message_count
    );
    println!("{}", session_table(status));
    println!(
        "Total     {} tokens, {}",
        format_tokens(status.total_tokens),
        format_cost(status.total_cost_usd)
    );
    if status.cost_warning {
        println!(
            "WARNING   session cost {} reached threshold {}",
            format_cost(status.total_cost_usd),
            format_cost(status.warning_threshold_usd)
        );
    }
    if status.token_warning {
        println!(
            "WARNING   session tokens {} reached threshold {}",
            format_tokens(status.total_tokens),
            format_tokens(status.warning_threshold_tokens)
        );
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
