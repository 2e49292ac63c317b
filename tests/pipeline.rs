use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::tempdir;

use clawmeter::aggregate::{aggregate, AggregateFilter};
use clawmeter::cost::NoPricing;
use clawmeter::extract::{extract_gateway_event, extract_session_event};
use clawmeter::providers::logs::LogProvider;
use clawmeter::providers::{Credential, EventSources, UsageProvider};
use clawmeter::session::{self, Thresholds};
use clawmeter::source::{discover_event_files, parse_json_lines, read_json_lines};
use clawmeter::storage::bitcode_store::BitcodeStore;
use clawmeter::storage::UsageStore;
use clawmeter::sync::SyncDriver;
use clawmeter::types::{DateRange, LogicalEvent, SyncStatus};

fn sessions_dir(state: &Path) -> PathBuf {
    let dir = state.join("agents").join("main").join("sessions");
    fs::create_dir_all(&dir).expect("sessions dir");
    dir
}

fn assistant_line(ts: &str, model: &str, input: u64, output: u64) -> String {
    format!(
        r#"{{"timestamp":"{ts}","message":{{"role":"assistant","provider":"moonshot","model":"{model}","usage":{{"input":{input},"output":{output}}}}}}}"#
    )
}

fn feb_18() -> DateRange {
    let day: NaiveDate = "2026-02-18".parse().unwrap();
    DateRange::new(day, day).unwrap()
}

fn kimi_provider(state: &Path, credential: Credential) -> LogProvider {
    LogProvider::new(
        "moonshot",
        "Moonshot / Kimi",
        &["kimi-"],
        credential,
        EventSources::new(state),
        Arc::new(NoPricing),
    )
}

fn session_events(root: &Path) -> Vec<LogicalEvent> {
    discover_event_files(root)
        .files
        .iter()
        .flat_map(|f| {
            let (lines, _) = read_json_lines(&f.path).expect("read");
            lines.iter().filter_map(extract_session_event).collect::<Vec<_>>()
        })
        .collect()
}

#[test]
fn reset_only_events_are_aggregated() {
    let dir = tempdir().expect("temp dir");
    let sessions = sessions_dir(dir.path());
    fs::write(
        sessions.join("a.jsonl"),
        assistant_line("2026-02-18T08:10:00Z", "kimi-k2.5", 100, 10) + "\n",
    )
    .unwrap();
    fs::write(
        sessions.join("b.jsonl.reset.2026-02-18T09-00-00"),
        assistant_line("2026-02-18T08:40:00Z", "kimi-k2.5", 30, 3) + "\n",
    )
    .unwrap();
    fs::write(sessions.join("a.jsonl.lock"), "").unwrap();

    let events = session_events(&dir.path().join("agents"));
    assert_eq!(events.len(), 2);

    let rows = aggregate(&events, &AggregateFilter::default(), None);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].counters.input_tokens, 130);
    assert_eq!(rows[0].counters.request_count, 2);
    assert_eq!(rows[0].billable_tokens(), 143);
}

#[test]
fn mixed_line_shapes_bucket_by_their_own_hour() {
    let session = r#"{"timestamp":"2026-02-18T08:00:00Z","message":{"role":"assistant","provider":"p","model":"m","usage":{"input":100,"output":50}}}"#;
    let flat = r#"{"ts":"2026-02-18T09:00:00Z","model":"m","inputTokens":10,"outputTokens":5}"#;

    let (lines, stats) = parse_json_lines(format!("{session}\n").as_bytes());
    assert_eq!(stats.malformed, 0);
    let session_events: Vec<_> = lines.iter().filter_map(extract_session_event).collect();

    let filter = AggregateFilter {
        range: Some(feb_18()),
        ..AggregateFilter::default()
    };
    let rows = aggregate(&session_events, &filter, None);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.hour, 8);
    assert_eq!(rows[0].counters.input_tokens, 100);
    assert_eq!(rows[0].counters.output_tokens, 50);

    let (lines, _) = parse_json_lines(format!("{flat}\n").as_bytes());
    let gateway_events: Vec<_> = lines.iter().map(extract_gateway_event).collect();
    let rows = aggregate(&gateway_events, &filter, None);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.hour, 9);
    assert_eq!(rows[0].key.label, "m");
    assert_eq!(rows[0].counters.input_tokens, 10);
    assert_eq!(rows[0].counters.output_tokens, 5);
}

#[test]
fn malformed_lines_are_skipped() {
    let dir = tempdir().expect("temp dir");
    let sessions = sessions_dir(dir.path());
    let body = format!(
        "{}\n{{\"timestamp\": not json at all\n",
        assistant_line("2026-02-18T08:00:00Z", "kimi-k2.5", 100, 50)
    );
    fs::write(sessions.join("s.jsonl"), body).unwrap();

    let (lines, stats) = read_json_lines(&sessions.join("s.jsonl")).expect("read");
    assert_eq!(lines.len(), 1);
    assert_eq!(stats.malformed, 1);

    let events = session_events(&dir.path().join("agents"));
    assert_eq!(events.len(), 1);
}

#[test]
fn sync_twice_does_not_double_count() {
    let dir = tempdir().expect("temp dir");
    let sessions = sessions_dir(dir.path());
    let body = [
        assistant_line("2026-02-18T08:00:00Z", "kimi-k2.5", 100, 50),
        assistant_line("2026-02-18T08:30:00Z", "kimi-k2.5", 20, 5),
        assistant_line("2026-02-18T09:00:00Z", "claude-sonnet-4-6", 7, 7),
    ]
    .join("\n");
    fs::write(sessions.join("s.jsonl"), body).unwrap();

    let store_path = dir.path().join("usage.bin");
    let driver = SyncDriver::new(
        vec![Box::new(kimi_provider(dir.path(), Credential::Always))],
        Box::new(BitcodeStore::open(store_path.clone(), 50)),
    );

    let first = driver.sync_provider("moonshot", &feb_18()).expect("first sync");
    let second = driver.sync_provider("moonshot", &feb_18()).expect("second sync");
    assert_eq!(first.status, SyncStatus::Ok);
    assert_eq!(second.status, SyncStatus::Ok);
    assert_eq!(first.rows, 1);

    let reopened = BitcodeStore::open(store_path, 50);
    let rows = reopened.buckets(None).expect("buckets");
    assert_eq!(rows.len(), 1);
    let bucket = &rows[0].bucket;
    assert_eq!(bucket.key.provider, "moonshot");
    assert_eq!(bucket.counters.input_tokens, 120);
    assert_eq!(bucket.counters.output_tokens, 55);
    assert_eq!(reopened.recent_outcomes(10).expect("outcomes").len(), 2);
}

#[test]
fn unconfigured_provider_is_skipped_without_writes() {
    let dir = tempdir().expect("temp dir");
    let sessions = sessions_dir(dir.path());
    fs::write(
        sessions.join("s.jsonl"),
        assistant_line("2026-02-18T08:00:00Z", "kimi-k2.5", 100, 50),
    )
    .unwrap();

    let provider = kimi_provider(
        dir.path(),
        Credential::Env("CLAWMETER_PIPELINE_TEST_UNSET_KEY"),
    );
    assert!(!provider.is_configured());

    let driver = SyncDriver::new(vec![Box::new(provider)], Box::new(BitcodeStore::in_memory(50)));
    let outcome = driver.sync_provider("moonshot", &feb_18()).expect("sync");
    assert_eq!(outcome.status, SyncStatus::Skipped);

    let (rows, outcomes) = driver
        .with_store(|s| Ok((s.buckets(None)?, s.recent_outcomes(10)?)))
        .expect("store");
    assert!(rows.is_empty());
    assert!(outcomes.is_empty());
}

#[test]
fn live_session_snapshot_from_lock_marker() {
    let dir = tempdir().expect("temp dir");
    let sessions = sessions_dir(dir.path());
    let body = [
        r#"{"timestamp":"2026-02-18T10:00:00Z","message":{"role":"user","content":"hi"}}"#.to_string(),
        assistant_line("2026-02-18T10:05:00Z", "kimi-k2.5", 500, 200),
    ]
    .join("\n");
    fs::write(sessions.join("live.jsonl"), body).unwrap();
    fs::write(sessions.join("live.jsonl.lock"), "").unwrap();
    fs::write(
        sessions.join("old.jsonl"),
        assistant_line("2026-02-17T10:00:00Z", "kimi-k2.5", 1, 1),
    )
    .unwrap();

    let root = dir.path().join("agents");
    let active = session::find_active_session(&root).expect("active session");
    assert_eq!(active, sessions.join("live.jsonl"));

    let snapshot = session::read_session(&active).expect("snapshot");
    assert_eq!(snapshot.session_id, "live");
    assert_eq!(
        snapshot.started_at.map(|t| t.to_rfc3339()),
        Some("2026-02-18T10:00:00+00:00".to_string())
    );
    assert_eq!(snapshot.message_count, 1);
    assert_eq!(snapshot.by_model["kimi-k2.5"].input_tokens, 500);

    let status = session::evaluate(
        snapshot,
        &NoPricing,
        Thresholds {
            cost_usd: 5.0,
            tokens: 700,
        },
    );
    assert_eq!(status.duration_minutes, 5);
    assert_eq!(status.total_tokens, 700);
    assert!(status.token_warning);
    assert!(!status.cost_warning);
}
