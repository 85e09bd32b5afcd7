use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cwv_core::{Cell, PipelineError, AUDIT_TAB, DATA_COLUMN_COUNT};
use cwv_normalize::{FixedClock, ZonedClock};
use cwv_storage::{MemoryTableStore, TableStore, WorkbookStore};
use cwv_sync::testing::{Scripted, ScriptedClient};
use cwv_sync::{history_markdown, CwvConfig, Pipeline};

const SHEET: &str = "sheet-1";

fn config(urls: &[&str], form_factors: &[&str]) -> CwvConfig {
    CwvConfig {
        urls: urls.iter().map(|u| u.to_string()).collect(),
        form_factors: form_factors.iter().map(|f| f.to_string()).collect(),
        spreadsheet_id: SHEET.to_string(),
        api_key: "test-key".to_string(),
        request_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn clock() -> ZonedClock {
    let instant = Utc.with_ymd_and_hms(2026, 3, 1, 22, 30, 0).single().unwrap();
    ZonedClock::new(Arc::new(FixedClock(instant)), chrono_tz::Asia::Tokyo)
}

struct Harness {
    client: Arc<ScriptedClient>,
    store: Arc<MemoryTableStore>,
    pipeline: Pipeline,
}

fn harness(config: CwvConfig, script: Vec<Scripted>) -> Harness {
    let client = Arc::new(ScriptedClient::new(script));
    let store = Arc::new(MemoryTableStore::new());
    let pipeline = Pipeline::with_collaborators(config, client.clone(), store.clone(), clock()).unwrap();
    Harness {
        client,
        store,
        pipeline,
    }
}

fn text(cell: &Cell) -> String {
    cell.to_string()
}

#[tokio::test]
async fn single_complete_response_writes_one_row_and_one_audit_row() {
    let h = harness(
        config(&["https://example.com"], &["PHONE"]),
        vec![Scripted::ok_complete("https://example.com", "PHONE")],
    );

    let summary = h.pipeline.run_once().await.unwrap();
    assert_eq!(summary.total_requests, 1);
    assert_eq!(summary.successful_responses, 1);
    assert_eq!(summary.rows_written, 1);
    assert_eq!(summary.failed_requests, 0);
    assert!(summary.is_consistent());

    let data = h.store.read_rows(SHEET, "cruxData").await.unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[1].len(), DATA_COLUMN_COUNT);
    // Local date in Tokyo is already the next day.
    assert_eq!(text(&data[1][0]), "02-03-2026");
    assert_eq!(text(&data[1][1]), "PHONE");
    assert_eq!(text(&data[1][2]), "https://example.com");

    let audit = h.store.read_rows(SHEET, AUDIT_TAB).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(text(&audit[1][0]), summary.execution_id);
    assert_eq!(text(&audit[1][1]), "02-03-2026 07:30:00");
    assert_eq!(text(&audit[1][4]), "SUCCESS");
    assert_eq!(text(&audit[1][5]), "200");
    assert!(audit[1][6].is_sentinel());
    assert_eq!(text(&audit[1][7]), "YES");
}

#[tokio::test]
async fn invalid_urls_are_skipped_before_fetching() {
    let h = harness(
        config(&["not a url", "ftp://files.test", "https://example.com"], &["PHONE"]),
        vec![Scripted::ok_complete("https://example.com", "PHONE")],
    );

    let summary = h.pipeline.run_once().await.unwrap();
    assert_eq!(summary.total_requests, 1);
    assert_eq!(h.client.calls(), 1);
    assert_eq!(h.client.requests()[0].url, "https://example.com");
}

#[tokio::test]
async fn server_error_in_the_middle_is_recorded_and_skipped() {
    let h = harness(
        config(&["https://a.test", "https://b.test", "https://c.test"], &["DESKTOP"]),
        vec![
            Scripted::ok_complete("https://a.test", "DESKTOP"),
            Scripted::status(500, r#"{"error":{"code":500}}"#),
            Scripted::ok_complete("https://c.test", "DESKTOP"),
        ],
    );

    let summary = h.pipeline.run_once().await.unwrap();
    assert_eq!(summary.total_requests, 3);
    assert_eq!(summary.successful_responses, 2);
    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.failed_requests, 1);

    let data = h.store.read_rows(SHEET, "cruxData").await.unwrap();
    let urls: Vec<String> = data[1..].iter().map(|r| text(&r[2])).collect();
    assert_eq!(urls, vec!["https://a.test", "https://c.test"]);

    let audit = h.store.read_rows(SHEET, AUDIT_TAB).await.unwrap();
    assert_eq!(audit.len(), 4);
    assert_eq!(text(&audit[2][2]), "https://b.test");
    assert_eq!(text(&audit[2][4]), "FAILED");
    assert_eq!(text(&audit[2][5]), "500");
    assert!(text(&audit[2][6]).contains("500"));
    assert_eq!(text(&audit[2][7]), "NO");
    assert_eq!(text(&audit[3][7]), "YES");
}

#[tokio::test]
async fn missing_metrics_become_sentinels() {
    let h = harness(
        config(&["https://example.com"], &["PHONE"]),
        vec![Scripted::ok_empty_metrics("https://example.com", "PHONE")],
    );

    h.pipeline.run_once().await.unwrap();
    let data = h.store.read_rows(SHEET, "cruxData").await.unwrap();
    assert!(data[1][3..].iter().all(Cell::is_sentinel));
    assert_eq!(data[1][3..].len(), 16);
}

#[tokio::test]
async fn all_failures_abort_but_still_flush_audit() {
    let h = harness(
        config(&["https://a.test", "https://b.test"], &["PHONE"]),
        vec![
            Scripted::status(404, r#"{"error":{"code":404}}"#),
            Scripted::transport("connection reset"),
        ],
    );

    let err = h.pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::NoSuccessfulResponses { total: 2 }));

    assert!(!h.store.has_tab(SHEET, "cruxData").await.unwrap());
    let audit = h.store.read_rows(SHEET, AUDIT_TAB).await.unwrap();
    assert_eq!(audit.len(), 3);
    assert!(audit[1..].iter().all(|r| text(&r[4]) == "FAILED"));
    assert_eq!(text(&audit[1][5]), "404");
    assert!(audit[2][5].is_sentinel());
    assert!(text(&audit[2][6]).contains("connection reset"));
}

#[tokio::test]
async fn unusable_payloads_abort_with_success_records_unmarked() {
    let h = harness(
        config(&["https://example.com"], &["PHONE", "DESKTOP"]),
        vec![Scripted::json(serde_json::json!({})), Scripted::json(serde_json::json!({"record": {}}))],
    );

    let err = h.pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::AllNormalizationFailed { payloads: 2 }));

    let audit = h.store.read_rows(SHEET, AUDIT_TAB).await.unwrap();
    assert_eq!(audit.len(), 3);
    assert!(audit[1..].iter().all(|r| text(&r[4]) == "SUCCESS" && text(&r[7]) == "NO"));
}

#[tokio::test]
async fn repeated_runs_append_below_existing_rows() {
    let h = harness(
        config(&["https://example.com"], &["PHONE"]),
        vec![
            Scripted::ok_complete("https://example.com", "PHONE"),
            Scripted::ok_complete("https://example.com", "PHONE"),
        ],
    );

    h.pipeline.run_once().await.unwrap();
    let second = h.pipeline.run_once().await.unwrap();

    let data = h.store.read_rows(SHEET, "cruxData").await.unwrap();
    assert_eq!(data.len(), 3);
    let audit = h.store.read_rows(SHEET, AUDIT_TAB).await.unwrap();
    assert_eq!(audit.len(), 3);

    let history = history_markdown(h.store.as_ref(), SHEET, 10).await.unwrap();
    assert!(history.contains(&second.execution_id));
}

#[tokio::test]
async fn sink_failure_surfaces_as_sink_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&["https://example.com"], &["PHONE"]);
    cfg.spreadsheet_id = "bad/id".to_string();
    let client = Arc::new(ScriptedClient::new(vec![Scripted::ok_complete(
        "https://example.com",
        "PHONE",
    )]));
    let store = Arc::new(WorkbookStore::new(dir.path()));
    let pipeline = Pipeline::with_collaborators(cfg, client, store, clock()).unwrap();

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::Sink(_)));
}

#[tokio::test]
async fn workbook_store_persists_between_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    for _ in 0..2 {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::ok_complete(
            "https://example.com",
            "PHONE",
        )]));
        let store = Arc::new(WorkbookStore::new(dir.path()));
        let pipeline = Pipeline::with_collaborators(
            config(&["https://example.com"], &["PHONE"]),
            client,
            store,
            clock(),
        )
        .unwrap();
        pipeline.run_once().await.unwrap();
    }

    let store = WorkbookStore::new(dir.path());
    assert_eq!(store.read_rows(SHEET, "cruxData").await.unwrap().len(), 3);
    assert_eq!(store.read_rows(SHEET, AUDIT_TAB).await.unwrap().len(), 3);
}

#[test]
fn invalid_configuration_is_rejected_at_construction() {
    let mut cfg = config(&["https://example.com"], &["PHONE"]);
    cfg.spreadsheet_id = String::new();
    let result = Pipeline::with_collaborators(
        cfg,
        Arc::new(ScriptedClient::new(vec![])),
        Arc::new(MemoryTableStore::new()),
        clock(),
    );
    assert!(matches!(result, Err(PipelineError::Configuration(_))));
}
