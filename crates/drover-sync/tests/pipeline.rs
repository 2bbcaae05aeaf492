//! End-to-end pipeline pass over in-process fakes of the four seams.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use drover_core::{FetchWindow, JsonMap, Record};
use drover_dbt::{BuildApi, DbtCloudError, ManifestIndex};
use drover_newrelic::{ChunkOutcome, EventSink, NewRelicError, ObservedIds, UploadReport};
use drover_sync::SyncPipeline;
use drover_warehouse::{RetryPolicy, SqlRow, Warehouse, WarehouseError};
use serde_json::{json, Value as JsonValue};

struct FakeBuildApi {
    runs: Vec<JsonValue>,
    manifest: JsonValue,
    statuses: Vec<JsonMap>,
    run_results_calls: Arc<Mutex<Vec<(i64, i64)>>>,
}

#[async_trait]
impl BuildApi for FakeBuildApi {
    async fn list_runs(&self, _window: &FetchWindow) -> Result<Vec<JsonValue>, DbtCloudError> {
        Ok(self.runs.clone())
    }

    async fn list_projects(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError> {
        Ok(HashMap::from([(
            "96622".to_string(),
            json!({"id": 96622, "name": "analytics"}),
        )]))
    }

    async fn list_environments(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError> {
        Ok(HashMap::from([(
            "86490".to_string(),
            json!({"id": 86490, "name": "production"}),
        )]))
    }

    async fn manifest_index(&self, _run_id: i64) -> Result<Option<ManifestIndex>, DbtCloudError> {
        if self.manifest.is_null() {
            return Ok(None);
        }
        Ok(Some(ManifestIndex::from_manifest(
            &self.manifest,
            "Data Engineering",
        )))
    }

    async fn run_results(&self, job_id: i64, run_id: i64) -> Result<Vec<JsonMap>, DbtCloudError> {
        self.run_results_calls.lock().unwrap().push((job_id, run_id));
        Ok(self.statuses.clone())
    }
}

struct FakeObservedIds {
    // Lookup keyed by the event type embedded in the NRQL text.
    sets: HashMap<&'static str, HashSet<String>>,
}

#[async_trait]
impl ObservedIds for FakeObservedIds {
    async fn observed_ids(&self, nrql: &str) -> Result<HashSet<String>, NewRelicError> {
        for (event_type, set) in &self.sets {
            if nrql.contains(&format!("FROM {event_type} ")) {
                return Ok(set.clone());
            }
        }
        Ok(HashSet::new())
    }
}

#[derive(Default)]
struct CapturingSink {
    batches: Mutex<Vec<Vec<Record>>>,
}

impl CapturingSink {
    fn batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for CapturingSink {
    async fn upload(&self, records: Vec<Record>, chunk_size: usize) -> UploadReport {
        let outcomes = records
            .chunks(chunk_size.max(1))
            .enumerate()
            .map(|(index, chunk)| ChunkOutcome {
                chunk: index,
                records: chunk.len(),
                status: Some(200),
                body: Some(r#"{"success":true}"#.to_string()),
                error: None,
            })
            .collect();
        self.batches.lock().unwrap().push(records);
        UploadReport { outcomes }
    }
}

struct FakeWarehouse {
    rows: Vec<SqlRow>,
    queries: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn query_rows(&self, sql: &str, max_rows: usize) -> Result<Vec<SqlRow>, WarehouseError> {
        self.queries
            .lock()
            .unwrap()
            .push((sql.to_string(), max_rows));
        Ok(self.rows.iter().take(max_rows).cloned().collect())
    }
}

fn raw_run(id: i64, status: i64) -> JsonValue {
    json!({
        "id": id,
        "status": status,
        "project_id": 96622,
        "environment_id": 86490,
        "created_at": "2026-03-01 11:50:00",
        "finished_at": "2026-03-01 11:52:10",
        "duration": "0:02:10",
        "job": { "id": 42, "name": "nightly build" }
    })
}

fn manifest_with_alerting_test() -> JsonValue {
    json!({
        "nodes": {
            "model.jaffle.orders": {
                "resource_type": "model",
                "unique_id": "model.jaffle.orders",
                "name": "orders",
                "alias": "orders",
                "database": "analytics",
                "schema": "prod"
            },
            "test.jaffle.not_null_orders_id": {
                "resource_type": "test",
                "unique_id": "test.jaffle.not_null_orders_id",
                "name": "not_null_orders_id",
                "alias": "not_null_orders_id",
                "test_metadata": {
                    "name": "not_null",
                    "kwargs": { "column_name": "id", "model": "ref('orders')" }
                },
                "config": {
                    "severity": "error",
                    "meta": {
                        "nr_config": {
                            "alert_failed_test_rows": true,
                            "failed_test_row_limit": 5
                        }
                    }
                }
            }
        }
    })
}

fn statuses() -> Vec<JsonMap> {
    let entries = [
        json!({
            "unique_id": "model.jaffle.orders",
            "status": "pass",
            "execution_time": 1.5
        }),
        json!({
            "unique_id": "test.jaffle.not_null_orders_id",
            "status": "fail",
            "compiled_sql": "select * from analytics.orders where id is null"
        }),
        json!({
            "unique_id": "model.jaffle.ghost",
            "status": "pass"
        }),
    ];
    entries
        .iter()
        .map(|entry| entry.as_object().unwrap().clone())
        .collect()
}

fn window() -> FetchWindow {
    FetchWindow::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 11, 45, 0).single().unwrap(),
        Utc.with_ymd_and_hms(2026, 3, 1, 11, 55, 0).single().unwrap(),
    )
}

fn pipeline(
    build: FakeBuildApi,
    observed: FakeObservedIds,
    sink: Arc<CapturingSink>,
    warehouse: FakeWarehouse,
) -> SyncPipeline {
    struct SharedSink(Arc<CapturingSink>);

    #[async_trait]
    impl EventSink for SharedSink {
        async fn upload(&self, records: Vec<Record>, chunk_size: usize) -> UploadReport {
            self.0.upload(records, chunk_size).await
        }
    }

    SyncPipeline::new(
        Box::new(build),
        Box::new(observed),
        Box::new(SharedSink(sink)),
        Box::new(warehouse),
        "Data Engineering",
        500,
    )
    .with_retry_policy(RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(1),
    })
}

#[tokio::test]
async fn full_pass_uploads_runs_resources_and_failed_test_rows() {
    let run_results_calls = Arc::new(Mutex::new(Vec::new()));
    let build = FakeBuildApi {
        // One completed run and one that never finished.
        runs: vec![raw_run(299381, 10), raw_run(299382, 1)],
        manifest: manifest_with_alerting_test(),
        statuses: statuses(),
        run_results_calls: Arc::clone(&run_results_calls),
    };
    let observed = FakeObservedIds {
        sets: HashMap::new(),
    };
    let sink = Arc::new(CapturingSink::default());
    let warehouse = FakeWarehouse {
        rows: vec![SqlRow {
            columns: vec!["ORDER_ID".to_string()],
            values: vec!["1001".to_string()],
        }],
        queries: Mutex::new(Vec::new()),
    };

    let pipeline = pipeline(build, observed, Arc::clone(&sink), warehouse);
    let summary = pipeline.run_once(window()).await.unwrap();

    assert_eq!(summary.candidate_runs, 2);
    assert_eq!(summary.new_runs, 2);
    // The ghost model has no manifest entry and is skipped, not fatal.
    assert_eq!(summary.resource_statuses, 2);
    assert_eq!(summary.statuses_skipped, 1);
    assert_eq!(summary.failed_tests, 1);
    assert_eq!(summary.failed_test_rows, 1);
    assert_eq!(summary.failed_chunks, 0);

    // Only the completed run reached the discovery API.
    assert_eq!(*run_results_calls.lock().unwrap(), vec![(42, 299381)]);

    let batches = sink.batches();
    assert_eq!(batches.len(), 3);

    // Batch 1: both candidate runs as job-run events.
    assert_eq!(batches[0].len(), 2);
    for record in &batches[0] {
        assert_eq!(record.get_str("eventType"), Some("dbt_job_run"));
        assert!(record.get_str("entity_id").is_some());
    }

    // Batch 2: resource statuses joined with manifest and run attributes.
    let resource = &batches[1];
    assert_eq!(resource.len(), 2);
    for record in resource {
        assert_eq!(record.get_str("eventType"), Some("dbt_resource_run"));
        assert_eq!(record.get_str("run_id"), Some("299381"));
        assert_eq!(record.get_str("project_name"), Some("analytics"));
    }
    let test_record = resource
        .iter()
        .find(|record| record.get_str("resource_type") == Some("test"))
        .unwrap();
    assert_eq!(test_record.get_str("status"), Some("fail"));
    assert_eq!(test_record.get_str("test_model_name"), Some("orders"));
    assert_eq!(
        test_record.get_str("entity_name"),
        Some("not_null_orders_id - 2026-03-01 11:50:00")
    );

    // Batch 3: warehouse rows for the alerting failed test.
    let rows = &batches[2];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("eventType"), Some("dbt_failed_test_row"));
    assert_eq!(rows[0].get_str("field_1"), Some("ORDER_ID: 1001"));
}

#[tokio::test]
async fn observed_runs_are_not_reuploaded() {
    let build = FakeBuildApi {
        runs: vec![raw_run(299381, 10), raw_run(299382, 10)],
        manifest: JsonValue::Null,
        statuses: Vec::new(),
        run_results_calls: Arc::new(Mutex::new(Vec::new())),
    };
    // Both runs already observed everywhere: nothing to upload at all.
    let all: HashSet<String> = ["299381", "299382"]
        .iter()
        .map(ToString::to_string)
        .collect();
    let observed = FakeObservedIds {
        sets: HashMap::from([
            ("dbt_job_run", all.clone()),
            ("dbt_resource_run", all.clone()),
            ("dbt_failed_test_row", all),
        ]),
    };
    let sink = Arc::new(CapturingSink::default());
    let warehouse = FakeWarehouse {
        rows: Vec::new(),
        queries: Mutex::new(Vec::new()),
    };

    let pipeline = pipeline(build, observed, Arc::clone(&sink), warehouse);
    let summary = pipeline.run_once(window()).await.unwrap();

    assert_eq!(summary.candidate_runs, 2);
    assert_eq!(summary.new_runs, 0);
    assert_eq!(summary.resource_statuses, 0);
    assert!(sink.batches().is_empty());
}

#[tokio::test]
async fn absent_manifest_skips_every_status_without_failing() {
    let build = FakeBuildApi {
        runs: vec![raw_run(299381, 10)],
        manifest: JsonValue::Null,
        statuses: statuses(),
        run_results_calls: Arc::new(Mutex::new(Vec::new())),
    };
    let observed = FakeObservedIds {
        sets: HashMap::new(),
    };
    let sink = Arc::new(CapturingSink::default());
    let warehouse = FakeWarehouse {
        rows: Vec::new(),
        queries: Mutex::new(Vec::new()),
    };

    let pipeline = pipeline(build, observed, Arc::clone(&sink), warehouse);
    let summary = pipeline.run_once(window()).await.unwrap();

    assert_eq!(summary.resource_statuses, 0);
    assert_eq!(summary.statuses_skipped, 3);
    assert_eq!(summary.failed_tests, 0);
    // Only the job-run batch went out.
    assert_eq!(sink.batches().len(), 1);
}

#[tokio::test]
async fn failed_test_rows_respect_the_row_limit() {
    let build = FakeBuildApi {
        runs: vec![raw_run(299381, 10)],
        manifest: manifest_with_alerting_test(),
        statuses: statuses(),
        run_results_calls: Arc::new(Mutex::new(Vec::new())),
    };
    let observed = FakeObservedIds {
        sets: HashMap::new(),
    };
    let sink = Arc::new(CapturingSink::default());
    let many_rows: Vec<SqlRow> = (0..50)
        .map(|i| SqlRow {
            columns: vec!["ORDER_ID".to_string()],
            values: vec![i.to_string()],
        })
        .collect();
    let warehouse = FakeWarehouse {
        rows: many_rows,
        queries: Mutex::new(Vec::new()),
    };

    let pipeline = pipeline(build, observed, Arc::clone(&sink), warehouse);
    let summary = pipeline.run_once(window()).await.unwrap();

    // The manifest caps this test at 5 rows.
    assert_eq!(summary.failed_test_rows, 5);
}
