//! Pipeline orchestration: configuration, run enrichment, dedup planning and
//! the end-to-end synchronization pass.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use drover_core::{
    entity_display_name, flatten, new_entity_id, FetchWindow, JsonMap, Record, ENTITY_ID_KEY,
    ENTITY_NAME_KEY, EVENT_TYPE_KEY, FAILED_TEST_ROW_EVENT, JOB_RUN_EVENT, RESOURCE_RUN_EVENT,
    SOURCE_KEY, SOURCE_NAME,
};
use drover_dbt::{
    AdminClient, BuildApi, DbtCloud, DbtCloudError, DiscoveryClient, DiscoveryQuery, ManifestNode,
};
use drover_newrelic::{EventSink, InsightsClient, NerdGraphClient, NewRelicError, ObservedIds};
use drover_warehouse::{fetch_failed_test_rows, FailedTest, PgWarehouse, RetryPolicy, Warehouse};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "drover-sync";

/// Dedup lookups render every candidate id into one NRQL `IN` clause, so the
/// candidate set is capped. Exceeding it means the scheduling interval
/// upstream is too wide.
pub const MAX_CANDIDATE_RUNS: usize = 200;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("too many candidate runs ({count} > {MAX_CANDIDATE_RUNS}); decrease the scheduled interval")]
    TooManyRuns { count: usize },
    #[error("run payload at index {index} has no integer id")]
    RunWithoutId { index: usize },
    #[error("run {run_id} is missing required field {field}")]
    MissingRunField { run_id: i64, field: &'static str },
    #[error("run {run_id} references unknown project {project_id}")]
    UnknownProject { run_id: i64, project_id: String },
    #[error("run {run_id} references unknown environment {environment_id}")]
    UnknownEnvironment { run_id: i64, environment_id: String },
    #[error(transparent)]
    Dbt(#[from] DbtCloudError),
    #[error(transparent)]
    NewRelic(#[from] NewRelicError),
}

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Clone, Deserialize)]
struct SettingsFile {
    connections: ConnectionsFile,
    default_team: String,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_interval_minutes")]
    interval_minutes: i64,
    #[serde(default = "default_interval_lag_minutes")]
    interval_lag_minutes: i64,
    #[serde(default = "default_discovery_queries")]
    discovery_queries: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectionsFile {
    dbt_cloud_admin_api: AdminConnection,
    dbt_cloud_discovery_api: DiscoveryConnection,
    nr_insights_query: QueryConnection,
    nr_insights_insert: InsertConnection,
    warehouse: WarehouseConnection,
}

#[derive(Debug, Clone, Deserialize)]
struct AdminConnection {
    base_url: String,
    #[serde(default = "default_admin_token_env")]
    token_env: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryConnection {
    url: String,
    #[serde(default = "default_discovery_token_env")]
    token_env: String,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryConnection {
    url: String,
    account_id: i64,
    #[serde(default = "default_query_key_env")]
    api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
struct InsertConnection {
    url: String,
    #[serde(default = "default_insert_key_env")]
    api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WarehouseConnection {
    #[serde(default = "default_warehouse_url_env")]
    url_env: String,
}

fn default_chunk_size() -> usize {
    500
}

fn default_interval_minutes() -> i64 {
    10
}

fn default_interval_lag_minutes() -> i64 {
    5
}

fn default_discovery_queries() -> String {
    "discovery_queries.yml".to_string()
}

fn default_admin_token_env() -> String {
    "DBT_CLOUD_API_TOKEN".to_string()
}

fn default_discovery_token_env() -> String {
    "DBT_CLOUD_SERVICE_TOKEN".to_string()
}

fn default_query_key_env() -> String {
    "NEW_RELIC_QUERY_KEY".to_string()
}

fn default_insert_key_env() -> String {
    "NEW_RELIC_INSERT_KEY".to_string()
}

fn default_warehouse_url_env() -> String {
    "WAREHOUSE_URL".to_string()
}

/// Resolved pipeline settings. Built once at process start; secrets are read
/// from the environment variables the config file names and never written
/// back out.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub admin_base_url: String,
    pub admin_token: String,
    pub discovery_url: String,
    pub discovery_token: String,
    pub query_url: String,
    pub query_account_id: i64,
    pub query_api_key: String,
    pub insert_url: String,
    pub insert_api_key: String,
    pub warehouse_url: String,
    pub default_team: String,
    pub chunk_size: usize,
    pub interval_minutes: i64,
    pub interval_lag_minutes: i64,
    pub discovery_queries: Vec<DiscoveryQuery>,
}

impl SyncSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: SettingsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let queries_path = resolve_sibling(path, &file.discovery_queries);
        let queries_text = std::fs::read_to_string(&queries_path)
            .with_context(|| format!("reading {}", queries_path.display()))?;
        let discovery_queries: Vec<DiscoveryQuery> = serde_yaml::from_str(&queries_text)
            .with_context(|| format!("parsing {}", queries_path.display()))?;

        Ok(Self {
            admin_base_url: file.connections.dbt_cloud_admin_api.base_url,
            admin_token: secret(&file.connections.dbt_cloud_admin_api.token_env)?,
            discovery_url: file.connections.dbt_cloud_discovery_api.url,
            discovery_token: secret(&file.connections.dbt_cloud_discovery_api.token_env)?,
            query_url: file.connections.nr_insights_query.url,
            query_account_id: file.connections.nr_insights_query.account_id,
            query_api_key: secret(&file.connections.nr_insights_query.api_key_env)?,
            insert_url: file.connections.nr_insights_insert.url,
            insert_api_key: secret(&file.connections.nr_insights_insert.api_key_env)?,
            warehouse_url: secret(&file.connections.warehouse.url_env)?,
            default_team: file.default_team,
            chunk_size: file.chunk_size,
            interval_minutes: file.interval_minutes,
            interval_lag_minutes: file.interval_lag_minutes,
            discovery_queries,
        })
    }

    /// Window one pass covers when the caller does not supply explicit
    /// bounds.
    pub fn default_window(&self, now: DateTime<Utc>) -> FetchWindow {
        FetchWindow::lagged(now, self.interval_minutes, self.interval_lag_minutes)
    }

    /// Secret-free rendering for `check-config`.
    pub fn describe(&self) -> String {
        format!(
            "admin_base_url: {}\ndiscovery_url: {}\nquery_url: {} (account {})\ninsert_url: {}\ndefault_team: {}\nchunk_size: {}\nwindow: {}m interval, {}m lag\ndiscovery_queries: {} fragments",
            self.admin_base_url,
            self.discovery_url,
            self.query_url,
            self.query_account_id,
            self.insert_url,
            self.default_team,
            self.chunk_size,
            self.interval_minutes,
            self.interval_lag_minutes,
            self.discovery_queries.len(),
        )
    }
}

fn secret(var: &str) -> anyhow::Result<String> {
    std::env::var(var).with_context(|| format!("credential variable {var} is not set"))
}

fn resolve_sibling(config_path: &Path, relative: &str) -> PathBuf {
    let candidate = PathBuf::from(relative);
    if candidate.is_absolute() {
        return candidate;
    }
    config_path
        .parent()
        .map(|parent| parent.join(relative))
        .unwrap_or(candidate)
}

// ---------------------------------------------------------------------------
// Run enrichment

/// Enriched run: the typed core fields the pipeline branches on plus the
/// full flattened attribute bag that gets uploaded.
#[derive(Debug, Clone)]
pub struct EnrichedRun {
    pub run_id: i64,
    pub job_id: i64,
    pub status: i64,
    pub created_at: String,
    pub record: Record,
}

/// Joins each raw run with its inlined job plus the project and environment
/// lookups, flattens everything with prefixes, and stamps the entity
/// attributes. A run referencing an unknown project or environment aborts
/// the pass: the lookups were fetched in the same pass, so a miss means the
/// account data is inconsistent.
pub fn enrich_runs(
    raw_runs: &[JsonValue],
    projects: &HashMap<String, JsonValue>,
    environments: &HashMap<String, JsonValue>,
    default_team: &str,
) -> Result<Vec<EnrichedRun>, PipelineError> {
    let mut enriched = Vec::with_capacity(raw_runs.len());
    for (index, raw) in raw_runs.iter().enumerate() {
        let run_bag = raw
            .as_object()
            .ok_or(PipelineError::RunWithoutId { index })?;
        let run_id = raw
            .get("id")
            .and_then(JsonValue::as_i64)
            .ok_or(PipelineError::RunWithoutId { index })?;
        let job_bag = raw
            .get("job")
            .and_then(JsonValue::as_object)
            .ok_or(PipelineError::MissingRunField {
                run_id,
                field: "job",
            })?;
        let job_id = job_bag
            .get("id")
            .and_then(JsonValue::as_i64)
            .ok_or(PipelineError::MissingRunField {
                run_id,
                field: "job.id",
            })?;
        let status = raw
            .get("status")
            .and_then(JsonValue::as_i64)
            .ok_or(PipelineError::MissingRunField {
                run_id,
                field: "status",
            })?;

        let mut record = flatten(run_bag, "run_");
        record.merge(flatten(job_bag, "job_"));
        // The nested job object was flattened to a blob under run_job; the
        // job_-prefixed fields carry the real data.
        record.remove("run_job");

        join_lookup(&mut record, environments, "run_environment_id", "environment_").map_err(
            |environment_id| PipelineError::UnknownEnvironment {
                run_id,
                environment_id,
            },
        )?;
        join_lookup(&mut record, projects, "run_project_id", "project_")
            .map_err(|project_id| PipelineError::UnknownProject { run_id, project_id })?;

        let job_name = record
            .get_str("job_name")
            .ok_or(PipelineError::MissingRunField {
                run_id,
                field: "job.name",
            })?
            .to_string();
        let created_at = record
            .get_str("run_created_at")
            .unwrap_or_default()
            .to_string();

        record.insert(ENTITY_NAME_KEY, entity_display_name(&job_name, &created_at));
        record.insert(ENTITY_ID_KEY, new_entity_id());
        record.insert(SOURCE_KEY, SOURCE_NAME);
        record.insert(EVENT_TYPE_KEY, JOB_RUN_EVENT);
        let team = team_for_run(&record, default_team);
        record.insert("run_team", team);
        let seconds = duration_seconds(record.get_str("run_duration"));
        record.insert("run_total_seconds", seconds);

        enriched.push(EnrichedRun {
            run_id,
            job_id,
            status,
            created_at,
            record,
        });
    }
    Ok(enriched)
}

fn join_lookup(
    record: &mut Record,
    lookup: &HashMap<String, JsonValue>,
    id_key: &str,
    prefix: &str,
) -> Result<(), String> {
    let id = record.get_str(id_key).unwrap_or("null").to_string();
    let Some(entry) = lookup.get(&id).and_then(JsonValue::as_object) else {
        return Err(id);
    };
    record.merge(flatten(entry, prefix));
    record.remove(id_key);
    Ok(())
}

/// Site-specific team classification point. Has every `run_`, `job_`,
/// `project_` and `environment_` attribute available; the stock build
/// assigns everything to the configured default team.
pub fn team_for_run(_run: &Record, default_team: &str) -> String {
    default_team.to_string()
}

/// Whole seconds in an `H:MM:SS` duration string; 0 when absent or
/// unparseable.
pub fn duration_seconds(duration: Option<&str>) -> i64 {
    let Some(text) = duration else {
        return 0;
    };
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 3 {
        return 0;
    }
    let component = |part: &str| part.trim().parse::<i64>().ok();
    match (
        component(parts[0]),
        component(parts[1]),
        component(parts[2]),
    ) {
        (Some(hours), Some(minutes), Some(seconds)) => hours * 3600 + minutes * 60 + seconds,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Dedup planning

/// The three NRQL lookups for one candidate set, in event-stream order.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupQueries {
    pub runs: String,
    pub resource_runs: String,
    pub failed_test_rows: String,
}

/// Identifier sets already recorded downstream, one per event stream.
#[derive(Debug, Clone, Default)]
pub struct ObservedSets {
    pub runs: HashSet<String>,
    pub resource_runs: HashSet<String>,
    pub failed_test_rows: HashSet<String>,
}

/// Candidate runs partitioned by which streams still need them.
#[derive(Debug, Clone)]
pub struct ProcessPlan {
    pub runs: Vec<EnrichedRun>,
    pub resource_runs: Vec<EnrichedRun>,
    pub failed_test_run_ids: HashSet<String>,
}

pub fn build_dedup_queries(
    runs: &[EnrichedRun],
    since: DateTime<Utc>,
) -> Result<DedupQueries, PipelineError> {
    if runs.len() > MAX_CANDIDATE_RUNS {
        return Err(PipelineError::TooManyRuns { count: runs.len() });
    }
    let run_ids: Vec<String> = runs.iter().map(|run| run.run_id.to_string()).collect();
    Ok(DedupQueries {
        runs: dedup_query(JOB_RUN_EVENT, &run_ids, since),
        resource_runs: dedup_query(RESOURCE_RUN_EVENT, &run_ids, since),
        failed_test_rows: dedup_query(FAILED_TEST_ROW_EVENT, &run_ids, since),
    })
}

fn dedup_query(event_type: &str, run_ids: &[String], since: DateTime<Utc>) -> String {
    let ids = run_ids
        .iter()
        .map(|id| format!("'{id}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT uniques(run_id) FROM {event_type} WHERE run_id IN ({ids}) SINCE '{}'",
        since.format("%Y-%m-%d %H:%M:%S"),
    )
}

/// A run is to-process for a stream iff its id is absent from that stream's
/// observed set; the three filters are independent.
pub fn plan_unprocessed(runs: Vec<EnrichedRun>, observed: &ObservedSets) -> ProcessPlan {
    let failed_test_run_ids = runs
        .iter()
        .map(|run| run.run_id.to_string())
        .filter(|id| !observed.failed_test_rows.contains(id))
        .collect();
    let resource_runs = runs
        .iter()
        .filter(|run| !observed.resource_runs.contains(&run.run_id.to_string()))
        .cloned()
        .collect();
    let runs = runs
        .into_iter()
        .filter(|run| !observed.runs.contains(&run.run_id.to_string()))
        .collect();
    ProcessPlan {
        runs,
        resource_runs,
        failed_test_run_ids,
    }
}

// ---------------------------------------------------------------------------
// Pipeline

/// Dbt run statuses that count as a completed execution.
const COMPLETED_STATUSES: [i64; 2] = [10, 20];

#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub window: Option<FetchWindow>,
    pub candidate_runs: usize,
    pub new_runs: usize,
    pub resource_statuses: usize,
    pub statuses_skipped: usize,
    pub failed_tests: usize,
    pub failed_test_rows: usize,
    pub failed_chunks: usize,
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidates={} new_runs={} resource_statuses={} skipped={} failed_tests={} failed_test_rows={} failed_chunks={}",
            self.candidate_runs,
            self.new_runs,
            self.resource_statuses,
            self.statuses_skipped,
            self.failed_tests,
            self.failed_test_rows,
            self.failed_chunks,
        )
    }
}

/// One synchronization pass over the four external seams.
pub struct SyncPipeline {
    build: Box<dyn BuildApi>,
    observed: Box<dyn ObservedIds>,
    sink: Box<dyn EventSink>,
    warehouse: Box<dyn Warehouse>,
    default_team: String,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl SyncPipeline {
    pub fn new(
        build: Box<dyn BuildApi>,
        observed: Box<dyn ObservedIds>,
        sink: Box<dyn EventSink>,
        warehouse: Box<dyn Warehouse>,
        default_team: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            build,
            observed,
            sink,
            warehouse,
            default_team: default_team.into(),
            chunk_size,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Production wiring: real clients for all four seams.
    pub fn from_settings(settings: &SyncSettings) -> anyhow::Result<Self> {
        let admin = AdminClient::new(&settings.admin_base_url, &settings.admin_token)?;
        let discovery = DiscoveryClient::new(&settings.discovery_url, &settings.discovery_token)?;
        let build = DbtCloud::new(
            admin,
            discovery,
            settings.discovery_queries.clone(),
            &settings.default_team,
        );
        let observed = NerdGraphClient::new(
            &settings.query_url,
            settings.query_account_id,
            &settings.query_api_key,
        )?;
        let sink = InsightsClient::new(&settings.insert_url, &settings.insert_api_key)?;
        let warehouse = PgWarehouse::new(&settings.warehouse_url);
        Ok(Self::new(
            Box::new(build),
            Box::new(observed),
            Box::new(sink),
            Box::new(warehouse),
            &settings.default_team,
            settings.chunk_size,
        ))
    }

    pub async fn run_once(&self, window: FetchWindow) -> Result<SyncSummary, PipelineError> {
        let (projects, environments, raw_runs) = tokio::try_join!(
            async { self.build.list_projects().await },
            async { self.build.list_environments().await },
            async { self.build.list_runs(&window).await },
        )?;
        let runs = enrich_runs(&raw_runs, &projects, &environments, &self.default_team)?;

        let mut summary = SyncSummary {
            window: Some(window),
            candidate_runs: runs.len(),
            ..SyncSummary::default()
        };
        if runs.is_empty() {
            info!("no runs finished in window; nothing to do");
            return Ok(summary);
        }

        let queries = build_dedup_queries(&runs, window.start)?;
        let (observed_runs, observed_resource_runs, observed_failed_rows) = tokio::try_join!(
            self.observed.observed_ids(&queries.runs),
            self.observed.observed_ids(&queries.resource_runs),
            self.observed.observed_ids(&queries.failed_test_rows),
        )?;
        let observed = ObservedSets {
            runs: observed_runs,
            resource_runs: observed_resource_runs,
            failed_test_rows: observed_failed_rows,
        };
        let plan = plan_unprocessed(runs, &observed);
        summary.new_runs = plan.runs.len();

        if plan.runs.is_empty() {
            info!("no new runs to send");
        } else {
            info!(runs = plan.runs.len(), "sending new job runs");
            let records: Vec<Record> = plan.runs.iter().map(|run| run.record.clone()).collect();
            let report = self.sink.upload(records, self.chunk_size).await;
            summary.failed_chunks += report.failed_chunks();
        }

        let mut failed_tests: Vec<FailedTest> = Vec::new();
        for run in &plan.resource_runs {
            if !COMPLETED_STATUSES.contains(&run.status) {
                info!(
                    run_id = run.run_id,
                    status = run.status,
                    "run did not complete; skipping resource statuses"
                );
                continue;
            }
            let records = self
                .process_resource_run(run, &mut failed_tests, &mut summary)
                .await?;
            summary.resource_statuses += records.len();
            if !records.is_empty() {
                let report = self.sink.upload(records, self.chunk_size).await;
                summary.failed_chunks += report.failed_chunks();
            }
        }

        summary.failed_tests = failed_tests.len();
        let to_process: Vec<FailedTest> = failed_tests
            .into_iter()
            .filter(|test| plan.failed_test_run_ids.contains(&test.run_id))
            .collect();
        if to_process.is_empty() {
            info!("no failed tests needing row retrieval");
        } else {
            let rows =
                fetch_failed_test_rows(self.warehouse.as_ref(), &to_process, &self.retry).await;
            summary.failed_test_rows = rows.len();
            if !rows.is_empty() {
                info!(rows = rows.len(), "sending failed test rows");
                let report = self.sink.upload(rows, self.chunk_size).await;
                summary.failed_chunks += report.failed_chunks();
            }
        }

        Ok(summary)
    }

    /// Joins one completed run's resource statuses to its manifest and
    /// collects warn/fail tests with alerting enabled along the way.
    async fn process_resource_run(
        &self,
        run: &EnrichedRun,
        failed_tests: &mut Vec<FailedTest>,
        summary: &mut SyncSummary,
    ) -> Result<Vec<Record>, PipelineError> {
        // The manifest holds every resource in the project, executed or not;
        // runs that died before artifact generation simply have none.
        let index = self
            .build
            .manifest_index(run.run_id)
            .await?
            .unwrap_or_default();
        let statuses = self.build.run_results(run.job_id, run.run_id).await?;

        let run_bag = run.record.to_json_map();
        let mut records = Vec::new();
        for status in statuses {
            let Some(unique_id) = status
                .get("unique_id")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
            else {
                warn!(run_id = run.run_id, "status entry has no unique_id; skipping");
                summary.statuses_skipped += 1;
                continue;
            };
            let Some(node) = index.get(&unique_id) else {
                warn!(
                    run_id = run.run_id,
                    unique_id, "status not found in manifest; skipping"
                );
                summary.statuses_skipped += 1;
                continue;
            };

            let mut bag = status;
            bag.extend(node.to_json_map());
            bag.extend(run_bag.clone());
            let alias = node
                .alias
                .clone()
                .unwrap_or_else(|| unique_id.clone());
            bag.insert(
                EVENT_TYPE_KEY.to_string(),
                JsonValue::from(RESOURCE_RUN_EVENT),
            );
            bag.insert(
                ENTITY_NAME_KEY.to_string(),
                JsonValue::from(entity_display_name(&alias, &run.created_at)),
            );
            bag.insert(ENTITY_ID_KEY.to_string(), JsonValue::from(new_entity_id()));
            bag.insert(SOURCE_KEY.to_string(), JsonValue::from(SOURCE_NAME));

            if is_alerting_failure(&bag, node) {
                match bag.get("compiled_sql").and_then(JsonValue::as_str) {
                    Some(sql) if !sql.is_empty() => failed_tests.push(FailedTest {
                        unique_id: unique_id.clone(),
                        run_id: run.run_id.to_string(),
                        alias: alias.clone(),
                        run_created_at: run.created_at.clone(),
                        compiled_sql: sql.to_string(),
                        row_limit: node.failed_test_row_limit as usize,
                        attributes: bag.clone(),
                    }),
                    _ => warn!(
                        unique_id,
                        "failed test has no compiled sql; cannot fetch rows"
                    ),
                }
            }

            records.push(flatten(&bag, ""));
        }
        Ok(records)
    }
}

fn is_alerting_failure(bag: &JsonMap, node: &ManifestNode) -> bool {
    let status = bag.get("status").and_then(JsonValue::as_str).unwrap_or("");
    matches!(status, "warn" | "fail") && node.alert_failed_test_rows
}
