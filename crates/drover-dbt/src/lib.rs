//! dbt Cloud API clients: Admin v2 listings and artifacts, Discovery GraphQL.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use drover_core::{FetchWindow, JsonMap};
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "drover-dbt";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DbtCloudError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed page envelope from {url}: {reason}")]
    Envelope { url: String, reason: String },
    #[error("discovery response for job {job_id} run {run_id} is missing {resource_type} data")]
    Discovery {
        resource_type: String,
        job_id: i64,
        run_id: i64,
    },
}

/// One page of an Admin API listing. Every listing endpoint wraps its items
/// in the same `data` + `extra` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ListPage {
    pub data: Vec<JsonValue>,
    pub extra: PageExtra,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageExtra {
    pub pagination: PageCounts,
    pub filters: PageFilters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageCounts {
    pub total_count: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageFilters {
    #[serde(default)]
    pub offset: Option<u64>,
}

impl ListPage {
    /// Offset of the next page while `offset + count < total_count`.
    pub fn next_offset(&self) -> Option<u64> {
        let offset = self.extra.filters.offset.unwrap_or(0);
        let taken = offset + self.extra.pagination.count;
        (taken < self.extra.pagination.total_count).then_some(taken)
    }
}

/// Offset-paginated client for the dbt Cloud Administrative v2 API. The
/// base URL carries the account prefix, e.g.
/// `https://cloud.getdbt.com/api/v2/accounts/1`.
pub struct AdminClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building dbt cloud admin client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.token)
    }

    async fn fetch_page(
        &self,
        path: &str,
        query: &[(&str, String)],
        offset: Option<u64>,
    ) -> Result<ListPage, DbtCloudError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .get(&url)
            .header("Authorization", self.authorization())
            .query(query);
        if let Some(offset) = offset {
            request = request.query(&[("offset", offset.to_string())]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DbtCloudError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        response
            .json::<ListPage>()
            .await
            .map_err(|err| DbtCloudError::Envelope {
                url,
                reason: err.to_string(),
            })
    }

    async fn fetch_all(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<JsonValue>, DbtCloudError> {
        let mut items = Vec::new();
        let mut offset = None;
        loop {
            let page = self.fetch_page(path, query, offset).await?;
            let next = page.next_offset();
            items.extend(page.data);
            match next {
                Some(value) => offset = Some(value),
                None => break,
            }
        }
        debug!(path, items = items.len(), "fetched dbt cloud listing");
        Ok(items)
    }

    /// Runs that finished inside `window`, newest first, each with its job
    /// definition inlined.
    pub async fn runs_finished_between(
        &self,
        window: &FetchWindow,
    ) -> Result<Vec<JsonValue>, DbtCloudError> {
        let query = [
            ("finished_at__range", finished_at_range(window)),
            ("include_related", r#"["job"]"#.to_string()),
            ("order_by", "-finished_at".to_string()),
        ];
        self.fetch_all("/runs/", &query).await
    }

    /// Project listing reduced to `{id, name}` per entry, keyed by id.
    /// Project payloads can carry connection credentials, so nothing else
    /// is kept.
    pub async fn projects(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError> {
        Ok(secure_filter(self.fetch_all("/projects/", &[]).await?))
    }

    /// Environment listing, reduced the same way as [`AdminClient::projects`].
    pub async fn environments(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError> {
        Ok(secure_filter(self.fetch_all("/environments/", &[]).await?))
    }

    /// Run artifact manifest. Runs whose dbt command failed never produce
    /// one, so every retrieval problem is treated as absence.
    pub async fn manifest(&self, run_id: i64) -> Option<JsonValue> {
        let url = format!("{}/runs/{}/artifacts/manifest.json", self.base_url, run_id);
        let response = match self
            .client
            .get(&url)
            .header("Authorization", self.authorization())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(run_id, error = %err, "manifest fetch failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(run_id, status = response.status().as_u16(), "manifest not available");
            return None;
        }
        match response.json::<JsonValue>().await {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!(run_id, error = %err, "manifest body unreadable");
                None
            }
        }
    }
}

fn finished_at_range(window: &FetchWindow) -> String {
    // The range filter is inclusive on both ends; shaving a microsecond off
    // the end keeps adjacent windows from double-counting a run.
    let end = window.end - chrono::Duration::microseconds(1);
    format!(r#"["{}", "{}"]"#, window.start.to_rfc3339(), end.to_rfc3339())
}

fn secure_filter(items: Vec<JsonValue>) -> HashMap<String, JsonValue> {
    let mut filtered = HashMap::new();
    for item in items {
        let Some(id) = item.get("id").cloned() else {
            continue;
        };
        let key = match &id {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        };
        let name = item.get("name").cloned().unwrap_or(JsonValue::Null);
        filtered.insert(key, json!({ "id": id, "name": name }));
    }
    filtered
}

/// Per-node metadata from a run manifest, reduced to the fields the
/// pipeline joins onto resource statuses, with alerting defaults filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    pub resource_type: Option<String>,
    pub unique_id: Option<String>,
    pub database_name: Option<String>,
    pub schema_name: Option<String>,
    pub test_column_name: Option<String>,
    pub test_model_name: Option<String>,
    pub test_namespace: Option<String>,
    pub test_parameters: Option<JsonValue>,
    pub test_short_name: Option<String>,
    pub alias: Option<String>,
    pub severity: Option<String>,
    pub warn_if: Option<String>,
    pub error_if: Option<String>,
    pub tags: Option<JsonValue>,
    pub path: Option<String>,
    pub original_file_path: Option<String>,
    pub meta: Option<JsonValue>,
    pub meta_config: Option<JsonValue>,
    pub team: String,
    pub alert_failed_test_rows: bool,
    pub failed_test_row_limit: u32,
    pub slack_mentions: Option<JsonValue>,
    pub message: String,
}

impl ManifestNode {
    pub fn from_raw(node: &JsonValue, default_team: &str) -> Self {
        let kwargs_model = json_str(node, &["test_metadata", "kwargs", "model"]);
        let test_model_name = kwargs_model
            .as_deref()
            .and_then(quoted_model_name)
            .or_else(|| json_str(node, &["name"]));
        let row_limit = json_i64(node, &["config", "meta", "nr_config", "failed_test_row_limit"])
            .unwrap_or(100)
            .clamp(0, 100) as u32;
        Self {
            resource_type: json_str(node, &["resource_type"]),
            unique_id: json_str(node, &["unique_id"]),
            database_name: json_str(node, &["database"]),
            schema_name: json_str(node, &["schema"]),
            test_column_name: json_str(node, &["test_metadata", "kwargs", "column_name"]),
            test_model_name,
            test_namespace: json_str(node, &["test_metadata", "namespace"]),
            test_parameters: json_value(node, &["test_metadata", "kwargs"]),
            test_short_name: json_str(node, &["test_metadata", "name"]),
            alias: json_str(node, &["alias"]),
            severity: json_str(node, &["config", "severity"]),
            warn_if: json_str(node, &["config", "warn_if"]),
            error_if: json_str(node, &["config", "error_if"]),
            tags: json_value(node, &["config", "tags"]),
            path: json_str(node, &["path"]),
            original_file_path: json_str(node, &["original_file_path"]),
            meta: json_value(node, &["meta"]),
            meta_config: json_value(node, &["config", "meta"]),
            team: json_str(node, &["config", "meta", "nr_config", "team"])
                .unwrap_or_else(|| default_team.to_string()),
            alert_failed_test_rows: json_bool(
                node,
                &["config", "meta", "nr_config", "alert_failed_test_rows"],
            )
            .unwrap_or(false),
            failed_test_row_limit: row_limit,
            slack_mentions: json_value(node, &["config", "meta", "nr_config", "slack_mentions"]),
            message: json_str(node, &["config", "meta", "nr_config", "message"]).unwrap_or_default(),
        }
    }

    /// Node fields as a JSON object, for merging into a status bag.
    pub fn to_json_map(&self) -> JsonMap {
        match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map,
            _ => JsonMap::new(),
        }
    }
}

/// The effective model name of a test node lives inside a free-text kwarg
/// like `ref('orders')`; the first single-quoted identifier wins.
fn quoted_model_name(text: &str) -> Option<String> {
    regex!(r"'(\w+)'")
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().to_string())
}

/// Manifest nodes keyed by unique id. A run without a manifest gets the
/// empty index, which joins nothing.
#[derive(Debug, Clone, Default)]
pub struct ManifestIndex {
    nodes: HashMap<String, ManifestNode>,
}

impl ManifestIndex {
    pub fn from_manifest(manifest: &JsonValue, default_team: &str) -> Self {
        let mut nodes = HashMap::new();
        if let Some(raw_nodes) = manifest.get("nodes").and_then(JsonValue::as_object) {
            for raw in raw_nodes.values() {
                let node = ManifestNode::from_raw(raw, default_team);
                if let Some(unique_id) = node.unique_id.clone() {
                    nodes.insert(unique_id, node);
                }
            }
        }
        Self { nodes }
    }

    pub fn get(&self, unique_id: &str) -> Option<&ManifestNode> {
        self.nodes.get(unique_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One named GraphQL fragment. `resource_type` doubles as the expected
/// top-level key in the response data envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiscoveryQuery {
    pub resource_type: String,
    pub query: String,
}

/// Client for the dbt Cloud Discovery (metadata) GraphQL endpoint.
pub struct DiscoveryClient {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl DiscoveryClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building dbt cloud discovery client")?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
        })
    }

    /// Statuses for one run across every query fragment, concatenated in
    /// fragment order. A response without the fragment's data key aborts
    /// the whole aggregation.
    pub async fn run_results(
        &self,
        job_id: i64,
        run_id: i64,
        queries: &[DiscoveryQuery],
    ) -> Result<Vec<JsonMap>, DbtCloudError> {
        let mut statuses = Vec::new();
        for query in queries {
            let body = json!({
                "query": wrap_discovery_query(&query.query),
                "variables": { "jobId": job_id, "runId": run_id },
            });
            let response = self
                .client
                .post(&self.url)
                .header("Authorization", format!("Token {}", self.token))
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(DbtCloudError::HttpStatus {
                    status: status.as_u16(),
                    url: self.url.clone(),
                });
            }
            let payload = response.json::<JsonValue>().await?;
            statuses.extend(parse_discovery_payload(
                &payload,
                &query.resource_type,
                job_id,
                run_id,
            )?);
        }
        Ok(statuses)
    }
}

fn wrap_discovery_query(fragment: &str) -> String {
    format!("query dbtObjects($jobId: Int!, $runId: Int) {{\n{fragment}\n}}")
}

fn parse_discovery_payload(
    payload: &JsonValue,
    resource_type: &str,
    job_id: i64,
    run_id: i64,
) -> Result<Vec<JsonMap>, DbtCloudError> {
    let invalid = || DbtCloudError::Discovery {
        resource_type: resource_type.to_string(),
        job_id,
        run_id,
    };
    let items = payload
        .get("data")
        .and_then(|data| data.get(resource_type))
        .and_then(JsonValue::as_array)
        .ok_or_else(invalid)?;
    items
        .iter()
        .map(|item| item.as_object().cloned().ok_or_else(invalid))
        .collect()
}

/// Everything the pipeline needs from dbt Cloud, behind one seam.
#[async_trait]
pub trait BuildApi: Send + Sync {
    async fn list_runs(&self, window: &FetchWindow) -> Result<Vec<JsonValue>, DbtCloudError>;
    async fn list_projects(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError>;
    async fn list_environments(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError>;
    /// `Ok(None)` when the run never produced a manifest.
    async fn manifest_index(&self, run_id: i64) -> Result<Option<ManifestIndex>, DbtCloudError>;
    async fn run_results(&self, job_id: i64, run_id: i64) -> Result<Vec<JsonMap>, DbtCloudError>;
}

/// Admin and Discovery clients packaged as one [`BuildApi`].
pub struct DbtCloud {
    admin: AdminClient,
    discovery: DiscoveryClient,
    queries: Vec<DiscoveryQuery>,
    default_team: String,
}

impl DbtCloud {
    pub fn new(
        admin: AdminClient,
        discovery: DiscoveryClient,
        queries: Vec<DiscoveryQuery>,
        default_team: impl Into<String>,
    ) -> Self {
        Self {
            admin,
            discovery,
            queries,
            default_team: default_team.into(),
        }
    }
}

#[async_trait]
impl BuildApi for DbtCloud {
    async fn list_runs(&self, window: &FetchWindow) -> Result<Vec<JsonValue>, DbtCloudError> {
        self.admin.runs_finished_between(window).await
    }

    async fn list_projects(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError> {
        self.admin.projects().await
    }

    async fn list_environments(&self) -> Result<HashMap<String, JsonValue>, DbtCloudError> {
        self.admin.environments().await
    }

    async fn manifest_index(&self, run_id: i64) -> Result<Option<ManifestIndex>, DbtCloudError> {
        Ok(self
            .admin
            .manifest(run_id)
            .await
            .map(|manifest| ManifestIndex::from_manifest(&manifest, &self.default_team)))
    }

    async fn run_results(&self, job_id: i64, run_id: i64) -> Result<Vec<JsonMap>, DbtCloudError> {
        self.discovery.run_results(job_id, run_id, &self.queries).await
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cursor = value;
    for segment in path {
        cursor = cursor.get(*segment)?;
    }
    Some(cursor)
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
}

fn json_value(value: &JsonValue, path: &[&str]) -> Option<JsonValue> {
    json_at(value, path).filter(|found| !found.is_null()).cloned()
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    json_at(value, path).and_then(JsonValue::as_bool)
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_at(value, path).and_then(JsonValue::as_i64)
}
