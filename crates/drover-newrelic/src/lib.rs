//! New Relic clients: NerdGraph NRQL lookups and chunked Insights event upload.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use drover_core::{Record, EVENT_TYPE_KEY};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "drover-newrelic";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The one NerdGraph document this pipeline ever sends; the NRQL text is the
/// only variable part.
const NERDGRAPH_NRQL_QUERY: &str = "\
query($accountId: Int!, $nrql: Nrql!) {
  actor {
    account(id: $accountId) {
      nrql(query: $nrql) {
        results
      }
    }
  }
}";

#[derive(Debug, Error)]
pub enum NewRelicError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("nerdgraph returned errors: {0}")]
    Query(String),
}

/// Identifier sets already recorded downstream, keyed off an NRQL lookup.
#[async_trait]
pub trait ObservedIds: Send + Sync {
    async fn observed_ids(&self, nrql: &str) -> Result<HashSet<String>, NewRelicError>;
}

/// NerdGraph client scoped to one account, used for the dedup lookups.
pub struct NerdGraphClient {
    client: reqwest::Client,
    url: String,
    account_id: i64,
    api_key: String,
}

impl NerdGraphClient {
    pub fn new(
        url: impl Into<String>,
        account_id: i64,
        api_key: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building nerdgraph client")?;
        Ok(Self {
            client,
            url: url.into(),
            account_id,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ObservedIds for NerdGraphClient {
    async fn observed_ids(&self, nrql: &str) -> Result<HashSet<String>, NewRelicError> {
        let body = json!({
            "query": NERDGRAPH_NRQL_QUERY,
            "variables": { "accountId": self.account_id, "nrql": nrql },
        });
        let response = self
            .client
            .post(&self.url)
            .header("API-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NewRelicError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        let payload = response.json::<JsonValue>().await?;
        members_from_payload(&payload)
    }
}

/// Pulls the `uniques(...)` members out of a NerdGraph NRQL response. A
/// missing results path means nothing matched; a populated top-level
/// `errors` array means the query itself was rejected.
pub fn members_from_payload(payload: &JsonValue) -> Result<HashSet<String>, NewRelicError> {
    if let Some(errors) = payload.get("errors").and_then(JsonValue::as_array) {
        if !errors.is_empty() {
            return Err(NewRelicError::Query(
                serde_json::to_string(errors).unwrap_or_else(|_| "unrenderable".to_string()),
            ));
        }
    }
    let members = payload
        .pointer("/data/actor/account/nrql/results/0/members")
        .and_then(JsonValue::as_array);
    let Some(members) = members else {
        return Ok(HashSet::new());
    };
    Ok(members
        .iter()
        .map(|member| match member {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect())
}

/// Outcome of one chunk request. `status`/`body` are present when the
/// request reached the endpoint; `error` captures transport failures.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunk: usize,
    pub records: usize,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub error: Option<String>,
}

impl ChunkOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.map(|code| code < 400).unwrap_or(false)
    }
}

/// Per-chunk outcomes for one upload batch, in chunk order.
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub outcomes: Vec<ChunkOutcome>,
}

impl UploadReport {
    pub fn chunks(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed_chunks(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .count()
    }
}

/// Something enriched records can be shipped to in chunks.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn upload(&self, records: Vec<Record>, chunk_size: usize) -> UploadReport;
}

/// Insights event-insert client. Each chunk is posted as one JSON array;
/// chunks fly concurrently and every one runs to completion whether or not
/// its siblings fail.
pub struct InsightsClient {
    client: reqwest::Client,
    url: Arc<String>,
    api_key: Arc<String>,
}

impl InsightsClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building insights client")?;
        Ok(Self {
            client,
            url: Arc::new(url.into()),
            api_key: Arc::new(api_key.into()),
        })
    }
}

#[async_trait]
impl EventSink for InsightsClient {
    async fn upload(&self, records: Vec<Record>, chunk_size: usize) -> UploadReport {
        if records.is_empty() {
            return UploadReport::default();
        }
        let event_type = records[0].get_str(EVENT_TYPE_KEY).unwrap_or("unknown");
        info!(
            records = records.len(),
            event_type, chunk_size, "uploading event batch"
        );

        let chunks: Vec<Vec<Record>> = records
            .chunks(chunk_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut tasks = JoinSet::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let client = self.client.clone();
            let url = Arc::clone(&self.url);
            let api_key = Arc::clone(&self.api_key);
            tasks.spawn(async move { send_chunk(client, &url, &api_key, index, chunk).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => outcomes.push(ChunkOutcome {
                    chunk: usize::MAX,
                    records: 0,
                    status: None,
                    body: None,
                    error: Some(format!("upload task panicked: {err}")),
                }),
            }
        }
        outcomes.sort_by_key(|outcome| outcome.chunk);

        let report = UploadReport { outcomes };
        for outcome in &report.outcomes {
            if !outcome.is_success() {
                warn!(
                    chunk = outcome.chunk,
                    status = outcome.status,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "chunk upload failed"
                );
            }
        }
        report
    }
}

async fn send_chunk(
    client: reqwest::Client,
    url: &str,
    api_key: &str,
    index: usize,
    chunk: Vec<Record>,
) -> ChunkOutcome {
    let records = chunk.len();
    let payload: Vec<_> = chunk.iter().map(Record::to_json_map).collect();
    let result = client
        .post(url)
        .header("Api-Key", api_key)
        .json(&payload)
        .send()
        .await;
    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            ChunkOutcome {
                chunk: index,
                records,
                status: Some(status),
                body: Some(body),
                error: None,
            }
        }
        Err(err) => ChunkOutcome {
            chunk: index,
            records,
            status: None,
            body: None,
            error: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn members_parse_from_nested_results_path() {
        let payload = json!({
            "data": { "actor": { "account": { "nrql": {
                "results": [ { "members": ["299381", "299382", 299383] } ]
            }}}}
        });
        let members = members_from_payload(&payload).unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.contains("299381"));
        assert!(members.contains("299383"));
    }

    #[test]
    fn missing_results_path_yields_empty_set() {
        let payload = json!({
            "data": { "actor": { "account": { "nrql": { "results": [] } } } }
        });
        assert!(members_from_payload(&payload).unwrap().is_empty());

        let bare = json!({ "data": {} });
        assert!(members_from_payload(&bare).unwrap().is_empty());
    }

    #[test]
    fn graphql_errors_are_fatal() {
        let payload = json!({
            "errors": [ { "message": "NRQL Syntax Error" } ],
            "data": null
        });
        let err = members_from_payload(&payload).unwrap_err();
        match err {
            NewRelicError::Query(text) => assert!(text.contains("NRQL Syntax Error")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_errors_array_is_not_an_error() {
        let payload = json!({
            "errors": [],
            "data": { "actor": { "account": { "nrql": {
                "results": [ { "members": ["1"] } ]
            }}}}
        });
        assert_eq!(members_from_payload(&payload).unwrap().len(), 1);
    }

    fn record(event_type: &str, id: usize) -> Record {
        let mut record = Record::new();
        record.insert(EVENT_TYPE_KEY, event_type);
        record.insert("entity_id", format!("id-{id}"));
        record
    }

    #[tokio::test]
    async fn empty_upload_is_a_no_op() {
        // An unroutable endpoint proves no request is ever attempted.
        let sink = InsightsClient::new("http://127.0.0.1:1/v1/accounts/0/events", "key").unwrap();
        let report = sink.upload(Vec::new(), 500).await;
        assert_eq!(report.chunks(), 0);
        assert_eq!(report.failed_chunks(), 0);
    }

    #[tokio::test]
    async fn chunks_partition_contiguously_and_all_dispatch() {
        let sink = InsightsClient::new("http://127.0.0.1:1/v1/accounts/0/events", "key").unwrap();
        let records: Vec<_> = (0..1050).map(|i| record("dbt_job_run", i)).collect();
        let report = sink.upload(records, 500).await;
        assert_eq!(report.chunks(), 3);
        let sizes: Vec<_> = report.outcomes.iter().map(|o| o.records).collect();
        assert_eq!(sizes, vec![500, 500, 50]);
        // The endpoint is unreachable, so every chunk reports its own
        // transport failure rather than cancelling siblings.
        assert_eq!(report.failed_chunks(), 3);
        for outcome in &report.outcomes {
            assert!(outcome.error.is_some());
        }
    }
}
