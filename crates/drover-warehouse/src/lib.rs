//! Warehouse SQL seam and the failed-test-row retriever.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use drover_core::{
    entity_display_name, flatten, new_entity_id, JsonMap, Record, ENTITY_ID_KEY, ENTITY_NAME_KEY,
    EVENT_TYPE_KEY, FAILED_TEST_ROW_EVENT,
};
use futures::StreamExt;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Row, TypeInfo};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "drover-warehouse";

/// At most this many columns of each failed row become event attributes.
pub const MAX_ROW_FIELDS: usize = 10;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse query failed: {0}")]
    Sql(#[from] sqlx::Error),
}

/// One result row with every value already rendered to text. NULL renders
/// as `"null"`; types without a text rendering get a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    pub columns: Vec<String>,
    pub values: Vec<String>,
}

/// SQL execution seam. The pipeline only ever needs bounded row fetches of
/// test-compiled queries.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query_rows(&self, sql: &str, max_rows: usize) -> Result<Vec<SqlRow>, WarehouseError>;
}

/// Postgres-backed [`Warehouse`]. Each query opens a fresh connection, takes
/// at most `max_rows` rows off the stream, and closes the connection. No
/// pooling: one failed test's session never leaks into the next.
pub struct PgWarehouse {
    url: String,
}

impl PgWarehouse {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn query_rows(&self, sql: &str, max_rows: usize) -> Result<Vec<SqlRow>, WarehouseError> {
        let mut conn = PgConnection::connect(&self.url).await?;
        let mut rows = Vec::new();
        {
            let mut stream = sqlx::query(sql).fetch(&mut conn).take(max_rows);
            while let Some(row) = stream.next().await {
                rows.push(render_row(&row?));
            }
        }
        conn.close().await?;
        Ok(rows)
    }
}

fn render_row(row: &PgRow) -> SqlRow {
    let mut columns = Vec::with_capacity(row.columns().len());
    let mut values = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        values.push(render_value(row, index, column.type_info().name()));
    }
    SqlRow { columns, values }
}

fn render_value(row: &PgRow, index: usize, type_name: &str) -> String {
    fn opt<T: ToString>(value: Result<Option<T>, sqlx::Error>) -> Option<String> {
        match value {
            Ok(Some(inner)) => Some(inner.to_string()),
            Ok(None) => Some("null".to_string()),
            Err(_) => None,
        }
    }

    let rendered = match type_name {
        "BOOL" => opt(row.try_get::<Option<bool>, _>(index)),
        "INT2" => opt(row.try_get::<Option<i16>, _>(index)),
        "INT4" => opt(row.try_get::<Option<i32>, _>(index)),
        "INT8" => opt(row.try_get::<Option<i64>, _>(index)),
        "FLOAT4" => opt(row.try_get::<Option<f32>, _>(index)),
        "FLOAT8" => opt(row.try_get::<Option<f64>, _>(index)),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            opt(row.try_get::<Option<String>, _>(index))
        }
        "UUID" => opt(row.try_get::<Option<uuid::Uuid>, _>(index)),
        "DATE" => opt(row.try_get::<Option<NaiveDate>, _>(index)),
        "TIMESTAMP" => opt(row.try_get::<Option<NaiveDateTime>, _>(index)),
        "TIMESTAMPTZ" => opt(row.try_get::<Option<DateTime<Utc>>, _>(index)),
        "JSON" | "JSONB" => opt(row.try_get::<Option<JsonValue>, _>(index)),
        _ => None,
    };
    rendered.unwrap_or_else(|| format!("<{type_name}>"))
}

/// One warn/fail test with row alerting enabled, carrying everything the
/// diagnostic rows inherit.
#[derive(Debug, Clone)]
pub struct FailedTest {
    pub unique_id: String,
    pub run_id: String,
    pub alias: String,
    pub run_created_at: String,
    pub compiled_sql: String,
    pub row_limit: usize,
    /// Pre-flatten joined attribute bag (status + manifest node + run).
    pub attributes: JsonMap,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// Re-executes each failed test's compiled query and maps the rows into
/// uploadable records. A test whose retries are exhausted yields one
/// diagnostic record and abandons the rest of the batch; callers get every
/// record accumulated up to that point.
pub async fn fetch_failed_test_rows(
    warehouse: &dyn Warehouse,
    tests: &[FailedTest],
    policy: &RetryPolicy,
) -> Vec<Record> {
    let mut records = Vec::new();
    for test in tests {
        info!(unique_id = %test.unique_id, run_id = %test.run_id, "fetching failed test rows");
        match query_with_retry(warehouse, test, policy).await {
            Ok(rows) => {
                for row in rows {
                    records.push(failed_row_record(test, &row));
                }
            }
            Err(err) => {
                warn!(
                    unique_id = %test.unique_id,
                    error = %err,
                    attempts = policy.max_attempts,
                    "failed test query exhausted retries; abandoning remaining tests"
                );
                records.push(exhausted_record(test, &err));
                return records;
            }
        }
    }
    records
}

async fn query_with_retry(
    warehouse: &dyn Warehouse,
    test: &FailedTest,
    policy: &RetryPolicy,
) -> Result<Vec<SqlRow>, WarehouseError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match warehouse.query_rows(&test.compiled_sql, test.row_limit).await {
            Ok(rows) => return Ok(rows),
            Err(err) if attempt < policy.max_attempts => {
                warn!(
                    unique_id = %test.unique_id,
                    attempt,
                    error = %err,
                    "failed test query errored; retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn failed_row_record(test: &FailedTest, row: &SqlRow) -> Record {
    let mut bag = JsonMap::new();
    for (index, (column, value)) in row
        .columns
        .iter()
        .zip(&row.values)
        .take(MAX_ROW_FIELDS)
        .enumerate()
    {
        bag.insert(
            format!("field_{}", index + 1),
            JsonValue::from(format!("{column}: {value}")),
        );
    }
    bag.extend(test.attributes.clone());
    stamp(&mut bag, test);
    bag.insert(
        ENTITY_ID_KEY.to_string(),
        JsonValue::from(new_entity_id()),
    );
    flatten(&bag, "")
}

fn exhausted_record(test: &FailedTest, err: &WarehouseError) -> Record {
    let mut bag = test.attributes.clone();
    bag.insert(
        "field_1".to_string(),
        JsonValue::from(format!("test_sql_error = {err}")),
    );
    stamp(&mut bag, test);
    flatten(&bag, "")
}

fn stamp(bag: &mut JsonMap, test: &FailedTest) {
    bag.insert(
        EVENT_TYPE_KEY.to_string(),
        JsonValue::from(FAILED_TEST_ROW_EVENT),
    );
    bag.insert(
        ENTITY_NAME_KEY.to_string(),
        JsonValue::from(entity_display_name(&test.alias, &test.run_created_at)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedWarehouse {
        calls: AtomicUsize,
        outcomes: Mutex<Vec<Result<Vec<SqlRow>, WarehouseError>>>,
        seen_limits: Mutex<Vec<usize>>,
    }

    impl ScriptedWarehouse {
        fn new(outcomes: Vec<Result<Vec<SqlRow>, WarehouseError>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(outcomes),
                seen_limits: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Warehouse for ScriptedWarehouse {
        async fn query_rows(
            &self,
            _sql: &str,
            max_rows: usize,
        ) -> Result<Vec<SqlRow>, WarehouseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_limits.lock().unwrap().push(max_rows);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Err(WarehouseError::Sql(sqlx::Error::RowNotFound));
            }
            outcomes.remove(0)
        }
    }

    fn sql_error() -> WarehouseError {
        WarehouseError::Sql(sqlx::Error::PoolTimedOut)
    }

    fn failed_test(unique_id: &str, row_limit: usize) -> FailedTest {
        let mut attributes = JsonMap::new();
        attributes.insert("unique_id".to_string(), JsonValue::from(unique_id));
        attributes.insert("run_id".to_string(), JsonValue::from("299381"));
        attributes.insert("status".to_string(), JsonValue::from("fail"));
        attributes.insert("team".to_string(), JsonValue::from("Data Engineering"));
        FailedTest {
            unique_id: unique_id.to_string(),
            run_id: "299381".to_string(),
            alias: "not_null_orders_id".to_string(),
            run_created_at: "2026-03-01 11:50:00".to_string(),
            compiled_sql: "select * from analytics.orders where id is null".to_string(),
            row_limit,
            attributes,
        }
    }

    fn row(columns: &[&str], values: &[&str]) -> SqlRow {
        SqlRow {
            columns: columns.iter().map(ToString::to_string).collect(),
            values: values.iter().map(ToString::to_string).collect(),
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn rows_map_into_indexed_fields() {
        let warehouse = ScriptedWarehouse::new(vec![Ok(vec![row(
            &["ORDER_ID", "AMOUNT"],
            &["1001", "null"],
        )])]);
        let records =
            fetch_failed_test_rows(&warehouse, &[failed_test("test.a", 50)], &quick_policy())
                .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_str("field_1"), Some("ORDER_ID: 1001"));
        assert_eq!(records[0].get_str("field_2"), Some("AMOUNT: null"));
        assert_eq!(records[0].get_str("eventType"), Some(FAILED_TEST_ROW_EVENT));
        assert_eq!(
            records[0].get_str("entity_name"),
            Some("not_null_orders_id - 2026-03-01 11:50:00")
        );
        assert_eq!(records[0].get_str("team"), Some("Data Engineering"));
        assert!(records[0].get_str("entity_id").is_some());
        assert_eq!(*warehouse.seen_limits.lock().unwrap(), vec![50]);
    }

    #[tokio::test]
    async fn only_first_ten_columns_become_fields() {
        let columns: Vec<String> = (1..=12).map(|i| format!("C{i}")).collect();
        let values: Vec<String> = (1..=12).map(|i| format!("v{i}")).collect();
        let warehouse = ScriptedWarehouse::new(vec![Ok(vec![SqlRow { columns, values }])]);
        let records =
            fetch_failed_test_rows(&warehouse, &[failed_test("test.a", 100)], &quick_policy())
                .await;
        assert_eq!(records[0].get_str("field_10"), Some("C10: v10"));
        assert!(records[0].get("field_11").is_none());
    }

    #[tokio::test]
    async fn transient_error_retries_then_succeeds() {
        let warehouse = ScriptedWarehouse::new(vec![
            Err(sql_error()),
            Ok(vec![row(&["ID"], &["7"])]),
        ]);
        let records =
            fetch_failed_test_rows(&warehouse, &[failed_test("test.a", 100)], &quick_policy())
                .await;
        assert_eq!(warehouse.calls(), 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_str("field_1"), Some("ID: 7"));
    }

    #[tokio::test]
    async fn exhausted_retries_emit_diagnostic_and_abandon_batch() {
        let warehouse = ScriptedWarehouse::new(vec![
            Err(sql_error()),
            Err(sql_error()),
            Err(sql_error()),
        ]);
        let tests = vec![failed_test("test.a", 100), failed_test("test.b", 100)];
        let records = fetch_failed_test_rows(&warehouse, &tests, &quick_policy()).await;
        // Exactly max_attempts calls, all for the first test.
        assert_eq!(warehouse.calls(), 3);
        assert_eq!(records.len(), 1);
        let field_1 = records[0].get_str("field_1").unwrap();
        assert!(field_1.starts_with("test_sql_error = "));
        assert_eq!(records[0].get_str("eventType"), Some(FAILED_TEST_ROW_EVENT));
    }

    #[tokio::test]
    async fn successes_before_exhaustion_are_kept() {
        let warehouse = ScriptedWarehouse::new(vec![
            Ok(vec![row(&["ID"], &["1"]), row(&["ID"], &["2"])]),
            Err(sql_error()),
            Err(sql_error()),
            Err(sql_error()),
        ]);
        let tests = vec![
            failed_test("test.a", 100),
            failed_test("test.b", 100),
            failed_test("test.c", 100),
        ];
        let records = fetch_failed_test_rows(&warehouse, &tests, &quick_policy()).await;
        // Two rows from the first test, one diagnostic from the second,
        // nothing from the third.
        assert_eq!(records.len(), 3);
        assert_eq!(warehouse.calls(), 4);
    }
}
