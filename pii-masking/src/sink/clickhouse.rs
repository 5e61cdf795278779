use std::time::Duration;

use async_trait::async_trait;
use common_metrics::timing_guard;
use metrics::counter;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    config::SinkConfig,
    error::{SinkClientError, SinkError},
    metric_consts::{ROWS_FAILED, ROWS_WRITTEN, SINK_RETRIES, SINK_ROW_FALLBACK, SINK_WRITE_TIME},
    schema::SchemaDescriptor,
    types::Record,
    write_result::FailedRowReport,
};

use super::{retry::RetryPolicy, RowSink, TableLocator};

// Timestamps arrive in whatever ISO 8601 flavour upstream produced; unknown
// fields fail the row rather than being silently dropped.
const INSERT_SETTINGS: &[(&str, &str)] = &[
    ("date_time_input_format", "best_effort"),
    ("input_format_skip_unknown_fields", "0"),
];

/// Appends rows to a ClickHouse table over the HTTP interface.
///
/// A batch goes out as one `JSONEachRow` insert. When the server rejects it,
/// the rows are re-sent one at a time so that only the offending ones get
/// reported. Transient failures are retried with backoff before giving up.
pub struct ClickHouseSink {
    client: Client,
    url: Url,
    user: String,
    password: String,
    table: TableLocator,
    schema: &'static SchemaDescriptor,
    retry_policy: RetryPolicy,
}

impl ClickHouseSink {
    pub fn new(
        config: &SinkConfig,
        schema: &'static SchemaDescriptor,
    ) -> Result<Self, SinkClientError> {
        let client = Client::builder()
            .user_agent("PII Masking Worker")
            .timeout(config.timeout())
            .build()?;
        let retry_policy = RetryPolicy::new(
            2,
            Duration::from_millis(config.retry_initial_interval_ms),
            Some(Duration::from_millis(config.retry_max_interval_ms)),
            config.max_attempts,
        );

        Ok(Self {
            client,
            url: config.clickhouse_url()?,
            user: config.clickhouse_user.clone(),
            password: config.clickhouse_password.clone(),
            table: config.table()?,
            schema,
            retry_policy,
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn table(&self) -> &TableLocator {
        &self.table
    }

    /// Creates the table from the schema if it doesn't exist yet.
    pub async fn ensure_table(&self) -> Result<(), SinkError> {
        let ddl = self.schema.create_table_ddl(&self.table.to_string());
        self.execute_with_retry(&ddl, &[], String::new()).await?;
        info!("ensured output table {} exists", self.table);
        Ok(())
    }

    fn insert_query(&self) -> String {
        format!("INSERT INTO {} FORMAT JSONEachRow", self.table)
    }

    async fn execute(
        &self,
        query: &str,
        settings: &[(&str, &str)],
        body: String,
    ) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.url.clone())
            .query(&[("query", query)])
            .query(settings)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = if text.trim().is_empty() {
            format!("clickhouse returned {status}")
        } else {
            text.trim().to_string()
        };

        if is_retryable_status(status) {
            Err(SinkError::Transient(message))
        } else {
            Err(SinkError::Rejected(message))
        }
    }

    async fn execute_with_retry(
        &self,
        query: &str,
        settings: &[(&str, &str)],
        body: String,
    ) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            match self.execute(query, settings, body.clone()).await {
                Err(e) if e.is_transient() && self.retry_policy.should_retry(attempt) => {
                    let wait = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        "transient sink error on attempt {}, retrying in {:?}: {}",
                        attempt + 1,
                        wait,
                        e
                    );
                    counter!(SINK_RETRIES).increment(1);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn insert(&self, lines: &[String]) -> Result<(), SinkError> {
        self.execute_with_retry(&self.insert_query(), INSERT_SETTINGS, lines.join("\n"))
            .await
    }

    fn report(&self, row: Value, error: &SinkError) -> FailedRowReport {
        FailedRowReport::Triple {
            table: Value::String(format!("{}.{}", self.table.database, self.table.table)),
            row,
            errors: json!([error.to_string()]),
        }
    }
}

#[async_trait]
impl RowSink for ClickHouseSink {
    async fn write(&self, rows: Vec<Record>) -> Vec<FailedRowReport> {
        if rows.is_empty() {
            return Vec::new();
        }

        let timer = timing_guard(SINK_WRITE_TIME, &[]);
        let mut failures = Vec::new();
        let mut pending = Vec::with_capacity(rows.len());

        for row in rows {
            match row.to_json() {
                Ok(line) => pending.push((row, line)),
                Err(e) => failures.push(self.report(
                    row.into_value(),
                    &SinkError::Rejected(format!("failed to serialize row: {e}")),
                )),
            }
        }

        if pending.is_empty() {
            counter!(ROWS_FAILED).increment(failures.len() as u64);
            return failures;
        }

        let lines: Vec<String> = pending.iter().map(|(_, line)| line.clone()).collect();
        match self.insert(&lines).await {
            Ok(()) => {
                counter!(ROWS_WRITTEN).increment(pending.len() as u64);
                timer.label("outcome", "success").fin();
            }
            Err(e) if e.is_transient() => {
                // Out of attempts, every row of the batch is given up on
                warn!("giving up on batch of {} rows: {}", pending.len(), e);
                failures.extend(
                    pending
                        .into_iter()
                        .map(|(row, _)| self.report(row.into_value(), &e)),
                );
                timer.label("outcome", "transient").fin();
            }
            Err(e) => {
                warn!(
                    "batch of {} rows rejected, retrying row by row: {}",
                    pending.len(),
                    e
                );
                counter!(SINK_ROW_FALLBACK).increment(1);
                let mut written = 0;
                for (row, line) in pending {
                    match self.insert(std::slice::from_ref(&line)).await {
                        Ok(()) => written += 1,
                        Err(e) => failures.push(self.report(row.into_value(), &e)),
                    }
                }
                counter!(ROWS_WRITTEN).increment(written);
                timer.label("outcome", "row_fallback").fin();
            }
        }

        counter!(ROWS_FAILED).increment(failures.len() as u64);
        failures
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use httpmock::{Method::POST, MockServer};

    use super::*;
    use crate::schema::AUDIT_LOG_SCHEMA;

    const INSERT: &str = "INSERT INTO `analytics`.`masked_logs` FORMAT JSONEachRow";

    fn sink(server: &MockServer, max_attempts: u32) -> ClickHouseSink {
        sink_with_timeout(server, max_attempts, 2000)
    }

    fn sink_with_timeout(
        server: &MockServer,
        max_attempts: u32,
        timeout_ms: u64,
    ) -> ClickHouseSink {
        let config = SinkConfig {
            output_table: "analytics.masked_logs".to_string(),
            clickhouse_url: server.base_url(),
            clickhouse_user: "writer".to_string(),
            clickhouse_password: "hunter2".to_string(),
            timeout_ms,
            max_attempts,
            retry_initial_interval_ms: 1,
            retry_max_interval_ms: 5,
        };
        ClickHouseSink::new(&config, &AUDIT_LOG_SCHEMA).unwrap()
    }

    fn row(principal: &str) -> Record {
        Record::try_from(json!({"userIamPrincipal": principal, "methodName": "search"})).unwrap()
    }

    #[test]
    fn test_is_retryable_status() {
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn writes_a_batch_in_one_insert() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/")
                .query_param("query", INSERT)
                .query_param("date_time_input_format", "best_effort")
                .header("x-clickhouse-user", "writer")
                .header("x-clickhouse-key", "hunter2")
                .body_contains("user:one")
                .body_contains("user:two");
            then.status(200);
        });

        let failures = sink(&server, 3).write(vec![row("user:one"), row("user:two")]).await;

        mock.assert_hits(1);
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn rejected_batch_isolates_the_bad_rows() {
        let server = MockServer::start();
        let bad = server.mock(|when, then| {
            when.method(POST).path("/").body_contains("user:bad");
            then.status(400)
                .body("Code: 27. DB::Exception: Cannot parse input");
        });
        let good = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200);
        });

        let failures = sink(&server, 3)
            .write(vec![row("user:good"), row("user:bad")])
            .await;

        // Batch, then the bad row on its own
        bad.assert_hits(2);
        good.assert_hits(1);
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            FailedRowReport::Triple { table, row, errors } => {
                assert_eq!(table, &json!("analytics.masked_logs"));
                assert_eq!(row["userIamPrincipal"], json!("user:bad"));
                assert!(errors[0].as_str().unwrap().contains("Cannot parse input"));
            }
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_then_reported() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(503).body("too many simultaneous queries");
        });

        let failures = sink(&server, 3).write(vec![row("user:one")]).await;

        mock.assert_hits(3);
        assert_eq!(failures.len(), 1);
        let errors = match &failures[0] {
            FailedRowReport::Triple { errors, .. } => errors,
            other => panic!("unexpected report {other:?}"),
        };
        assert!(errors[0]
            .as_str()
            .unwrap()
            .contains("too many simultaneous queries"));
    }

    #[tokio::test]
    async fn unanswered_requests_time_out_and_are_reported() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200).delay(Duration::from_secs(20));
        });

        let sink = sink_with_timeout(&server, 2, 100);
        let write = sink.write(vec![row("user:slow")]);
        let failures = tokio::time::timeout(Duration::from_secs(5), write)
            .await
            .expect("write must give up once its requests time out");

        mock.assert_hits(2);
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            FailedRowReport::Triple { table, row, errors } => {
                assert_eq!(table, &json!("analytics.masked_logs"));
                assert_eq!(row["userIamPrincipal"], json!("user:slow"));
                assert!(errors[0]
                    .as_str()
                    .unwrap()
                    .starts_with("transient sink error"));
            }
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_error_then_success_reports_nothing() {
        let server = MockServer::start();
        let mut flaky = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(500);
        });

        let sink = sink(&server, 5).with_retry_policy(RetryPolicy::new(
            1,
            Duration::from_millis(200),
            None,
            5,
        ));
        let write = tokio::spawn(async move { sink.write(vec![row("user:one")]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        flaky.delete();
        let ok = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200);
        });

        let failures = write.await.unwrap();
        assert!(failures.is_empty());
        ok.assert_hits(1);
    }

    #[tokio::test]
    async fn empty_batches_are_not_sent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });

        assert!(sink(&server, 3).write(Vec::new()).await.is_empty());
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn creates_the_table_from_the_schema() {
        let server = MockServer::start();
        let ddl = AUDIT_LOG_SCHEMA.create_table_ddl("`analytics`.`masked_logs`");
        let mock = server.mock(|when, then| {
            when.method(POST).path("/").query_param("query", ddl.as_str());
            then.status(200);
        });

        sink(&server, 3).ensure_table().await.unwrap();

        mock.assert();
    }

    #[tokio::test]
    async fn rejected_ddl_is_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(403).body("Not enough privileges");
        });

        let err = sink(&server, 3).ensure_table().await.unwrap_err();

        mock.assert_hits(1);
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Not enough privileges");
    }
}
