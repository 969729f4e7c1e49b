//! BigQuery REST client.
//!
//! Runs catalogue queries through the `jobs.query` endpoint and decodes the
//! string-encoded result cells into [`Scalar`]s.

use super::credentials::{CredentialSource, TokenProvider};
use super::{QueryError, RawQueryResult, Row, Scalar, Warehouse, WarehouseQuery};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Settings for the BigQuery client.
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub api_url: String,
    pub billing_project: String,
    pub credentials: CredentialSource,
    pub timeout_seconds: u64,
    pub max_results: u32,
}

/// `jobs.query` request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    max_results: u32,
}

/// Shared shape of `jobs.query` and `jobs.getQueryResults` responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: Option<bool>,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// BigQuery-backed [`Warehouse`].
///
/// Cheap to share: the inner `reqwest::Client` pools connections and is safe
/// for concurrent use.
pub struct BigQueryClient {
    config: BigQueryConfig,
    http_client: reqwest::Client,
    tokens: TokenProvider,
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        let tokens = TokenProvider::new(&config.credentials, http_client.clone())?;

        Ok(Self {
            config,
            http_client,
            tokens,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<QueryResponse, QueryError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                QueryError::UpstreamUnavailable(format!(
                    "Request timed out after {}s",
                    self.config.timeout_seconds
                ))
            } else if e.is_connect() {
                QueryError::UpstreamUnavailable(format!(
                    "Cannot connect to BigQuery at {}",
                    self.config.api_url
                ))
            } else {
                QueryError::UpstreamUnavailable(format!("Failed to send request: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|env| env.error.message)
                .unwrap_or(body);
            return Err(match status.as_u16() {
                401 | 403 => {
                    self.tokens.invalidate().await;
                    QueryError::Authorization(format!("BigQuery API error {}: {}", status, message))
                }
                _ => QueryError::UpstreamUnavailable(format!(
                    "BigQuery API error {}: {}",
                    status, message
                )),
            });
        }

        response.json().await.map_err(|e| {
            QueryError::UpstreamUnavailable(format!("Failed to parse BigQuery response: {}", e))
        })
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn run(&self, query: &WarehouseQuery) -> Result<RawQueryResult, QueryError> {
        let start = Instant::now();
        let token = self.tokens.token().await?;

        let url = format!(
            "{}/projects/{}/queries",
            self.config.api_url, self.config.billing_project
        );
        let body = QueryRequest {
            query: &query.sql,
            use_legacy_sql: false,
            timeout_ms: self.config.timeout_seconds.saturating_mul(1000),
            max_results: self.config.max_results,
        };

        let page = self
            .send(self.http_client.post(&url).bearer_auth(&token).json(&body))
            .await?;
        check_page(&page)?;

        let schema = page.schema.unwrap_or_default();
        let mut rows = decode_rows(&schema, page.rows)?;
        let mut job = page.job_reference;
        let mut next_token = page.page_token;

        // Small result sets fit in one page; follow tokens for anything larger.
        while let Some(page_token) = next_token.take() {
            let job_ref = job.as_ref().ok_or_else(|| {
                QueryError::UpstreamUnavailable("Paged response without a job reference".into())
            })?;
            debug!("Fetching next page of {} (job {})", query.name, job_ref.job_id);

            let url = format!(
                "{}/projects/{}/queries/{}",
                self.config.api_url, self.config.billing_project, job_ref.job_id
            );
            let mut params = vec![
                ("pageToken", page_token),
                ("maxResults", self.config.max_results.to_string()),
            ];
            if let Some(location) = &job_ref.location {
                params.push(("location", location.clone()));
            }

            let next = self
                .send(self.http_client.get(&url).bearer_auth(&token).query(&params))
                .await?;
            check_page(&next)?;
            rows.extend(decode_rows(&schema, next.rows)?);
            next_token = next.page_token;
            if next.job_reference.is_some() {
                job = next.job_reference;
            }
        }

        debug!(
            "Query {} returned {} rows in {:.2}s",
            query.name,
            rows.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(RawQueryResult::new(rows))
    }
}

fn check_page(page: &QueryResponse) -> Result<(), QueryError> {
    if let Some(first) = page.errors.first() {
        return Err(QueryError::UpstreamUnavailable(format!(
            "Query failed: {}",
            first.message
        )));
    }
    if page.job_complete == Some(false) {
        return Err(QueryError::UpstreamUnavailable(
            "Query did not complete within the timeout".to_string(),
        ));
    }
    Ok(())
}

fn decode_rows(schema: &TableSchema, rows: Vec<TableRow>) -> Result<Vec<Row>, QueryError> {
    rows.into_iter()
        .map(|row| {
            if row.f.len() != schema.fields.len() {
                warn!(
                    "Row has {} cells but schema has {} fields",
                    row.f.len(),
                    schema.fields.len()
                );
            }
            schema
                .fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| {
                    decode_cell(&field.field_type, cell.v).map(|v| (field.name.clone(), v))
                })
                .collect::<Result<Row, QueryError>>()
        })
        .collect()
}

/// Decode one BigQuery cell. The REST API encodes scalars as strings.
fn decode_cell(field_type: &str, value: Value) -> Result<Scalar, QueryError> {
    let text = match value {
        Value::Null => return Ok(Scalar::Null),
        Value::String(s) => s,
        // Repeated and record cells are kept as their JSON text.
        other => return Ok(Scalar::Text(other.to_string())),
    };

    let malformed = |kind: &str| {
        QueryError::UpstreamUnavailable(format!("Malformed {} cell: {:?}", kind, text))
    };

    match field_type.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT64" => text
            .parse::<i64>()
            .map(Scalar::Int)
            .map_err(|_| malformed("integer")),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
            .parse::<f64>()
            .map(Scalar::Float)
            .map_err(|_| malformed("float")),
        "DATE" => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map(Scalar::Date)
            .map_err(|_| malformed("date")),
        "TIMESTAMP" => {
            let seconds = text.parse::<f64>().map_err(|_| malformed("timestamp"))?;
            let whole = seconds.floor();
            let nanos = ((seconds - whole) * 1e9).round() as u32;
            DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
                .map(Scalar::Timestamp)
                .ok_or_else(|| malformed("timestamp"))
        }
        "DATETIME" => NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|dt| Scalar::Timestamp(dt.and_utc()))
            .map_err(|_| malformed("datetime")),
        _ => Ok(Scalar::Text(text)),
    }
}
