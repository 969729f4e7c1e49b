//! Read-only access to the sample warehouse.
//!
//! The dashboard only ever runs the fixed catalogue in [`queries`]. Results
//! come back as [`RawQueryResult`]s, which the metrics aggregator folds into
//! the response document.

pub mod bigquery;
pub mod credentials;
pub mod queries;

pub use bigquery::{BigQueryClient, BigQueryConfig};
pub use credentials::CredentialSource;
pub use queries::{QueryCatalog, QueryName, WarehouseQuery};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by the query layer.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Connection failure, timeout, server error or failed query.
    #[error("warehouse unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The service credential was rejected or could not be obtained.
    #[error("warehouse authorization failed: {0}")]
    Authorization(String),
}

/// A single scalar cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Text form of the cell, `None` for NULL.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Scalar::Null => None,
            Scalar::Int(v) => Some(v.to_string()),
            Scalar::Float(v) => Some(v.to_string()),
            Scalar::Text(s) => Some(s.clone()),
            Scalar::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Scalar::Timestamp(ts) => Some(ts.to_rfc3339()),
        }
    }
}

/// One result row: column name to cell.
pub type Row = HashMap<String, Scalar>;

/// Rows returned by one query, in warehouse order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQueryResult {
    pub rows: Vec<Row>,
}

impl RawQueryResult {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row<I, K>(cells: I) -> Row
where
    I: IntoIterator<Item = (K, Scalar)>,
    K: Into<String>,
{
    cells.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// A read-only source the dashboard queries.
///
/// One instance is shared by every request, so implementations must be safe
/// for concurrent use and must not mutate per-request state.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run one catalogue query and return its rows.
    async fn run(&self, query: &WarehouseQuery) -> Result<RawQueryResult, QueryError>;
}
