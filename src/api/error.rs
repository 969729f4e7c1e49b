//! Mapping metrics failures to HTTP responses.
//!
//! Clients only ever see a fixed message; the full error goes to the log.

use crate::metrics::MetricsError;
use crate::warehouse::QueryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

pub const UPSTREAM_MESSAGE: &str = "The data warehouse is currently unavailable.";
pub const AUTHORIZATION_MESSAGE: &str =
    "The dashboard is not authorized to query the data warehouse.";
pub const AGGREGATION_MESSAGE: &str = "Dashboard metrics could not be assembled.";

/// Error body returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl MetricsError {
    /// Status code and client-facing message for this error.
    pub fn public_parts(&self) -> (StatusCode, &'static str) {
        match self {
            MetricsError::Query(QueryError::UpstreamUnavailable(_)) => {
                (StatusCode::BAD_GATEWAY, UPSTREAM_MESSAGE)
            }
            MetricsError::Query(QueryError::Authorization(_)) => {
                (StatusCode::BAD_GATEWAY, AUTHORIZATION_MESSAGE)
            }
            MetricsError::AggregationFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, AGGREGATION_MESSAGE)
            }
        }
    }
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        let (status, message) = self.public_parts();
        error!("Failed to build dashboard data ({}): {}", status, self);

        (
            status,
            Json(ErrorResponse {
                error: message.to_string(),
            }),
        )
            .into_response()
    }
}
