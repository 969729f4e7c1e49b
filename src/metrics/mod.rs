//! Metrics collection.
//!
//! Runs every catalogue query concurrently, waits for all of them, and
//! folds the results into one [`MetricsDocument`]. Any failure aborts the
//! whole document; nothing is returned partially filled.

pub mod aggregator;

pub use aggregator::{build_document, ShapeLimits};

use crate::models::MetricsDocument;
use crate::warehouse::{QueryCatalog, QueryError, QueryName, Warehouse};
use futures::future::try_join_all;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Errors produced while building the metrics document.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A warehouse query failed; carries the query layer's error unchanged.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Rows came back but could not be shaped into the document.
    #[error("aggregation failed for {metric}: {reason}")]
    AggregationFailed { metric: QueryName, reason: String },
}

/// Runs the catalogue and shapes the results.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    catalog: QueryCatalog,
    limits: ShapeLimits,
    query_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(catalog: QueryCatalog, limits: ShapeLimits, query_timeout: Duration) -> Self {
        Self {
            catalog,
            limits,
            query_timeout,
        }
    }

    /// Query the warehouse and build a fresh document.
    pub async fn collect(&self, warehouse: &dyn Warehouse) -> Result<MetricsDocument, MetricsError> {
        let start = Instant::now();

        let pending = self.catalog.queries().iter().map(|query| async move {
            let result = warehouse.run(query).await?;
            Ok::<_, QueryError>((query.name, result))
        });

        let results = tokio::time::timeout(self.query_timeout, try_join_all(pending))
            .await
            .map_err(|_| {
                QueryError::UpstreamUnavailable(format!(
                    "Queries did not finish within {}s",
                    self.query_timeout.as_secs()
                ))
            })??;

        debug!(
            "Fetched {} query results in {:.2}s",
            results.len(),
            start.elapsed().as_secs_f64()
        );

        let results: HashMap<_, _> = results.into_iter().collect();
        build_document(&results, &self.limits)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory warehouse used by tests across the crate.

    use crate::warehouse::{
        QueryError, QueryName, RawQueryResult, Warehouse, WarehouseQuery,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// What the fake returns for one query.
    pub enum Canned {
        Rows(RawQueryResult),
        Unavailable,
        Unauthorized,
        Hang,
    }

    #[derive(Default)]
    pub struct FakeWarehouse {
        canned: HashMap<QueryName, Canned>,
        pub calls: AtomicUsize,
    }

    impl FakeWarehouse {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, name: QueryName, canned: Canned) -> Self {
            self.canned.insert(name, canned);
            self
        }

        pub fn with_rows(self, name: QueryName, rows: RawQueryResult) -> Self {
            self.with(name, Canned::Rows(rows))
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Warehouse for FakeWarehouse {
        async fn run(&self, query: &WarehouseQuery) -> Result<RawQueryResult, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.canned.get(&query.name) {
                None => Ok(RawQueryResult::empty()),
                Some(Canned::Rows(rows)) => Ok(rows.clone()),
                Some(Canned::Unavailable) => Err(QueryError::UpstreamUnavailable(
                    "connection refused".to_string(),
                )),
                Some(Canned::Unauthorized) => Err(QueryError::Authorization(
                    "token expired".to_string(),
                )),
                Some(Canned::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(RawQueryResult::empty())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Canned, FakeWarehouse};
    use super::*;
    use crate::warehouse::queries::CatalogParams;
    use crate::warehouse::{row, RawQueryResult, Scalar};

    fn collector(timeout: Duration) -> MetricsCollector {
        let catalog = QueryCatalog::new(&CatalogParams {
            table_prefix: "mf-crucible.crucible".to_string(),
            collection_project: "10k_perovskites".to_string(),
            relationship_row_limit: 500,
            spectra_per_sample: 8,
        })
        .unwrap();
        MetricsCollector::new(catalog, ShapeLimits::default(), timeout)
    }

    fn count(n: i64) -> RawQueryResult {
        RawQueryResult::new(vec![row([("count", Scalar::Int(n))])])
    }

    #[tokio::test]
    async fn test_collect_runs_every_query() {
        let warehouse = FakeWarehouse::new()
            .with_rows(QueryName::ThinFilmCount, count(120))
            .with_rows(QueryName::DatasetCount, count(800));

        let doc = collector(Duration::from_secs(5))
            .collect(&warehouse)
            .await
            .unwrap();

        assert_eq!(warehouse.call_count(), QueryName::ALL.len());
        assert_eq!(doc.thin_films_count, 120);
        assert_eq!(doc.datasets_count, 800);
        assert_eq!(doc.uvvis_spectra_count, 0);
    }

    #[tokio::test]
    async fn test_single_failure_fails_the_document() {
        let warehouse = FakeWarehouse::new()
            .with_rows(QueryName::ThinFilmCount, count(120))
            .with(QueryName::PrecursorLinks, Canned::Unavailable);

        let err = collector(Duration::from_secs(5))
            .collect(&warehouse)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MetricsError::Query(QueryError::UpstreamUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_authorization_error_keeps_its_kind() {
        let warehouse = FakeWarehouse::new().with(QueryName::DatasetCount, Canned::Unauthorized);

        let err = collector(Duration::from_secs(5))
            .collect(&warehouse)
            .await
            .unwrap_err();

        assert!(matches!(err, MetricsError::Query(QueryError::Authorization(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_times_out_as_upstream_unavailable() {
        let warehouse = FakeWarehouse::new().with(QueryName::ThinFilmsOverTime, Canned::Hang);

        let err = collector(Duration::from_secs(30))
            .collect(&warehouse)
            .await
            .unwrap_err();

        match err {
            MetricsError::Query(QueryError::UpstreamUnavailable(msg)) => {
                assert!(msg.contains("30s"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
