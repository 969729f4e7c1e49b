//! The fixed query catalogue.
//!
//! Queries are rendered once at startup from configuration. Nothing from an
//! incoming request ever reaches the SQL text.

use anyhow::{bail, Result};
use std::fmt;

/// Identifies a catalogue query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryName {
    ThinFilmCount,
    UvVisSpectraCount,
    DatasetCount,
    SampleTypeDistribution,
    DatasetTypeDistribution,
    ThinFilmsOverTime,
    PrecursorLinks,
    MeasurementCounts,
    LatestSampleWell,
}

impl QueryName {
    pub const ALL: [QueryName; 9] = [
        QueryName::ThinFilmCount,
        QueryName::UvVisSpectraCount,
        QueryName::DatasetCount,
        QueryName::SampleTypeDistribution,
        QueryName::DatasetTypeDistribution,
        QueryName::ThinFilmsOverTime,
        QueryName::PrecursorLinks,
        QueryName::MeasurementCounts,
        QueryName::LatestSampleWell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryName::ThinFilmCount => "thin_film_count",
            QueryName::UvVisSpectraCount => "uvvis_spectra_count",
            QueryName::DatasetCount => "dataset_count",
            QueryName::SampleTypeDistribution => "sample_type_distribution",
            QueryName::DatasetTypeDistribution => "dataset_type_distribution",
            QueryName::ThinFilmsOverTime => "thin_films_over_time",
            QueryName::PrecursorLinks => "precursor_links",
            QueryName::MeasurementCounts => "measurement_counts",
            QueryName::LatestSampleWell => "latest_sample_well",
        }
    }

    fn template(&self) -> &'static str {
        match self {
            QueryName::ThinFilmCount => THIN_FILM_COUNT_SQL,
            QueryName::UvVisSpectraCount => UVVIS_SPECTRA_COUNT_SQL,
            QueryName::DatasetCount => DATASET_COUNT_SQL,
            QueryName::SampleTypeDistribution => SAMPLE_TYPE_DISTRIBUTION_SQL,
            QueryName::DatasetTypeDistribution => DATASET_TYPE_DISTRIBUTION_SQL,
            QueryName::ThinFilmsOverTime => THIN_FILMS_OVER_TIME_SQL,
            QueryName::PrecursorLinks => PRECURSOR_LINKS_SQL,
            QueryName::MeasurementCounts => MEASUREMENT_COUNTS_SQL,
            QueryName::LatestSampleWell => LATEST_SAMPLE_WELL_SQL,
        }
    }
}

impl fmt::Display for QueryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered catalogue query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseQuery {
    pub name: QueryName,
    pub sql: String,
}

/// Parameters the catalogue is rendered with.
#[derive(Debug, Clone)]
pub struct CatalogParams {
    /// Fully qualified dataset holding the tables, e.g. `mf-crucible.crucible`.
    pub table_prefix: String,
    /// Collection the dashboard reports on, e.g. `10k_perovskites`.
    pub collection_project: String,
    /// Upper bound on precursor link rows fetched.
    pub relationship_row_limit: usize,
    /// Spectra recorded for each sample in a UV-Vis dataset.
    pub spectra_per_sample: u64,
}

/// Every query the dashboard runs, rendered and ready to send.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    queries: Vec<WarehouseQuery>,
}

impl QueryCatalog {
    pub fn new(params: &CatalogParams) -> Result<Self> {
        if !is_safe_identifier(&params.table_prefix) {
            bail!("Invalid table prefix: {:?}", params.table_prefix);
        }
        if !is_safe_identifier(&params.collection_project) {
            bail!("Invalid collection project: {:?}", params.collection_project);
        }
        if params.relationship_row_limit == 0 {
            bail!("Relationship row limit must be at least 1");
        }

        let queries = QueryName::ALL
            .iter()
            .map(|name| WarehouseQuery {
                name: *name,
                sql: render(name.template(), params),
            })
            .collect();

        Ok(Self { queries })
    }

    pub fn queries(&self) -> &[WarehouseQuery] {
        &self.queries
    }

    pub fn get(&self, name: QueryName) -> Option<&WarehouseQuery> {
        self.queries.iter().find(|q| q.name == name)
    }
}

/// Identifiers are spliced into SQL, so only a conservative charset is allowed.
pub fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn render(template: &str, params: &CatalogParams) -> String {
    template
        .replace("{table}", &params.table_prefix)
        .replace("{project}", &params.collection_project)
        .replace("{row_limit}", &params.relationship_row_limit.to_string())
        .replace("{spectra_per_sample}", &params.spectra_per_sample.to_string())
}

const THIN_FILM_COUNT_SQL: &str = r#"
SELECT COUNT(*) AS count
FROM `{table}.sample`
WHERE project_id = '{project}'
  AND LOWER(sample_type) = 'thin film'
"#;

const UVVIS_SPECTRA_COUNT_SQL: &str = r#"
SELECT SUM(sample_count * {spectra_per_sample}) AS count
FROM (
    SELECT d.id, COUNT(DISTINCT dsl.sample_id) AS sample_count
    FROM `{table}.dataset` d
    LEFT JOIN `{table}.datasetsamplelink` dsl ON d.id = dsl.dataset_id
    WHERE d.project_id = '{project}'
      AND LOWER(d.measurement) LIKE '%pollux_oospec%'
    GROUP BY d.id
)
"#;

const DATASET_COUNT_SQL: &str = r#"
SELECT COUNT(*) AS count
FROM `{table}.dataset`
WHERE project_id = '{project}'
"#;

const SAMPLE_TYPE_DISTRIBUTION_SQL: &str = r#"
SELECT COALESCE(sample_type, 'Unknown') AS category, COUNT(*) AS count
FROM `{table}.sample`
WHERE project_id = '{project}'
GROUP BY category
ORDER BY count DESC, category
"#;

const DATASET_TYPE_DISTRIBUTION_SQL: &str = r#"
SELECT COALESCE(measurement, 'Unknown') AS category, COUNT(*) AS count
FROM `{table}.dataset`
WHERE project_id = '{project}'
GROUP BY category
ORDER BY count DESC, category
"#;

const THIN_FILMS_OVER_TIME_SQL: &str = r#"
SELECT DATE(created) AS day, COUNT(*) AS count
FROM (
    SELECT COALESCE(
        SAFE.PARSE_TIMESTAMP('%Y-%m-%dT%H:%M:%E*S%Ez', date_created),
        SAFE.PARSE_TIMESTAMP('%Y-%m-%dT%H:%M:%S', date_created)
    ) AS created
    FROM `{table}.sample`
    WHERE project_id = '{project}'
      AND LOWER(sample_type) = 'thin film'
      AND date_created IS NOT NULL
)
WHERE created IS NOT NULL
GROUP BY day
ORDER BY day
"#;

// Rows are ranked by each parent's total before the limit, so truncation
// drops the smallest parents first.
const PRECURSOR_LINKS_SQL: &str = r#"
SELECT parent, child, total
FROM (
    SELECT
        ps.sample_name AS parent,
        tf.sample_name AS child,
        COUNT(*) OVER (PARTITION BY ps.sample_name) AS total
    FROM `{table}.sample` tf
    JOIN `{table}.samplelink` sl ON tf.id = sl.sample_id
    JOIN `{table}.sample` ps ON sl.parent_sample_id = ps.id
    WHERE tf.project_id = '{project}'
      AND LOWER(tf.sample_type) = 'thin film'
      AND LOWER(ps.sample_type) = 'precursor solution'
)
ORDER BY total DESC, parent, child
LIMIT {row_limit}
"#;

const MEASUREMENT_COUNTS_SQL: &str = r#"
SELECT
    COUNTIF(LOWER(measurement) LIKE '%spin%') AS spin_runs,
    COUNTIF(LOWER(measurement) LIKE '%sample well%') AS sample_wells,
    COUNTIF(LOWER(measurement) LIKE '%oospec%') AS uvvis_datasets
FROM `{table}.dataset`
WHERE project_id = '{project}'
"#;

const LATEST_SAMPLE_WELL_SQL: &str = r#"
SELECT
    s.id AS sample_id,
    s.sample_name AS sample_name,
    d.unique_id AS dataset_id,
    d.dataset_name AS dataset_name,
    s.date_created AS date_created,
    DATE(SAFE.PARSE_TIMESTAMP('%Y-%m-%dT%H:%M:%E*S%Ez', s.date_created)) = CURRENT_DATE() AS is_today
FROM `{table}.sample` s
JOIN `{table}.datasetsamplelink` dsl ON s.id = dsl.sample_id
JOIN `{table}.dataset` d ON dsl.dataset_id = d.id
WHERE s.project_id = '{project}'
  AND LOWER(d.measurement) LIKE '%sample well%'
  AND d.file_to_upload IS NOT NULL
  AND s.date_created IS NOT NULL
ORDER BY SAFE.PARSE_TIMESTAMP('%Y-%m-%dT%H:%M:%E*S%Ez', s.date_created) DESC
LIMIT 1
"#;
