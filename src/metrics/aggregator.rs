//! Folding raw warehouse rows into dashboard metrics.
//!
//! Every function here is pure: it takes the rows one query returned and
//! produces one piece of the [`MetricsDocument`].

use super::MetricsError;
use crate::models::{
    CategoryCount, DailyCount, MeasurementCounts, MetricsDocument, Relationship,
    SampleWellSnapshot, OTHER_BUCKET, UNKNOWN_CATEGORY,
};
use crate::warehouse::{QueryName, RawQueryResult, Scalar};
use chrono::{DateTime, NaiveDate};
use std::collections::HashMap;

/// Bounds applied while shaping the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeLimits {
    /// Named categories kept in the dataset-type distribution.
    pub dataset_types_top_n: usize,
    /// Children listed per relationship entry.
    pub relationship_fanout_cap: usize,
}

impl Default for ShapeLimits {
    fn default() -> Self {
        Self {
            dataset_types_top_n: 10,
            relationship_fanout_cap: 10,
        }
    }
}

fn failed(metric: QueryName, reason: impl Into<String>) -> MetricsError {
    MetricsError::AggregationFailed {
        metric,
        reason: reason.into(),
    }
}

/// Build the full document from one result per catalogue query.
pub fn build_document(
    results: &HashMap<QueryName, RawQueryResult>,
    limits: &ShapeLimits,
) -> Result<MetricsDocument, MetricsError> {
    let result = |name: QueryName| {
        results
            .get(&name)
            .ok_or_else(|| failed(name, "query result missing"))
    };

    let sample_types = distribution(
        QueryName::SampleTypeDistribution,
        result(QueryName::SampleTypeDistribution)?,
    )?;
    let dataset_types = top_n(
        distribution(
            QueryName::DatasetTypeDistribution,
            result(QueryName::DatasetTypeDistribution)?,
        )?,
        limits.dataset_types_top_n,
    );

    Ok(MetricsDocument {
        thin_films_count: scalar_count(
            QueryName::ThinFilmCount,
            result(QueryName::ThinFilmCount)?,
            "count",
        )?,
        uvvis_spectra_count: scalar_count(
            QueryName::UvVisSpectraCount,
            result(QueryName::UvVisSpectraCount)?,
            "count",
        )?,
        datasets_count: scalar_count(
            QueryName::DatasetCount,
            result(QueryName::DatasetCount)?,
            "count",
        )?,
        sample_types_count: sample_types.len() as u64,
        measurement_counts: measurement_counts(result(QueryName::MeasurementCounts)?)?,
        sample_type_distribution: sample_types,
        dataset_type_distribution: dataset_types,
        samples_over_time: time_series(
            QueryName::ThinFilmsOverTime,
            result(QueryName::ThinFilmsOverTime)?,
        )?,
        thin_film_precursor_relationships: relationships(
            QueryName::PrecursorLinks,
            result(QueryName::PrecursorLinks)?,
            limits.relationship_fanout_cap,
        )?,
        latest_sample_well: latest_sample_well(result(QueryName::LatestSampleWell)?),
    })
}

/// Interpret a cell as a non-negative count. NULL counts as zero.
pub fn cell_to_count(metric: QueryName, cell: &Scalar) -> Result<u64, MetricsError> {
    match cell {
        Scalar::Null => Ok(0),
        Scalar::Int(v) => {
            u64::try_from(*v).map_err(|_| failed(metric, format!("negative count {}", v)))
        }
        Scalar::Float(v) if v.is_finite() && *v >= 0.0 && v.fract() == 0.0 => Ok(*v as u64),
        Scalar::Float(v) => Err(failed(metric, format!("invalid count {}", v))),
        Scalar::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| failed(metric, format!("invalid count {:?}", s))),
        other => Err(failed(metric, format!("invalid count {:?}", other))),
    }
}

/// Single-value count. An empty result is zero, not an error.
pub fn scalar_count(
    metric: QueryName,
    result: &RawQueryResult,
    column: &str,
) -> Result<u64, MetricsError> {
    match result.rows.first() {
        None => Ok(0),
        Some(row) => cell_to_count(metric, row.get(column).unwrap_or(&Scalar::Null)),
    }
}

/// `category`/`count` rows, in warehouse order.
pub fn distribution(
    metric: QueryName,
    result: &RawQueryResult,
) -> Result<Vec<CategoryCount>, MetricsError> {
    result
        .rows
        .iter()
        .map(|row| {
            let category = row
                .get("category")
                .and_then(Scalar::as_text)
                .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());
            let count = row
                .get("count")
                .ok_or_else(|| failed(metric, "row without a count column"))
                .and_then(|cell| cell_to_count(metric, cell))?;
            Ok(CategoryCount { category, count })
        })
        .collect()
}

/// Keep the first `n` categories and fold the remainder into [`OTHER_BUCKET`].
///
/// A warehouse category that is itself named [`OTHER_BUCKET`] is folded into
/// the bucket too, so the result never carries two of them.
pub fn top_n(distribution: Vec<CategoryCount>, n: usize) -> Vec<CategoryCount> {
    let (named_other, mut named): (Vec<_>, Vec<_>) = distribution
        .into_iter()
        .partition(|c| c.category == OTHER_BUCKET);

    let mut rest: u64 = named_other.iter().map(|c| c.count).sum();
    let overflow = named.len() > n;
    if overflow {
        rest += named.drain(n..).map(|c| c.count).sum::<u64>();
    }

    if overflow || !named_other.is_empty() {
        named.push(CategoryCount::new(OTHER_BUCKET, rest));
    }
    named
}

/// Truncate a cell to its calendar day.
pub fn to_day(cell: &Scalar) -> Option<NaiveDate> {
    match cell {
        Scalar::Date(d) => Some(*d),
        Scalar::Timestamp(ts) => Some(ts.date_naive()),
        Scalar::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.date_naive())
            }),
        _ => None,
    }
}

/// `day`/`count` rows as a daily series with running totals.
///
/// Rows must arrive in ascending order. Consecutive rows on the same day are
/// merged; a row earlier than its predecessor is an error. Gaps are left as is.
pub fn time_series(
    metric: QueryName,
    result: &RawQueryResult,
) -> Result<Vec<DailyCount>, MetricsError> {
    let mut series: Vec<DailyCount> = Vec::with_capacity(result.len());
    let mut cumulative = 0u64;

    for row in &result.rows {
        let cell = row.get("day").unwrap_or(&Scalar::Null);
        let date = to_day(cell).ok_or_else(|| failed(metric, format!("invalid day {:?}", cell)))?;
        let count = row
            .get("count")
            .ok_or_else(|| failed(metric, "row without a count column"))
            .and_then(|cell| cell_to_count(metric, cell))?;
        cumulative += count;

        match series.last_mut() {
            Some(last) if last.date == date => {
                last.count += count;
                last.cumulative = cumulative;
            }
            Some(last) if last.date > date => {
                return Err(failed(
                    metric,
                    format!("rows out of order: {} after {}", date, last.date),
                ));
            }
            _ => series.push(DailyCount {
                date,
                count,
                cumulative,
            }),
        }
    }

    Ok(series)
}

/// Group `parent`/`child` rows into capped relationship entries.
///
/// When the row carries a `total` column it is taken as the true child count,
/// since the query itself may cut rows off. Entries are ordered by count,
/// largest first, then by parent name.
pub fn relationships(
    metric: QueryName,
    result: &RawQueryResult,
    cap: usize,
) -> Result<Vec<Relationship>, MetricsError> {
    let mut entries: Vec<Relationship> = Vec::new();
    let mut seen: Vec<u64> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in &result.rows {
        let (Some(parent), Some(child)) = (
            row.get("parent").and_then(Scalar::as_text),
            row.get("child").and_then(Scalar::as_text),
        ) else {
            continue;
        };
        let total = match row.get("total") {
            Some(cell) => cell_to_count(metric, cell)?,
            None => 0,
        };

        let slot = match index.get(&parent) {
            Some(slot) => *slot,
            None => {
                index.insert(parent.clone(), entries.len());
                entries.push(Relationship {
                    parent,
                    children: Vec::new(),
                    count: 0,
                });
                seen.push(0);
                entries.len() - 1
            }
        };

        seen[slot] += 1;
        let entry = &mut entries[slot];
        if entry.children.len() < cap {
            entry.children.push(child);
        }
        entry.count = entry.count.max(seen[slot]).max(total);
    }

    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.parent.cmp(&b.parent)));
    Ok(entries)
}

/// Per-measurement dataset counts from the single-row measurement query.
pub fn measurement_counts(result: &RawQueryResult) -> Result<MeasurementCounts, MetricsError> {
    let metric = QueryName::MeasurementCounts;
    Ok(MeasurementCounts {
        spin_runs: scalar_count(metric, result, "spin_runs")?,
        sample_wells: scalar_count(metric, result, "sample_wells")?,
        uvvis_datasets: scalar_count(metric, result, "uvvis_datasets")?,
    })
}

/// The newest sample-well record, if any.
pub fn latest_sample_well(result: &RawQueryResult) -> Option<SampleWellSnapshot> {
    let row = result.rows.first()?;
    let text = |column: &str| {
        row.get(column)
            .and_then(Scalar::as_text)
            .unwrap_or_default()
    };

    Some(SampleWellSnapshot {
        sample_id: text("sample_id"),
        sample_name: text("sample_name"),
        dataset_id: text("dataset_id"),
        dataset_name: text("dataset_name"),
        date_created: text("date_created"),
        is_today: text("is_today").eq_ignore_ascii_case("true"),
    })
}
