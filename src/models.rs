//! Data models for the dashboard API.
//!
//! This module contains the response document served at `/api/data` and
//! the pieces it is assembled from.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Name of the bucket that absorbs categories beyond the top N.
pub const OTHER_BUCKET: &str = "other";

/// Label used when the warehouse reports a NULL category.
pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// One category and how many records fall into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    #[serde(rename = "type")]
    pub category: String,
    pub count: u64,
}

impl CategoryCount {
    pub fn new(category: impl Into<String>, count: u64) -> Self {
        Self {
            category: category.into(),
            count,
        }
    }
}

/// Records created on a single day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    /// Day, serialized as `YYYY-MM-DD`.
    pub date: NaiveDate,
    /// Records created that day.
    pub count: u64,
    /// Records created up to and including that day.
    pub cumulative: u64,
}

/// A precursor solution and the thin films made from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub parent: String,
    /// At most the configured fan-out cap of child names.
    pub children: Vec<String>,
    /// True number of children, regardless of the cap.
    pub count: u64,
}

/// Dataset counts by measurement kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementCounts {
    pub spin_runs: u64,
    pub sample_wells: u64,
    pub uvvis_datasets: u64,
}

/// The most recently created sample with an uploaded sample-well image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWellSnapshot {
    pub sample_id: String,
    pub sample_name: String,
    pub dataset_id: String,
    pub dataset_name: String,
    pub date_created: String,
    pub is_today: bool,
}

/// Everything `/api/data` returns.
///
/// Built once per request and serialized immediately. Holds no timestamps,
/// so two builds over unchanged warehouse data compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub thin_films_count: u64,
    pub uvvis_spectra_count: u64,
    pub datasets_count: u64,
    pub sample_types_count: u64,
    pub measurement_counts: MeasurementCounts,
    pub sample_type_distribution: Vec<CategoryCount>,
    pub dataset_type_distribution: Vec<CategoryCount>,
    pub samples_over_time: Vec<DailyCount>,
    pub thin_film_precursor_relationships: Vec<Relationship>,
    pub latest_sample_well: Option<SampleWellSnapshot>,
}

impl MetricsDocument {
    /// Sum of a distribution's counts.
    pub fn distribution_total(distribution: &[CategoryCount]) -> u64 {
        distribution.iter().map(|c| c.count).sum()
    }
}
