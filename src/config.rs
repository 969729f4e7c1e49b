//! Configuration file handling.
//!
//! This module handles loading, validating and merging configuration from
//! `.perovdash.toml` files.

use crate::metrics::ShapeLimits;
use crate::warehouse::queries::{is_safe_identifier, CatalogParams};
use crate::warehouse::{BigQueryConfig, CredentialSource};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".perovdash.toml";

/// Longest accepted browser refresh interval.
pub const MAX_REFRESH_INTERVAL_SECONDS: u64 = 86_400;

/// Longest accepted warehouse timeout.
pub const MAX_TIMEOUT_SECONDS: u64 = 3_600;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Warehouse settings.
    #[serde(default)]
    pub warehouse: WarehouseConfig,

    /// Metrics shaping settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Login settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// How often the dashboard page re-fetches `/api/data`.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            refresh_interval_seconds: default_refresh_interval(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_refresh_interval() -> u64 {
    60
}

/// Warehouse connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// BigQuery REST API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Project billed for the queries.
    #[serde(default = "default_billing_project")]
    pub billing_project: String,

    /// Dataset holding the sample tables.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Sample collection the dashboard reports on.
    #[serde(default = "default_collection_project")]
    pub collection_project: String,

    /// Static OAuth access token. Takes precedence over every other source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Service-account JSON key file. When neither this nor a token is set,
    /// the metadata server is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,

    /// Metadata server token endpoint.
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,

    /// Per-request query timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Rows fetched per result page.
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            billing_project: default_billing_project(),
            table_prefix: default_table_prefix(),
            collection_project: default_collection_project(),
            access_token: None,
            credentials_file: None,
            metadata_url: default_metadata_url(),
            timeout_seconds: default_timeout(),
            max_results: default_max_results(),
        }
    }
}

fn default_api_url() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_billing_project() -> String {
    "mf-crucible".to_string()
}

fn default_table_prefix() -> String {
    "mf-crucible.crucible".to_string()
}

fn default_collection_project() -> String {
    "10k_perovskites".to_string()
}

fn default_metadata_url() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
        .to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_results() -> u32 {
    10_000
}

/// Bounds on the response document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Named dataset types before the rest is folded into "other".
    #[serde(default = "default_top_n")]
    pub dataset_types_top_n: usize,

    /// Children listed per precursor solution.
    #[serde(default = "default_fanout_cap")]
    pub relationship_fanout_cap: usize,

    /// Precursor link rows fetched from the warehouse.
    #[serde(default = "default_row_limit")]
    pub relationship_row_limit: usize,

    /// Spectra recorded per sample in a UV-Vis dataset.
    #[serde(default = "default_spectra_per_sample")]
    pub spectra_per_sample: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            dataset_types_top_n: default_top_n(),
            relationship_fanout_cap: default_fanout_cap(),
            relationship_row_limit: default_row_limit(),
            spectra_per_sample: default_spectra_per_sample(),
        }
    }
}

fn default_top_n() -> usize {
    10
}

fn default_fanout_cap() -> usize {
    10
}

fn default_row_limit() -> usize {
    500
}

fn default_spectra_per_sample() -> u64 {
    8
}

/// ORCID login settings. Disabled unless `enabled = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid_client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid_client_secret: Option<String>,

    /// ORCID authorization server.
    #[serde(default = "default_orcid_base_url")]
    pub orcid_base_url: String,

    /// Externally visible base URL, used to build the OAuth redirect.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Key for signing session cookies. A random key is used when unset,
    /// which logs everyone out on restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            orcid_client_id: None,
            orcid_client_secret: None,
            orcid_base_url: default_orcid_base_url(),
            public_url: default_public_url(),
            session_secret: None,
        }
    }
}

fn default_orcid_base_url() -> String {
    "https://orcid.org".to_string()
}

fn default_public_url() -> String {
    "http://localhost:5000".to_string()
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// Only explicitly provided values override.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref bind) = args.bind {
            self.server.bind = bind.clone();
        }
        if let Some(refresh) = args.refresh_interval {
            self.server.refresh_interval_seconds = refresh;
        }

        if let Some(ref project) = args.project {
            self.warehouse.billing_project = project.clone();
        }
        if let Some(ref token) = args.access_token {
            self.warehouse.access_token = Some(token.clone());
        }
        if let Some(ref path) = args.credentials_file {
            self.warehouse.credentials_file = Some(path.clone());
        }
        if let Some(timeout) = args.timeout {
            self.warehouse.timeout_seconds = timeout;
        }

        if let Some(top_n) = args.top_n {
            self.metrics.dataset_types_top_n = top_n;
        }
        if let Some(cap) = args.fanout_cap {
            self.metrics.relationship_fanout_cap = cap;
        }

        // Auth can be switched on from the command line, never off.
        if args.auth {
            self.auth.enabled = true;
        }
        if let Some(ref id) = args.orcid_client_id {
            self.auth.orcid_client_id = Some(id.clone());
        }
        if let Some(ref secret) = args.orcid_client_secret {
            self.auth.orcid_client_secret = Some(secret.clone());
        }
    }

    /// Check the merged configuration before anything is started.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_REFRESH_INTERVAL_SECONDS).contains(&self.server.refresh_interval_seconds) {
            bail!(
                "Refresh interval must be between 1 and {} seconds",
                MAX_REFRESH_INTERVAL_SECONDS
            );
        }
        if !is_http_url(&self.warehouse.api_url) {
            bail!("Warehouse API URL must start with 'http://' or 'https://'");
        }
        if !is_safe_identifier(&self.warehouse.billing_project) {
            bail!("Invalid billing project: {:?}", self.warehouse.billing_project);
        }
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&self.warehouse.timeout_seconds) {
            bail!("Query timeout must be between 1 and {} seconds", MAX_TIMEOUT_SECONDS);
        }
        if self.warehouse.max_results == 0 {
            bail!("Max results must be at least 1");
        }
        if self.metrics.dataset_types_top_n == 0 {
            bail!("Dataset type top-N must be at least 1");
        }
        if self.metrics.relationship_fanout_cap == 0 {
            bail!("Relationship fan-out cap must be at least 1");
        }

        if self.auth.enabled {
            if self.auth.orcid_client_id.is_none() || self.auth.orcid_client_secret.is_none() {
                bail!("Auth is enabled but the ORCID client id or secret is missing");
            }
            if !is_http_url(&self.auth.orcid_base_url) || !is_http_url(&self.auth.public_url) {
                bail!("ORCID and public URLs must start with 'http://' or 'https://'");
            }
        }

        Ok(())
    }

    /// Parameters for rendering the query catalogue.
    pub fn catalog_params(&self) -> CatalogParams {
        CatalogParams {
            table_prefix: self.warehouse.table_prefix.clone(),
            collection_project: self.warehouse.collection_project.clone(),
            relationship_row_limit: self.metrics.relationship_row_limit,
            spectra_per_sample: self.metrics.spectra_per_sample,
        }
    }

    /// Shaping limits for the aggregator.
    pub fn shape_limits(&self) -> ShapeLimits {
        ShapeLimits {
            dataset_types_top_n: self.metrics.dataset_types_top_n,
            relationship_fanout_cap: self.metrics.relationship_fanout_cap,
        }
    }

    /// Settings for the BigQuery client.
    pub fn bigquery(&self) -> BigQueryConfig {
        let credentials = match (&self.warehouse.access_token, &self.warehouse.credentials_file) {
            (Some(token), _) => CredentialSource::Static(token.clone()),
            (None, Some(path)) => CredentialSource::ServiceAccountFile(path.clone()),
            (None, None) => CredentialSource::MetadataServer {
                url: self.warehouse.metadata_url.clone(),
            },
        };

        BigQueryConfig {
            api_url: self.warehouse.api_url.trim_end_matches('/').to_string(),
            billing_project: self.warehouse.billing_project.clone(),
            credentials,
            timeout_seconds: self.warehouse.timeout_seconds,
            max_results: self.warehouse.max_results,
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
