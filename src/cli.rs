//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// PerovDash - live dashboard for the 10k perovskites sample collection
///
/// Serves KPI cards and charts backed by BigQuery aggregate queries.
/// The browser page refreshes itself from `/api/data` on a timer.
///
/// Examples:
///   perovdash
///   perovdash --bind 127.0.0.1:8080 --access-token "$(gcloud auth print-access-token)"
///   perovdash --config ./dashboard.toml --verbose
///   perovdash --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .perovdash.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0:5000)
    #[arg(short, long, value_name = "ADDR", env = "PEROVDASH_BIND")]
    pub bind: Option<String>,

    /// Seconds between dashboard refreshes in the browser
    #[arg(long, value_name = "SECS")]
    pub refresh_interval: Option<u64>,

    /// Google Cloud project billed for warehouse queries
    #[arg(short, long, value_name = "PROJECT", env = "PEROVDASH_PROJECT")]
    pub project: Option<String>,

    /// OAuth access token for BigQuery
    ///
    /// When no token and no credentials file is configured, the GCE
    /// metadata server is asked for one.
    #[arg(long, value_name = "TOKEN", env = "PEROVDASH_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Service-account JSON key used to authenticate with BigQuery
    #[arg(long, value_name = "FILE", env = "GOOGLE_APPLICATION_CREDENTIALS")]
    pub credentials_file: Option<PathBuf>,

    /// Warehouse query timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Named dataset types shown before the rest is grouped as "other"
    #[arg(long, value_name = "COUNT")]
    pub top_n: Option<usize>,

    /// Maximum thin films listed per precursor solution
    #[arg(long, value_name = "COUNT")]
    pub fanout_cap: Option<usize>,

    /// Require ORCID login for the dashboard page
    #[arg(long)]
    pub auth: bool,

    /// ORCID OAuth client id
    #[arg(long, value_name = "ID", env = "ORCID_CLIENT_ID")]
    pub orcid_client_id: Option<String>,

    /// ORCID OAuth client secret
    #[arg(long, value_name = "SECRET", env = "ORCID_CLIENT_SECRET", hide_env_values = true)]
    pub orcid_client_secret: Option<String>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .perovdash.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref bind) = self.bind {
            if bind.parse::<std::net::SocketAddr>().is_err() {
                return Err(format!("Invalid bind address: {}", bind));
            }
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        if self.refresh_interval == Some(0) {
            return Err("Refresh interval must be at least 1 second".to_string());
        }

        if self.top_n == Some(0) {
            return Err("Top-N must be at least 1".to_string());
        }

        if self.fanout_cap == Some(0) {
            return Err("Fan-out cap must be at least 1".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            config: None,
            bind: None,
            refresh_interval: None,
            project: None,
            access_token: None,
            credentials_file: None,
            timeout: None,
            top_n: None,
            fanout_cap: None,
            auth: false,
            orcid_client_id: None,
            orcid_client_secret: None,
            verbose: false,
            quiet: false,
            init_config: false,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(make_args().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_bind() {
        let mut args = make_args();
        args.bind = Some("localhost".to_string());
        assert!(args.validate().is_err());

        args.bind = Some("127.0.0.1:5000".to_string());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_values() {
        let mut args = make_args();
        args.timeout = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.top_n = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.fanout_cap = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_credentials_file_merges_into_config() {
        let mut args = make_args();
        args.credentials_file = Some(PathBuf::from("key.json"));

        let mut config = crate::config::Config::default();
        config.merge_with_args(&args);
        assert_eq!(
            config.warehouse.credentials_file,
            Some(PathBuf::from("key.json"))
        );
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_cli_overrides_config() {
        let mut args = make_args();
        args.top_n = Some(4);
        args.auth = true;
        args.access_token = Some("tok".to_string());

        let mut config = crate::config::Config::default();
        config.merge_with_args(&args);

        assert_eq!(config.metrics.dataset_types_top_n, 4);
        assert!(config.auth.enabled);
        assert_eq!(config.warehouse.access_token.as_deref(), Some("tok"));
        assert!(config.warehouse.credentials_file.is_none());
        assert_eq!(config.metrics.relationship_fanout_cap, 10);
    }
}
