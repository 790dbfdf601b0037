//! Command-line interface parsing for jqcache
//!
//! This module handles parsing of CLI arguments using clap and turns them
//! into the runtime configuration for one fetch: which resource to get,
//! where the snapshot cache lives, and how the freshness threshold is
//! interpreted.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::Parser;
use directories::ProjectDirs;
use thiserror::Error;

use crate::api::ClientConfig;

/// Accepted layouts for the --since argument
const SINCE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// The --since value did not parse as a date or datetime
    #[error("invalid --since value '{0}': expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS")]
    InvalidSince(String),

    /// No cache directory could be determined
    #[error("no cache directory: pass --cache-dir or set a home directory")]
    NoCacheDir,
}

/// jqcache - Fetch J-Quants API data through a local snapshot cache
#[derive(Parser, Debug)]
#[command(name = "jqcache")]
#[command(about = "Fetch J-Quants API data through a local snapshot cache")]
#[command(version)]
pub struct Cli {
    /// Resource path to fetch, e.g. /listed/info (must begin with '/')
    pub resource_path: String,

    /// Serve snapshots captured at or after this instant
    ///
    /// Accepts `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`. Defaults to the start
    /// of today, so each resource is fetched live at most once per day.
    #[arg(long, value_name = "DATETIME")]
    pub since: Option<String>,

    /// Directory the snapshot cache lives in (defaults to the XDG cache dir)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Refresh token (falls back to the JQUANTS_REFRESH_TOKEN environment variable)
    #[arg(long, value_name = "TOKEN")]
    pub refresh_token: Option<String>,

    /// Base URL of the API
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Maximum transient-failure retries per request
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub retries: u32,

    /// Print the data part as rows, one JSON object per line
    #[arg(long)]
    pub records: bool,

    /// Pretty-print the JSON output
    #[arg(long)]
    pub pretty: bool,
}

/// Configuration derived from CLI arguments for a single run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Resource path to fetch
    pub resource_path: String,
    /// Freshness threshold for the snapshot cache
    pub base_datetime: NaiveDateTime,
    /// Snapshot cache root
    pub cache_dir: PathBuf,
    /// Explicit refresh token, if given on the command line
    pub refresh_token: Option<String>,
    /// API client configuration
    pub client: ClientConfig,
    /// Whether to print rows instead of the raw data part
    pub records: bool,
    /// Whether to pretty-print
    pub pretty: bool,
}

/// Parses a --since argument into the freshness threshold
///
/// A bare date means midnight at the start of that date.
pub fn parse_since(s: &str) -> Result<NaiveDateTime, CliError> {
    for format in SINCE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight);
        }
    }
    Err(CliError::InvalidSince(s.to_string()))
}

/// Midnight at the start of today, local time
fn start_of_today() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.date().and_hms_opt(0, 0, 0).unwrap_or(now)
}

/// Default XDG-compliant cache directory
///
/// `~/.cache/jqcache/` on Linux, or the platform equivalent. `None` when no
/// home directory can be determined.
fn default_cache_dir() -> Option<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "jqcache")?;
    Some(project_dirs.cache_dir().to_path_buf())
}

impl RunConfig {
    /// Creates a RunConfig from parsed CLI arguments
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let base_datetime = match &cli.since {
            Some(s) => parse_since(s)?,
            None => start_of_today(),
        };

        let cache_dir = cli
            .cache_dir
            .clone()
            .or_else(default_cache_dir)
            .ok_or(CliError::NoCacheDir)?;

        let mut client = ClientConfig::default();
        if let Some(url) = &cli.base_url {
            client.base_url = url.clone();
        }
        client.timeout = Duration::from_secs(cli.timeout);
        client.retry_count = cli.retries;

        Ok(Self {
            resource_path: cli.resource_path.clone(),
            base_datetime,
            cache_dir,
            refresh_token: cli.refresh_token.clone(),
            client,
            records: cli.records,
            pretty: cli.pretty,
        })
    }
}
