//! Application configuration and environment variable parsing.
//!
//! Settings are read from the environment (optionally seeded from a `.env` file).
//! `AppConfig` holds the GitHub credentials, the default pull request filters,
//! page sizes for the upstream scans, enrichment fan-out settings, Actions
//! billing rates and the HTTP server/cache settings. Command-line flags
//! override these per invocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// Pull request state filters accepted by the upstream list endpoint.
pub const ALLOWED_PULL_REQUEST_STATES: [&str; 3] = ["open", "closed", "all"];

/// A unique identifier for a GitHub repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    /// The owner of the repository (e.g., "facebook").
    pub owner: String,
    /// The name of the repository (e.g., "react").
    pub repo: String,
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// What to do when resolving one pull request's details fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentPolicy {
    /// Abort the whole report on the first failure.
    #[default]
    FailFast,
    /// Leave the failed pull request out of the totals and list it in the report.
    SkipFailed,
}

impl FromStr for EnrichmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fail_fast" => Ok(Self::FailFast),
            "skip_failed" => Ok(Self::SkipFailed),
            other => Err(format!("unknown enrichment policy '{other}'")),
        }
    }
}

/// Price per billable Actions minute on each runner operating system.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BillingRates {
    pub linux: f64,
    pub macos: f64,
    pub windows: f64,
}

/// Application configuration loaded from environment variables.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    /// Optional GitHub Personal Access Token.
    #[serde(default, skip_serializing)]
    pub github_token: Option<String>,

    /// Base URI of the GitHub API, for GitHub Enterprise installations.
    #[serde(default)]
    pub github_api_url: Option<String>,

    /// Base branch the pull requests are filtered by. Any branch when unset.
    #[serde(default)]
    pub base_branch: Option<String>,

    /// Default pull request state filter (`open`, `closed` or `all`).
    #[serde(default = "default_pull_request_state")]
    pub pull_request_state: String,

    /// Number of pull requests requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u8,

    /// Number of releases requested per page.
    #[serde(default = "default_release_page_size")]
    pub release_page_size: u8,

    /// Number of workflow runs or workflows requested per page.
    #[serde(default = "default_workflow_page_size")]
    pub workflow_page_size: u8,

    /// Price of a Linux runner minute.
    #[serde(default = "default_billing_linux_rate")]
    pub billing_linux_rate: f64,

    /// Price of a macOS runner minute.
    #[serde(default = "default_billing_macos_rate")]
    pub billing_macos_rate: f64,

    /// Price of a Windows runner minute.
    #[serde(default = "default_billing_windows_rate")]
    pub billing_windows_rate: f64,

    /// Maximum number of pull requests enriched concurrently.
    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,

    /// Behaviour when a single pull request cannot be enriched.
    #[serde(default)]
    pub enrichment_policy: EnrichmentPolicy,

    /// Time to live for cached metrics reports in seconds.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Maximum number of entries to keep in the metrics cache.
    #[serde(default = "default_cache_max_capacity")]
    pub cache_max_capacity: u64,

    /// Port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_pull_request_state() -> String {
    "all".to_string()
}

fn default_page_size() -> u8 {
    20
}

fn default_release_page_size() -> u8 {
    10
}

fn default_workflow_page_size() -> u8 {
    100
}

fn default_billing_linux_rate() -> f64 {
    0.008
}

fn default_billing_macos_rate() -> f64 {
    0.08
}

fn default_billing_windows_rate() -> f64 {
    0.016
}

fn default_enrichment_concurrency() -> usize {
    8
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_cache_max_capacity() -> u64 {
    100
}

fn default_port() -> u16 {
    3000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            github_api_url: None,
            base_branch: None,
            pull_request_state: default_pull_request_state(),
            page_size: default_page_size(),
            release_page_size: default_release_page_size(),
            workflow_page_size: default_workflow_page_size(),
            billing_linux_rate: default_billing_linux_rate(),
            billing_macos_rate: default_billing_macos_rate(),
            billing_windows_rate: default_billing_windows_rate(),
            enrichment_concurrency: default_enrichment_concurrency(),
            enrichment_policy: EnrichmentPolicy::default(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_max_capacity: default_cache_max_capacity(),
            port: default_port(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn cache_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.cache_ttl_seconds)
    }

    pub fn billing_rates(&self) -> BillingRates {
        BillingRates {
            linux: self.billing_linux_rate,
            macos: self.billing_macos_rate,
            windows: self.billing_windows_rate,
        }
    }

    /// Returns `state` when it is an allowed filter, otherwise the configured default.
    pub fn validate_state_or_default(&self, state: Option<&str>) -> String {
        match state.map(str::trim) {
            Some(s) if ALLOWED_PULL_REQUEST_STATES.contains(&s) => s.to_string(),
            Some(s) => {
                tracing::warn!(
                    state = s,
                    default = %self.pull_request_state,
                    "Unknown pull request state, using default"
                );
                self.pull_request_state.clone()
            }
            None => self.pull_request_state.clone(),
        }
    }
}
