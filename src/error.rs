//! Error types surfaced by the metrics engine.

use thiserror::Error;

/// Errors raised while scanning, enriching or aggregating pull requests.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The GitHub API rejected a request or could not be reached.
    #[error("GitHub API request failed: {0}")]
    GitHub(#[from] octocrab::Error),

    /// A non-octocrab source reported a failure.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// A date flag or parameter was not in `yyyy-mm-dd` form.
    #[error("invalid date {value:?}, expected format yyyy-mm-dd")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// The window start is later than its end.
    #[error("start date {start} is after end date {end}")]
    InvertedWindow { start: String, end: String },

    /// The sprint definitions payload could not be decoded.
    #[error("invalid sprint definitions: {0}")]
    InvalidSprints(#[from] serde_json::Error),

    /// A tag, branch or commit reference cannot be used in a compare route.
    #[error("invalid git reference {0:?}")]
    InvalidReference(String),

    /// A release tag pattern failed to compile.
    #[error("invalid release tag pattern: {0}")]
    InvalidTagPattern(#[from] regex::Error),

    /// Resolving one pull request's details failed.
    #[error("failed to enrich pull request #{number}: {source}")]
    Enrichment {
        number: u64,
        #[source]
        source: Box<MetricsError>,
    },
}

impl MetricsError {
    /// Whether the error was caused by caller input rather than upstream.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidDate { .. }
                | Self::InvertedWindow { .. }
                | Self::InvalidSprints(_)
                | Self::InvalidTagPattern(_)
                | Self::InvalidReference(_)
        )
    }

    /// Returns the innermost cause, unwrapping enrichment failures.
    pub fn root(&self) -> &MetricsError {
        match self {
            Self::Enrichment { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, MetricsError>;
