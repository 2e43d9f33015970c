//! Enrichment of list-view pull requests with detail-view data.
//!
//! Each qualifying pull request costs up to three extra calls: its details, its
//! first commit and (once merged) its merge commit. These are resolved through a
//! bounded stream so several pull requests are in flight at once.

use crate::config::EnrichmentPolicy;
use crate::error::{MetricsError, Result};
use crate::github::{PullRequestSource, PullRequestSummary, ReviewEvent, ReviewVerdict, User};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-pull-request metrics resolved from the detail endpoints.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricDetail {
    pub number: u64,
    pub title: String,
    /// Merge time minus creation time, zero when not merged.
    #[serde(with = "duration_secs")]
    pub lead_time: Duration,
    /// Merge commit time minus first commit time; time elapsed since the
    /// first commit while still unmerged.
    #[serde(with = "duration_secs")]
    pub time_to_merge: Duration,
    pub created_at: DateTime<Utc>,

    pub comments: u64,
    pub review_comments: u64,
    pub commits: u64,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
}

/// A pull request that could not be enriched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EnrichmentFailure {
    pub number: u64,
    pub reason: String,
}

/// Enriched details plus, under `SkipFailed`, the pull requests left out.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EnrichmentOutcome {
    pub details: BTreeMap<u64, MetricDetail>,
    pub failures: Vec<EnrichmentFailure>,
}

pub fn lead_time(summary: &PullRequestSummary) -> Duration {
    summary
        .merged_at
        .map(|merged_at| merged_at - summary.created_at)
        .unwrap_or_else(Duration::zero)
}

/// Resolves one pull request into its `MetricDetail`.
///
/// `now` anchors the elapsed time of pull requests that have not been merged.
pub async fn resolve_metric_detail<S>(
    source: &S,
    owner: &str,
    repo: &str,
    summary: &PullRequestSummary,
    now: DateTime<Utc>,
) -> Result<MetricDetail>
where
    S: PullRequestSource + ?Sized,
{
    let lead_time = lead_time(summary);

    let details = source
        .pull_request_details(owner, repo, summary.number)
        .await?;

    let first_commits = source
        .pull_request_commits(owner, repo, summary.number, 1, 1)
        .await?;
    let first_commit_at = first_commits.first().map(|commit| commit.committed_at());

    let mut time_to_merge = match first_commit_at {
        Some(at) => now - at,
        None => {
            tracing::warn!(number = summary.number, "Pull request has no commits");
            Duration::zero()
        }
    };

    if let Some(sha) = details.merge_commit() {
        let merge_commit = source.commit_details(owner, repo, sha).await?;
        if let Some(first) = first_commit_at {
            time_to_merge = merge_commit.committed_at() - first;
        }
    }

    Ok(MetricDetail {
        number: summary.number,
        title: summary.title.clone(),
        lead_time,
        time_to_merge,
        created_at: details.created_at,
        comments: details.comments,
        review_comments: details.review_comments,
        commits: details.commits,
        additions: details.additions,
        deletions: details.deletions,
        changed_files: details.changed_files,
    })
}

/// Enriches every pull request in `summaries` with at most `concurrency` in flight.
///
/// Under `FailFast` the first failure aborts the remaining work and is returned.
pub async fn enrich_all<'a, S, I>(
    source: &S,
    owner: &str,
    repo: &str,
    summaries: I,
    concurrency: usize,
    policy: EnrichmentPolicy,
    now: DateTime<Utc>,
) -> Result<EnrichmentOutcome>
where
    S: PullRequestSource + ?Sized,
    I: IntoIterator<Item = &'a PullRequestSummary>,
    I::IntoIter: Send,
{
    let mut results = stream::iter(summaries)
        .map(|summary| async move {
            let result = resolve_metric_detail(source, owner, repo, summary, now).await;
            (summary.number, result)
        })
        .buffer_unordered(concurrency.max(1))
        .boxed();

    let mut outcome = EnrichmentOutcome::default();
    while let Some((number, result)) = results.next().await {
        match result {
            Ok(detail) => {
                outcome.details.insert(number, detail);
            }
            Err(e) => match policy {
                EnrichmentPolicy::FailFast => {
                    return Err(MetricsError::Enrichment {
                        number,
                        source: Box::new(e),
                    });
                }
                EnrichmentPolicy::SkipFailed => {
                    tracing::warn!(number, error = %e, "Skipping pull request that failed enrichment");
                    outcome.failures.push(EnrichmentFailure {
                        number,
                        reason: e.to_string(),
                    });
                }
            },
        }
    }

    outcome.failures.sort_by_key(|failure| failure.number);
    Ok(outcome)
}

/// Latest review verdict per user.
///
/// Every requested reviewer starts as `Pending`; reviews are then applied in
/// submission order so the most recent one wins.
pub fn latest_review_states(
    reviewers: &[User],
    reviews: &[ReviewEvent],
) -> BTreeMap<String, ReviewVerdict> {
    let mut states: BTreeMap<String, ReviewVerdict> = reviewers
        .iter()
        .map(|reviewer| (reviewer.username.clone(), ReviewVerdict::Pending))
        .collect();

    let mut ordered: Vec<&ReviewEvent> = reviews.iter().collect();
    ordered.sort_by_key(|review| review.submitted_at);

    for review in ordered {
        states.insert(review.user.username.clone(), review.state);
    }

    states
}

/// Counts of the verdicts in a review-state map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReviewSummary {
    pub approved: usize,
    pub pending: usize,
    pub changes_requested: usize,
    pub total: usize,
}

impl ReviewSummary {
    pub fn from_states(states: &BTreeMap<String, ReviewVerdict>) -> Self {
        states.values().fold(Self::default(), |mut acc, verdict| {
            if verdict.is_changes_requested() {
                acc.changes_requested += 1;
            } else if *verdict == ReviewVerdict::Approved {
                acc.approved += 1;
            } else {
                acc.pending += 1;
            }
            acc.total += 1;
            acc
        })
    }
}

/// Serializes `chrono::Duration` as whole seconds.
pub(crate) mod duration_secs {
    use chrono::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }
}
