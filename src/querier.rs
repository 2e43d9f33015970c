//! Service layer for querying and caching pull request metrics.
//!
//! `MetricsQuerier` is the entry point shared by the HTTP handlers and the CLI.
//! It handles:
//! 1. Resolving per-request filters against the configured defaults.
//! 2. Scanning the newest-first pull request feed until it passes the window start.
//! 3. Enriching the pull requests created inside the window, at most once each.
//! 4. Folding the results into per-window or per-sprint reports.
//!
//! It also fronts the smaller lookups: release reports, commit lists between
//! tags, workflow billing and the user's repositories.
//!
//! Pull request metrics reports are cached in memory, keyed by the full query.

use crate::config::{AppConfig, EnrichmentPolicy, RepoId};
use crate::enrich::{enrich_all, latest_review_states, ReviewSummary};
use crate::error::{MetricsError, Result};
use crate::fetcher::pull_request_pages;
use crate::github::{
    Commit, GitHubClient, PullRequestQuery, PullRequestStatus, PullRequestSummary, Repository,
    RepositorySource, ReviewVerdict,
};
use crate::metrics::{Aggregator, PullRequestMetrics};
use crate::release::{
    bucket_releases, build_report, commits_between, scan_releases, ReleaseReports, TagFilter,
};
use crate::sprint::{
    bucket_pull_requests, fetch_range, sprint_metrics as aggregate_sprint, valid_sprints,
    SprintReport, SprintWindow,
};
use crate::window::DateWindow;
use crate::workflows::{run_billing, workflow_billing, WorkflowBilling};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use moka::future::Cache;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Pull request filters shared by every query. Unset fields use the configured defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PullRequestFilter {
    pub base: Option<String>,
    pub state: Option<String>,
    pub page_size: Option<u8>,
}

/// Metrics of pull requests created within one window.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricsQuery {
    pub repo: RepoId,
    pub window: DateWindow,
    pub filter: PullRequestFilter,
    pub policy: Option<EnrichmentPolicy>,
}

/// Metrics and release reports of every sprint with both dates set.
#[derive(Clone, Debug, PartialEq)]
pub struct SprintQuery {
    pub repo: RepoId,
    pub sprints: Vec<SprintWindow>,
    pub filter: PullRequestFilter,
    pub tag_filter: TagFilter,
    pub policy: Option<EnrichmentPolicy>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseQuery {
    pub repo: RepoId,
    pub window: DateWindow,
    pub tag_filter: TagFilter,
}

/// One page of the pull request list.
#[derive(Clone, Debug, PartialEq)]
pub struct ListQuery {
    pub repo: RepoId,
    pub filter: PullRequestFilter,
    pub page: u32,
}

/// Commits between two tags or commits.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitListQuery {
    pub repo: RepoId,
    pub base: String,
    /// `HEAD` when unset.
    pub head: Option<String>,
}

/// Billing of the workflow runs created in a window.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowRunsQuery {
    pub repo: RepoId,
    pub window: DateWindow,
    pub page_size: Option<u8>,
}

/// One page of the authenticated user's repositories.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RepositoriesQuery {
    pub page_size: Option<u8>,
    pub page: u32,
}

/// A listed pull request with the latest verdict of each reviewer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PullRequestListing {
    pub number: u64,
    pub title: String,
    pub creator: String,
    pub status: PullRequestStatus,
    pub created_at: DateTime<Utc>,
    pub labels: Vec<String>,
    pub review_states: BTreeMap<String, ReviewVerdict>,
    pub reviews: ReviewSummary,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MetricsKey {
    query: PullRequestQuery,
    window: DateWindow,
    policy: EnrichmentPolicy,
}

#[derive(Clone)]
pub struct MetricsQuerier {
    source: Arc<dyn RepositorySource>,
    cache: Cache<MetricsKey, PullRequestMetrics>,
    config: AppConfig,
}

impl MetricsQuerier {
    /// Initializes a querier backed by the GitHub API.
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let client = GitHubClient::new(config.github_token.clone(), config.github_api_url.as_deref())?;
        Ok(Self::with_source(config, Arc::new(client)))
    }

    /// Initializes a querier over any pull request and release source.
    pub fn with_source(config: &AppConfig, source: Arc<dyn RepositorySource>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_max_capacity)
            .time_to_live(config.cache_ttl())
            .build();

        Self {
            source,
            cache,
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Retrieves the metrics of a window, computing them if not cached (read-through).
    pub async fn pull_request_metrics(&self, query: &MetricsQuery) -> Result<PullRequestMetrics> {
        let key = MetricsKey {
            query: self.resolve(&query.repo, &query.filter),
            window: query.window,
            policy: query.policy.unwrap_or(self.config.enrichment_policy),
        };

        if let Some(metrics) = self.cache.get(&key).await {
            tracing::debug!(repo = %query.repo, "Returning cached metrics");
            return Ok(metrics);
        }

        let metrics = self.compute_pull_request_metrics(&key).await?;
        self.cache.insert(key, metrics.clone()).await;

        Ok(metrics)
    }

    async fn compute_pull_request_metrics(&self, key: &MetricsKey) -> Result<PullRequestMetrics> {
        let scanned = self.scan_pull_requests(&key.query, key.window.start).await?;
        let scanned_count = scanned.len();

        // Only pull requests created in the window take part, so that the
        // merged flow does not depend on where the last page boundary fell.
        let created: Vec<_> = scanned
            .into_iter()
            .filter(|pr| key.window.contains(pr.created_at))
            .collect();
        let outcome = enrich_all(
            &*self.source,
            &key.query.owner,
            &key.query.repo,
            &created,
            self.config.enrichment_concurrency,
            key.policy,
            Utc::now(),
        )
        .await?;

        let mut aggregator = Aggregator::new(key.window);
        for pr in &created {
            aggregator.record(pr, outcome.details.get(&pr.number));
        }
        let metrics = aggregator.finish(outcome.failures);

        tracing::info!(
            owner = %key.query.owner,
            repo = %key.query.repo,
            scanned = scanned_count,
            count = metrics.count,
            failures = metrics.failures.len(),
            "Calculated pull request metrics"
        );
        Ok(metrics)
    }

    /// Builds one report per sprint from a single scan covering all of them.
    ///
    /// Pull requests shared by overlapping sprints are enriched once and counted in each.
    pub async fn sprint_metrics(&self, query: &SprintQuery) -> Result<Vec<SprintReport>> {
        let sprints = valid_sprints(query.sprints.clone())?;
        let matcher = query.tag_filter.compile()?;
        let Some(range) = fetch_range(&sprints) else {
            tracing::warn!(repo = %query.repo, "No sprint has both a start and an end date");
            return Ok(Vec::new());
        };

        let pr_query = self.resolve(&query.repo, &query.filter);
        let buckets = bucket_pull_requests(self.scan_pull_requests(&pr_query, range.start).await?);

        let candidates = buckets
            .items()
            .filter(|pr| sprints.iter().any(|s| s.window.contains(pr.created_at)));
        let outcome = enrich_all(
            &*self.source,
            &pr_query.owner,
            &pr_query.repo,
            candidates,
            self.config.enrichment_concurrency,
            query.policy.unwrap_or(self.config.enrichment_policy),
            Utc::now(),
        )
        .await?;

        let releases = scan_releases(
            &*self.source,
            &query.repo.owner,
            &query.repo.repo,
            self.config.release_page_size,
            &range,
        )
        .await?;
        let release_buckets = bucket_releases(releases, &range);

        Ok(sprints
            .into_iter()
            .map(|sprint| {
                tracing::info!(number = sprint.definition.number, name = %sprint.definition.name, "Preparing sprint report");
                let metrics = aggregate_sprint(&sprint, &buckets, &outcome);
                let releases = build_report(&sprint.window, release_buckets.collect(&sprint.window), &matcher);
                SprintReport {
                    sprint: sprint.definition,
                    metrics,
                    releases,
                }
            })
            .collect())
    }

    pub async fn release_report(&self, query: &ReleaseQuery) -> Result<ReleaseReports> {
        let matcher = query.tag_filter.compile()?;
        let releases = scan_releases(
            &*self.source,
            &query.repo.owner,
            &query.repo.repo,
            self.config.release_page_size,
            &query.window,
        )
        .await?;

        Ok(build_report(&query.window, &releases, &matcher))
    }

    /// Lists one page of pull requests with each one's review states.
    pub async fn pull_requests(&self, query: &ListQuery) -> Result<Vec<PullRequestListing>> {
        let pr_query = self.resolve(&query.repo, &query.filter);
        let prs = self
            .source
            .pull_requests_page(&pr_query, query.page.max(1))
            .await?;

        let owner = pr_query.owner.as_str();
        let repo = pr_query.repo.as_str();
        stream::iter(&prs)
            .map(|pr| async move {
                let reviews = self.source.reviews(owner, repo, pr.number).await?;
                let review_states = latest_review_states(&pr.reviewers, &reviews);
                Ok::<_, MetricsError>(PullRequestListing {
                    number: pr.number,
                    title: pr.title.clone(),
                    creator: pr.creator.username.clone(),
                    status: pr.status(),
                    created_at: pr.created_at,
                    labels: pr.labels.iter().map(|l| l.name.clone()).collect(),
                    reviews: ReviewSummary::from_states(&review_states),
                    review_states,
                })
            })
            .buffered(self.config.enrichment_concurrency.max(1))
            .boxed()
            .try_collect()
            .await
    }

    pub async fn commit_list(&self, query: &CommitListQuery) -> Result<Vec<Commit>> {
        commits_between(
            &*self.source,
            &query.repo.owner,
            &query.repo.repo,
            &query.base,
            query.head.as_deref(),
        )
        .await
    }

    /// Billable minutes and cost of the runs created in the window, per workflow.
    pub async fn workflow_run_billing(&self, query: &WorkflowRunsQuery) -> Result<Vec<WorkflowBilling>> {
        run_billing(
            &*self.source,
            &query.repo.owner,
            &query.repo.repo,
            &query.window,
            query.page_size.unwrap_or(self.config.workflow_page_size).max(1),
            self.config.enrichment_concurrency,
            &self.config.billing_rates(),
        )
        .await
    }

    /// Billable minutes and cost of each workflow in the current billing cycle.
    pub async fn workflow_billing(&self, repo: &RepoId) -> Result<Vec<WorkflowBilling>> {
        workflow_billing(
            &*self.source,
            &repo.owner,
            &repo.repo,
            self.config.workflow_page_size.max(1),
            self.config.enrichment_concurrency,
            &self.config.billing_rates(),
        )
        .await
    }

    pub async fn user_repositories(&self, query: &RepositoriesQuery) -> Result<Vec<Repository>> {
        let page_size = query.page_size.unwrap_or(self.config.page_size).max(1);
        let repositories = self
            .source
            .user_repositories(page_size, query.page.max(1))
            .await?;
        tracing::debug!(page = query.page, repositories = repositories.len(), "Fetched user repositories");
        Ok(repositories)
    }

    /// Fetches pages until one holds a pull request created before `start`.
    ///
    /// A pull request seen on more than one page is kept once.
    async fn scan_pull_requests(
        &self,
        query: &PullRequestQuery,
        start: DateTime<Utc>,
    ) -> Result<Vec<PullRequestSummary>> {
        let mut pages = std::pin::pin!(pull_request_pages(&*self.source, query));
        let mut seen = HashSet::new();
        let mut scanned = Vec::new();
        let mut page_number = 0u32;

        while let Some(page) = pages.try_next().await? {
            page_number += 1;
            tracing::debug!(page = page_number, items = page.len(), "Fetched pull requests page");

            let passed_start = page.iter().any(|pr| pr.created_at < start);
            scanned.extend(page.into_iter().filter(|pr| seen.insert(pr.number)));
            if passed_start {
                break;
            }
        }

        Ok(scanned)
    }

    fn resolve(&self, repo: &RepoId, filter: &PullRequestFilter) -> PullRequestQuery {
        PullRequestQuery {
            owner: repo.owner.clone(),
            repo: repo.repo.clone(),
            base: filter
                .base
                .clone()
                .or_else(|| self.config.base_branch.clone())
                .filter(|b| !b.trim().is_empty()),
            state: self.config.validate_state_or_default(filter.state.as_deref()),
            page_size: filter.page_size.unwrap_or(self.config.page_size).max(1),
        }
    }
}
