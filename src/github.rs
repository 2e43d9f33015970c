//! GitHub data models and the octocrab-backed repository source.
//!
//! The reports only talk to the source traits (`PullRequestSource`,
//! `ReleaseSource`, `WorkflowSource`, `AccountSource`), so tests can substitute
//! in-memory fakes for the real client.

use crate::error::{MetricsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};

/// A GitHub account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: u64,
    #[serde(rename = "login")]
    pub username: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// Raw `state` field of a pull request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// Lifecycle status derived from the raw state and the merge timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestStatus {
    Open,
    Closed,
    Merged,
}

impl PullRequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }
}

/// A pull request as returned by the list or detail endpoint.
///
/// The list endpoint omits the size counters, so they default to zero until
/// the detail endpoint is consulted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PullRequestSummary {
    pub number: u64,
    pub title: String,
    #[serde(rename = "user")]
    pub creator: User,
    #[serde(rename = "requested_reviewers", default)]
    pub reviewers: Vec<User>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub state: IssueState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,

    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub review_comments: u64,
    #[serde(default)]
    pub commits: u64,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changed_files: u64,
}

impl PullRequestSummary {
    pub fn status(&self) -> PullRequestStatus {
        match (self.merged_at, self.state) {
            (Some(_), _) => PullRequestStatus::Merged,
            (None, IssueState::Open) => PullRequestStatus::Open,
            (None, IssueState::Closed) => PullRequestStatus::Closed,
        }
    }

    /// The merge commit, only when the pull request has actually been merged.
    ///
    /// GitHub also reports a test-merge sha for open pull requests; that one is ignored.
    pub fn merge_commit(&self) -> Option<&str> {
        self.merged_at?;
        self.merge_commit_sha.as_deref().filter(|sha| !sha.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDetails {
    #[serde(default)]
    pub message: String,
    pub committer: Committer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    #[serde(rename = "commit")]
    pub details: CommitDetails,
}

impl Commit {
    pub fn committed_at(&self) -> DateTime<Utc> {
        self.details.committer.date
    }
}

/// Verdict of a single review, as reported by GitHub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Approved,
    Pending,
    ChangesRequested,
    Commented,
    Dismissed,
    #[serde(other)]
    Unknown,
}

impl ReviewVerdict {
    /// Anything that is neither an approval nor still pending counts as changes requested.
    pub fn is_changes_requested(self) -> bool {
        !matches!(self, Self::Approved | Self::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEvent {
    #[serde(default)]
    pub id: u64,
    pub state: ReviewVerdict,
    pub user: User,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// A repository the authenticated user can access.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub ssh_url: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(rename = "stargazers_count", default)]
    pub stars: u64,
}

/// A GitHub Actions workflow definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
}

/// One execution of a workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub workflow_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentTiming {
    #[serde(default)]
    pub total_ms: u64,
}

/// Billable milliseconds per runner operating system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillableTiming {
    #[serde(rename = "UBUNTU", default)]
    pub ubuntu: EnvironmentTiming,
    #[serde(rename = "MACOS", default)]
    pub macos: EnvironmentTiming,
    #[serde(rename = "WINDOWS", default)]
    pub windows: EnvironmentTiming,
}

/// Billable time of a workflow run, or of a workflow over the current billing cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTiming {
    #[serde(default)]
    pub billable: BillableTiming,
}

#[derive(Deserialize)]
struct WorkflowRunsResponse {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct WorkflowsResponse {
    #[serde(default)]
    workflows: Vec<Workflow>,
}

#[derive(Deserialize)]
struct CommitComparison {
    #[serde(default)]
    commits: Vec<Commit>,
}

/// Filter for one page of the pull request list endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct PullRequestQuery {
    pub owner: String,
    pub repo: String,
    pub base: Option<String>,
    pub state: String,
    pub page_size: u8,
}

#[async_trait]
pub trait PullRequestSource: Send + Sync {
    /// One page of pull requests, newest first.
    async fn pull_requests_page(
        &self,
        query: &PullRequestQuery,
        page: u32,
    ) -> Result<Vec<PullRequestSummary>>;

    async fn pull_request_details(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestSummary>;

    async fn pull_request_commits(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<Commit>>;

    async fn commit_details(&self, owner: &str, repo: &str, sha: &str) -> Result<Commit>;

    async fn reviews(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<ReviewEvent>>;
}

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn releases_page(
        &self,
        owner: &str,
        repo: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<Release>>;

    /// Commits reachable from `head` but not from `base`, oldest first.
    async fn compare_commits(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
    ) -> Result<Vec<Commit>>;
}

#[async_trait]
pub trait WorkflowSource: Send + Sync {
    /// One page of workflow runs. `created` is a GitHub date range such as `2024-01-01..2024-01-31`.
    async fn workflow_runs_page(
        &self,
        owner: &str,
        repo: &str,
        created: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<WorkflowRun>>;

    async fn run_timing(&self, owner: &str, repo: &str, run_id: u64) -> Result<WorkflowTiming>;

    async fn workflows_page(
        &self,
        owner: &str,
        repo: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<Workflow>>;

    /// Billable time of a workflow during the current billing cycle.
    async fn workflow_usage(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
    ) -> Result<WorkflowTiming>;
}

/// Endpoints scoped to the authenticated user rather than a repository.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn user_repositories(&self, page_size: u8, page: u32) -> Result<Vec<Repository>>;
}

/// Every upstream endpoint the reports use.
pub trait RepositorySource: PullRequestSource + ReleaseSource + WorkflowSource + AccountSource {}

impl<T> RepositorySource for T where
    T: PullRequestSource + ReleaseSource + WorkflowSource + AccountSource
{
}

#[derive(Serialize)]
struct ListPullsParams<'a> {
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base: Option<&'a str>,
    sort: &'static str,
    direction: &'static str,
    per_page: u8,
    page: u32,
}

#[derive(Serialize)]
struct PageParams {
    per_page: u8,
    page: u32,
}

#[derive(Serialize)]
struct ListRunsParams<'a> {
    created: &'a str,
    per_page: u8,
    page: u32,
}

#[derive(Serialize)]
struct ListUserReposParams {
    sort: &'static str,
    per_page: u8,
    page: u32,
}

/// Checks that a tag, branch or sha can be placed in a compare route.
pub fn validate_reference(value: &str) -> Result<&str> {
    let value = value.trim();
    if value.is_empty() || value.contains("..") || value.contains(char::is_whitespace) {
        return Err(MetricsError::InvalidReference(value.to_string()));
    }
    Ok(value)
}

/// Octocrab-backed client for the GitHub REST API.
#[derive(Clone)]
pub struct GitHubClient {
    octocrab: Octocrab,
}

impl GitHubClient {
    pub fn new(token: Option<String>, api_url: Option<&str>) -> Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = token {
            builder = builder.personal_token(token);
        }
        if let Some(url) = api_url {
            builder = builder.base_uri(url)?;
        }

        Ok(Self {
            octocrab: builder.build()?,
        })
    }

    fn repo_route(owner: &str, repo: &str) -> String {
        // Sanitize inputs to prevent path traversal or unintended endpoint access
        let owner = owner.trim().replace("..", "");
        let repo = repo.trim().replace("..", "");
        format!("/repos/{owner}/{repo}")
    }
}

#[async_trait]
impl PullRequestSource for GitHubClient {
    async fn pull_requests_page(
        &self,
        query: &PullRequestQuery,
        page: u32,
    ) -> Result<Vec<PullRequestSummary>> {
        let route = format!("{}/pulls", Self::repo_route(&query.owner, &query.repo));
        let params = ListPullsParams {
            state: &query.state,
            base: query.base.as_deref().filter(|b| !b.is_empty()),
            sort: "created",
            direction: "desc",
            per_page: query.page_size,
            page,
        };
        tracing::debug!(%route, page, "Fetching pull requests page");
        Ok(self.octocrab.get(route, Some(&params)).await?)
    }

    async fn pull_request_details(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestSummary> {
        let route = format!("{}/pulls/{number}", Self::repo_route(owner, repo));
        Ok(self.octocrab.get(route, None::<&()>).await?)
    }

    async fn pull_request_commits(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<Commit>> {
        let route = format!("{}/pulls/{number}/commits", Self::repo_route(owner, repo));
        let params = PageParams {
            per_page: page_size,
            page,
        };
        Ok(self.octocrab.get(route, Some(&params)).await?)
    }

    async fn commit_details(&self, owner: &str, repo: &str, sha: &str) -> Result<Commit> {
        let sha = sha.trim();
        if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MetricsError::Upstream(format!("invalid commit sha {sha:?}")));
        }
        let route = format!("{}/commits/{sha}", Self::repo_route(owner, repo));
        Ok(self.octocrab.get(route, None::<&()>).await?)
    }

    async fn reviews(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<ReviewEvent>> {
        let route = format!("{}/pulls/{number}/reviews", Self::repo_route(owner, repo));
        Ok(self.octocrab.get(route, None::<&()>).await?)
    }
}

#[async_trait]
impl ReleaseSource for GitHubClient {
    async fn releases_page(
        &self,
        owner: &str,
        repo: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<Release>> {
        let route = format!("{}/releases", Self::repo_route(owner, repo));
        let params = PageParams {
            per_page: page_size,
            page,
        };
        tracing::debug!(%route, page, "Fetching releases page");
        Ok(self.octocrab.get(route, Some(&params)).await?)
    }

    async fn compare_commits(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
    ) -> Result<Vec<Commit>> {
        let route = format!(
            "{}/compare/{}...{}",
            Self::repo_route(owner, repo),
            validate_reference(base)?,
            validate_reference(head)?
        );
        tracing::debug!(%route, "Comparing references");
        let comparison: CommitComparison = self.octocrab.get(route, None::<&()>).await?;
        Ok(comparison.commits)
    }
}

#[async_trait]
impl WorkflowSource for GitHubClient {
    async fn workflow_runs_page(
        &self,
        owner: &str,
        repo: &str,
        created: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<WorkflowRun>> {
        let route = format!("{}/actions/runs", Self::repo_route(owner, repo));
        let params = ListRunsParams {
            created,
            per_page: page_size,
            page,
        };
        tracing::debug!(%route, page, "Fetching workflow runs page");
        let response: WorkflowRunsResponse = self.octocrab.get(route, Some(&params)).await?;
        Ok(response.workflow_runs)
    }

    async fn run_timing(&self, owner: &str, repo: &str, run_id: u64) -> Result<WorkflowTiming> {
        let route = format!("{}/actions/runs/{run_id}/timing", Self::repo_route(owner, repo));
        Ok(self.octocrab.get(route, None::<&()>).await?)
    }

    async fn workflows_page(
        &self,
        owner: &str,
        repo: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<Workflow>> {
        let route = format!("{}/actions/workflows", Self::repo_route(owner, repo));
        let params = PageParams {
            per_page: page_size,
            page,
        };
        let response: WorkflowsResponse = self.octocrab.get(route, Some(&params)).await?;
        Ok(response.workflows)
    }

    async fn workflow_usage(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
    ) -> Result<WorkflowTiming> {
        let route = format!(
            "{}/actions/workflows/{workflow_id}/timing",
            Self::repo_route(owner, repo)
        );
        Ok(self.octocrab.get(route, None::<&()>).await?)
    }
}

#[async_trait]
impl AccountSource for GitHubClient {
    async fn user_repositories(&self, page_size: u8, page: u32) -> Result<Vec<Repository>> {
        let params = ListUserReposParams {
            sort: "full_name",
            per_page: page_size,
            page,
        };
        Ok(self.octocrab.get("/user/repos", Some(&params)).await?)
    }
}
