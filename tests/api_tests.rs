use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use prflow::config::AppConfig;
use prflow::error::{MetricsError, Result};
use prflow::github::{
    AccountSource, BillableTiming, Commit, CommitDetails, Committer, EnvironmentTiming,
    IssueState, PullRequestQuery, PullRequestSource, PullRequestSummary, Release, ReleaseSource,
    Repository, ReviewEvent, ReviewVerdict, User, Workflow, WorkflowRun, WorkflowSource,
    WorkflowTiming,
};
use prflow::{create_app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

fn user(name: &str) -> User {
    User {
        id: 1,
        username: name.to_string(),
    }
}

fn commit(sha: &str, date: DateTime<Utc>) -> Commit {
    Commit {
        sha: sha.to_string(),
        details: CommitDetails {
            message: String::new(),
            committer: Committer {
                name: "dev".to_string(),
                email: "dev@example.com".to_string(),
                date,
            },
        },
    }
}

/// Merged pull request created on `day` at 09:00, merged `lead_hours` later.
fn merged(number: u64, day: u32, lead_hours: i64) -> PullRequestSummary {
    let created_at = at(day, 9);
    let merged_at = created_at + Duration::hours(lead_hours);
    PullRequestSummary {
        number,
        title: format!("Change {number}"),
        creator: user("dev"),
        reviewers: vec![user("reviewer")],
        labels: vec![],
        state: IssueState::Closed,
        created_at,
        updated_at: Some(merged_at),
        closed_at: Some(merged_at),
        merged_at: Some(merged_at),
        merge_commit_sha: Some(format!("sha{number}")),
        comments: 0,
        review_comments: 0,
        commits: 0,
        additions: 0,
        deletions: 0,
        changed_files: 0,
    }
}

/// Serves one page of pull requests and one page of releases.
struct StaticSource {
    pull_requests: Vec<PullRequestSummary>,
    releases: Vec<Release>,
    fail: bool,
}

impl StaticSource {
    fn find(&self, number: u64) -> Result<&PullRequestSummary> {
        self.pull_requests
            .iter()
            .find(|pr| pr.number == number)
            .ok_or_else(|| MetricsError::Upstream(format!("no pull request #{number}")))
    }
}

#[async_trait]
impl PullRequestSource for StaticSource {
    async fn pull_requests_page(
        &self,
        _query: &PullRequestQuery,
        page: u32,
    ) -> Result<Vec<PullRequestSummary>> {
        if self.fail {
            return Err(MetricsError::Upstream("connection reset".to_string()));
        }
        Ok(if page == 1 {
            self.pull_requests.clone()
        } else {
            vec![]
        })
    }

    async fn pull_request_details(
        &self,
        _owner: &str,
        _repo: &str,
        number: u64,
    ) -> Result<PullRequestSummary> {
        let mut pr = self.find(number)?.clone();
        pr.comments = 2;
        pr.commits = 3;
        pr.additions = 40;
        pr.deletions = 10;
        pr.changed_files = 4;
        Ok(pr)
    }

    async fn pull_request_commits(
        &self,
        _owner: &str,
        _repo: &str,
        number: u64,
        _page_size: u8,
        _page: u32,
    ) -> Result<Vec<Commit>> {
        let pr = self.find(number)?;
        Ok(vec![commit("first", pr.created_at)])
    }

    async fn commit_details(&self, _owner: &str, _repo: &str, sha: &str) -> Result<Commit> {
        let pr = self
            .pull_requests
            .iter()
            .find(|pr| pr.merge_commit_sha.as_deref() == Some(sha))
            .ok_or_else(|| MetricsError::Upstream(format!("no commit {sha}")))?;
        Ok(commit(sha, pr.merged_at.unwrap_or(pr.created_at)))
    }

    async fn reviews(&self, _owner: &str, _repo: &str, _number: u64) -> Result<Vec<ReviewEvent>> {
        Ok(vec![ReviewEvent {
            id: 1,
            state: ReviewVerdict::Approved,
            user: user("reviewer"),
            submitted_at: Some(at(2, 0)),
        }])
    }
}

#[async_trait]
impl ReleaseSource for StaticSource {
    async fn releases_page(
        &self,
        _owner: &str,
        _repo: &str,
        _page_size: u8,
        page: u32,
    ) -> Result<Vec<Release>> {
        Ok(if page == 1 {
            self.releases.clone()
        } else {
            vec![]
        })
    }

    async fn compare_commits(
        &self,
        _owner: &str,
        _repo: &str,
        base: &str,
        head: &str,
    ) -> Result<Vec<Commit>> {
        let mut first = commit("c0ffee1", at(8, 9));
        first.details.message = format!("Start after {base}\n\nDetails");
        let mut second = commit("c0ffee2", at(9, 9));
        second.details.message = format!("Reach {head}");
        Ok(vec![first, second])
    }
}

fn timing(ubuntu_ms: u64, macos_ms: u64) -> WorkflowTiming {
    WorkflowTiming {
        billable: BillableTiming {
            ubuntu: EnvironmentTiming { total_ms: ubuntu_ms },
            macos: EnvironmentTiming { total_ms: macos_ms },
            windows: EnvironmentTiming::default(),
        },
    }
}

#[async_trait]
impl WorkflowSource for StaticSource {
    async fn workflow_runs_page(
        &self,
        _owner: &str,
        _repo: &str,
        _created: &str,
        _page_size: u8,
        page: u32,
    ) -> Result<Vec<WorkflowRun>> {
        if page > 1 {
            return Ok(vec![]);
        }
        Ok(["CI", "Release", "CI"]
            .into_iter()
            .zip(1u64..)
            .map(|(name, id)| WorkflowRun {
                id,
                name: name.to_string(),
                workflow_id: 0,
                created_at: at(3, 9),
            })
            .collect())
    }

    async fn run_timing(&self, _owner: &str, _repo: &str, run_id: u64) -> Result<WorkflowTiming> {
        Ok(timing(run_id * 60_000, 0))
    }

    async fn workflows_page(
        &self,
        _owner: &str,
        _repo: &str,
        _page_size: u8,
        page: u32,
    ) -> Result<Vec<Workflow>> {
        Ok(if page == 1 {
            vec![Workflow {
                id: 5,
                name: "CI".to_string(),
                state: Some("active".to_string()),
            }]
        } else {
            vec![]
        })
    }

    async fn workflow_usage(
        &self,
        _owner: &str,
        _repo: &str,
        _workflow_id: u64,
    ) -> Result<WorkflowTiming> {
        Ok(timing(0, 90_000))
    }
}

#[async_trait]
impl AccountSource for StaticSource {
    async fn user_repositories(&self, page_size: u8, page: u32) -> Result<Vec<Repository>> {
        let all: Vec<Repository> = (1..=3)
            .map(|id| Repository {
                id,
                name: format!("repo{id}"),
                full_name: format!("acme/repo{id}"),
                description: None,
                html_url: format!("https://github.com/acme/repo{id}"),
                ssh_url: format!("git@github.com:acme/repo{id}.git"),
                private: false,
                language: Some("Rust".to_string()),
                stars: id,
            })
            .collect();
        Ok(all
            .chunks(usize::from(page_size))
            .nth(page as usize - 1)
            .map(<[Repository]>::to_vec)
            .unwrap_or_default())
    }
}

fn app_with(source: StaticSource) -> Router {
    let config = AppConfig {
        cache_ttl_seconds: 60,
        ..AppConfig::default()
    };
    create_app(Arc::new(AppState::with_source(config, Arc::new(source))))
}

fn app() -> Router {
    app_with(StaticSource {
        pull_requests: vec![merged(3, 20, 3), merged(2, 10, 2), merged(1, 5, 1)],
        releases: vec![Release {
            tag_name: "v1.2.0".to_string(),
            name: Some("1.2.0".to_string()),
            draft: false,
            prerelease: false,
            created_at: at(6, 0),
            published_at: Some(at(7, 0)),
        }],
        fail: false,
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&body_bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body_bytes).into_owned()));
    (status, body)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn test_health_check() {
    let (status, body) = get(app(), "/api/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "prflow");
}

#[tokio::test]
async fn test_defaults_hide_token() {
    let config = AppConfig {
        github_token: Some("secret".to_string()),
        ..AppConfig::default()
    };
    let source = StaticSource {
        pull_requests: vec![],
        releases: vec![],
        fail: false,
    };
    let app = create_app(Arc::new(AppState::with_source(config, Arc::new(source))));

    let (status, body) = get(app, "/api/defaults").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.get("github_token").is_none());
    assert_eq!(body["pull_request_state"], "all");
    assert_eq!(body["page_size"], 20);
    assert_eq!(body["enrichment_policy"], "fail_fast");
}

#[tokio::test]
async fn test_metrics_for_window() {
    let (status, body) = get(
        app(),
        "/api/repos/acme/widgets/metrics?start_date=2024-01-01&end_date=2024-01-15",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["total"]["lead_time"], 3 * 3600);
    assert_eq!(body["total"]["additions"], 80);
    assert_eq!(body["average"]["lead_time"], 5400.0);
    assert_eq!(body["average"]["commits"], 3.0);
    assert_eq!(body["flow_ratio"]["summary"]["created"], 2);
    assert_eq!(body["flow_ratio"]["summary"]["merged"], 2);
    assert_eq!(body["flow_ratio"]["summary"]["ratio"], "1.00");
    assert!(body["flow_ratio"]["days"].get("2024-01-20").is_none());

    let numbers: Vec<u64> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["number"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, [2, 1]);
}

#[tokio::test]
async fn test_metrics_for_empty_window() {
    let (status, body) = get(
        app(),
        "/api/repos/acme/widgets/metrics?start_date=2024-01-25&end_date=2024-01-31",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert!(body["average"].is_null());
    assert!(body["flow_ratio"]["summary"]["ratio"].is_null());
}

#[tokio::test]
async fn test_metrics_rejects_invalid_dates() {
    let (status, body) = get(app(), "/api/repos/acme/widgets/metrics?start_date=01/01/2024").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.as_str().unwrap().contains("01/01/2024"));

    let (status, _) = get(
        app(),
        "/api/repos/acme/widgets/metrics?start_date=2024-02-01&end_date=2024-01-01",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upstream_failure_is_internal_error() {
    let app = app_with(StaticSource {
        pull_requests: vec![],
        releases: vec![],
        fail: true,
    });

    let (status, body) = get(app, "/api/repos/acme/widgets/metrics").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Internal Server Error");
}

#[tokio::test]
async fn test_sprint_metrics() {
    let payload = json!({
        "sprints": [
            { "number": 1, "name": "Sprint 1", "start_date": "2024-01-01", "end_date": "2024-01-10" },
            { "number": 2, "name": "Sprint 2", "start_date": "2024-01-10", "end_date": "2024-01-21" },
            { "number": 3, "name": "Unplanned", "start_date": null, "end_date": null }
        ]
    });
    let request = Request::builder()
        .method("POST")
        .uri("/api/repos/acme/widgets/sprints")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    let reports = body.as_array().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["sprint"]["number"], 1);
    assert_eq!(reports[0]["metrics"]["count"], 2);
    assert_eq!(reports[1]["metrics"]["count"], 2);
    assert_eq!(reports[0]["releases"]["all"]["created"], 1);
    assert_eq!(reports[0]["releases"]["all"]["published"], 1);
    assert_eq!(reports[1]["releases"]["all"]["created"], 0);
}

#[tokio::test]
async fn test_release_report() {
    let (status, body) = get(
        app(),
        "/api/repos/acme/widgets/releases/report?start_date=2024-01-01&end_date=2024-01-31&version_pattern=true",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["all"]["created"], 1);
    assert_eq!(body["all"]["published"], 1);
    assert_eq!(body["all"]["created_to_published_ratio"], 1.0);
}

#[tokio::test]
async fn test_pull_requests_listing() {
    let (status, body) = get(app(), "/api/repos/acme/widgets/pulls?state=closed").await;

    assert_eq!(status, StatusCode::OK);
    let listing = body.as_array().unwrap();
    assert_eq!(listing.len(), 3);
    assert_eq!(listing[0]["number"], 3);
    assert_eq!(listing[0]["status"], "merged");
    assert_eq!(listing[0]["review_states"]["reviewer"], "APPROVED");
    assert_eq!(listing[0]["reviews"]["approved"], 1);
}

#[tokio::test]
async fn test_commit_list() {
    let (status, body) = get(app(), "/api/repos/acme/widgets/commits/compare?base=v1.0.0").await;

    assert_eq!(status, StatusCode::OK);
    let commits = body.as_array().unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0]["sha"], "c0ffee1");
    assert_eq!(commits[1]["commit"]["message"], "Reach HEAD");

    let (status, _) = get(app(), "/api/repos/acme/widgets/commits/compare").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(
        app(),
        "/api/repos/acme/widgets/commits/compare?base=v1.0.0&head=main..dev",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_workflow_run_billing() {
    let (status, body) = get(
        app(),
        "/api/repos/acme/widgets/workflows/runs/billing?start_date=2024-01-01&end_date=2024-01-31",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let billing = body.as_array().unwrap();
    assert_eq!(billing.len(), 2);
    assert_eq!(billing[0]["name"], "CI");
    assert_eq!(billing[0]["costs"][0]["environment"], "ubuntu");
    assert_eq!(billing[0]["costs"][0]["minutes"], 4);
    assert_eq!(billing[1]["name"], "Release");
    assert_eq!(billing[1]["costs"][0]["minutes"], 2);
}

#[tokio::test]
async fn test_workflow_billing() {
    let (status, body) = get(app(), "/api/repos/acme/widgets/workflows/billing").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "CI");
    assert_eq!(body[0]["costs"][1]["environment"], "macos");
    assert_eq!(body[0]["costs"][1]["minutes"], 1);
    assert_eq!(body[0]["costs"][1]["cost"], 0.08);
}

#[tokio::test]
async fn test_user_repositories() {
    let (status, body) = get(app(), "/api/user/repos?page_size=2&page=2").await;

    assert_eq!(status, StatusCode::OK);
    let repositories = body.as_array().unwrap();
    assert_eq!(repositories.len(), 1);
    assert_eq!(repositories[0]["full_name"], "acme/repo3");
    assert_eq!(repositories[0]["stargazers_count"], 3);
}

async fn github_backed_app(server: &MockServer) -> Router {
    let config = AppConfig {
        github_api_url: Some(server.uri()),
        ..AppConfig::default()
    };
    create_app(Arc::new(AppState::new(config).unwrap()))
}

#[tokio::test]
async fn test_github_rate_limit_is_too_many_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/pulls"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "message": "API rate limit exceeded for 127.0.0.1.",
            "documentation_url": "https://docs.github.com/rest/rate-limit"
        })))
        .mount(&server)
        .await;

    let (status, body) = get(github_backed_app(&server).await, "/api/repos/acme/widgets/metrics").await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, "GitHub Rate Limit Exceeded");
}

#[tokio::test]
async fn test_github_missing_repository_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/missing/pulls"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Not Found",
            "documentation_url": "https://docs.github.com/rest"
        })))
        .mount(&server)
        .await;

    let (status, body) = get(github_backed_app(&server).await, "/api/repos/acme/missing/pulls").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Not Found");
}
