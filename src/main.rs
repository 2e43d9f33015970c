use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use prflow::config::{AppConfig, EnrichmentPolicy, RepoId};
use prflow::querier::{
    CommitListQuery, ListQuery, MetricsQuerier, MetricsQuery, PullRequestFilter, ReleaseQuery,
    RepositoriesQuery, SprintQuery, WorkflowRunsQuery,
};
use prflow::release::TagFilter;
use prflow::sprint::parse_sprints;
use prflow::window::DateWindow;
use prflow::{create_app, render, AppState};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "prflow",
    version,
    about = "Pull request flow metrics for GitHub repositories",
    long_about = None
)]
struct Cli {
    /// GitHub authorization token.
    #[arg(short = 't', long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the metrics over HTTP.
    Serve {
        /// Port to listen on (overrides PORT).
        #[arg(long)]
        port: Option<u16>,
    },
    #[command(flatten)]
    Report(ReportCommand),
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
    /// Lead time, time to merge, size and flow ratio of the pull requests created in a date range.
    PrMetrics {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        output: OutputArgs,
        /// Leave pull requests that cannot be enriched out of the report instead of failing.
        #[arg(long)]
        skip_failed: bool,
    },
    /// Pull request and release reports for each sprint in a JSON list.
    SprintMetrics {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        filter: FilterArgs,
        /// JSON array of `{"number", "name", "start_date", "end_date"}` objects.
        #[arg(long)]
        sprints: String,
        #[command(flatten)]
        tags: TagArgs,
        #[command(flatten)]
        output: OutputArgs,
        #[arg(long)]
        skip_failed: bool,
    },
    /// Releases created and published in a date range.
    ReleaseReport {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        tags: TagArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// One page of pull requests with their review states.
    PullRequests {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        filter: FilterArgs,
        /// Page number, starting at 1.
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Commits between two tags or commits.
    CommitList {
        #[command(flatten)]
        repo: RepoArgs,
        /// Tag or commit to compare from.
        #[arg(short = 's', long)]
        start_tag: String,
        /// Tag or commit to compare to. [default: HEAD]
        #[arg(short, long)]
        end_tag: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// GitHub Actions billing of a repository.
    Workflows {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        output: OutputArgs,
        #[command(subcommand)]
        action: WorkflowsCommand,
    },
    /// Repositories of the authenticated user.
    UserRepos {
        /// Repositories per page.
        #[arg(short = 's', long)]
        page_size: Option<u8>,
        /// Page number, starting at 1.
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Subcommand, Debug)]
enum WorkflowsCommand {
    /// Billable minutes of the runs created in a date range, per workflow.
    Runs {
        #[command(flatten)]
        range: RangeArgs,
        /// Workflow runs per page.
        #[arg(short = 's', long)]
        page_size: Option<u8>,
    },
    /// Billable minutes of each workflow during the current billing cycle.
    Billable,
}

#[derive(Args, Debug)]
struct RepoArgs {
    /// Owner of the repository.
    #[arg(short, long)]
    owner: String,
    /// Repository name.
    #[arg(short, long)]
    repository: String,
}

impl RepoArgs {
    fn repo_id(&self) -> RepoId {
        RepoId {
            owner: self.owner.clone(),
            repo: self.repository.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Base branch the pull requests were opened against.
    #[arg(short, long)]
    base: Option<String>,
    /// Pull request state: open, closed or all.
    #[arg(short = 'a', long)]
    state: Option<String>,
    /// Pull requests per page.
    #[arg(short = 's', long)]
    page_size: Option<u8>,
}

impl From<FilterArgs> for PullRequestFilter {
    fn from(args: FilterArgs) -> Self {
        Self {
            base: args.base,
            state: args.state,
            page_size: args.page_size,
        }
    }
}

#[derive(Args, Debug)]
struct RangeArgs {
    /// First day of the range. [format: yyyy-mm-dd]
    #[arg(short = 'f', long)]
    start_date: Option<String>,
    /// Last day of the range, inclusive. [format: yyyy-mm-dd]
    #[arg(short, long)]
    end_date: Option<String>,
}

impl RangeArgs {
    fn window(&self) -> prflow::error::Result<DateWindow> {
        DateWindow::parse(self.start_date.as_deref(), self.end_date.as_deref())
    }
}

#[derive(Args, Debug)]
struct TagArgs {
    /// Only count releases tagged `vX.Y.Z`.
    #[arg(long)]
    version_pattern: bool,
    /// Only count releases tagged `vX.Y.Z-<initials>` with this many initials, reported per service.
    #[arg(long)]
    service_initials: Option<usize>,
}

impl TagArgs {
    fn tag_filter(&self) -> TagFilter {
        TagFilter::from_flags(self.version_pattern, self.service_initials)
    }
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn policy(skip_failed: bool) -> Option<EnrichmentPolicy> {
    skip_failed.then_some(EnrichmentPolicy::SkipFailed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so JSON reports on stdout stay parseable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prflow=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if cli.auth_token.is_some() {
        config.github_token = cli.auth_token;
    }

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        Command::Report(command) => {
            let querier = MetricsQuerier::new(&config)?;
            report(&querier, command).await
        }
    }
}

async fn report(querier: &MetricsQuerier, command: ReportCommand) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();

    match command {
        ReportCommand::PrMetrics {
            repo,
            filter,
            range,
            output,
            skip_failed,
        } => {
            let query = MetricsQuery {
                repo: repo.repo_id(),
                window: range.window()?,
                filter: filter.into(),
                policy: policy(skip_failed),
            };
            let metrics = querier.pull_request_metrics(&query).await?;
            if output.json {
                render::write_json(&mut out, &metrics)?;
            } else {
                render::write_metrics(&mut out, &metrics)?;
                writeln!(out)?;
                render::write_flow_ratio(&mut out, &metrics.flow_ratio)?;
            }
        }
        ReportCommand::SprintMetrics {
            repo,
            filter,
            sprints,
            tags,
            output,
            skip_failed,
        } => {
            let query = SprintQuery {
                repo: repo.repo_id(),
                sprints: parse_sprints(&sprints)?,
                filter: filter.into(),
                tag_filter: tags.tag_filter(),
                policy: policy(skip_failed),
            };
            let reports = querier.sprint_metrics(&query).await?;
            if output.json {
                render::write_json(&mut out, &reports)?;
            } else {
                render::write_sprint_reports(&mut out, &reports)?;
            }
        }
        ReportCommand::ReleaseReport {
            repo,
            range,
            tags,
            output,
        } => {
            let query = ReleaseQuery {
                repo: repo.repo_id(),
                window: range.window()?,
                tag_filter: tags.tag_filter(),
            };
            let report = querier.release_report(&query).await?;
            if output.json {
                render::write_json(&mut out, &report)?;
            } else {
                render::write_release_reports(&mut out, &report)?;
            }
        }
        ReportCommand::PullRequests {
            repo,
            filter,
            page,
            output,
        } => {
            let query = ListQuery {
                repo: repo.repo_id(),
                filter: filter.into(),
                page,
            };
            let listing = querier.pull_requests(&query).await?;
            if output.json {
                render::write_json(&mut out, &listing)?;
            } else {
                render::write_listing(&mut out, &listing)?;
            }
        }
        ReportCommand::CommitList {
            repo,
            start_tag,
            end_tag,
            output,
        } => {
            let query = CommitListQuery {
                repo: repo.repo_id(),
                base: start_tag,
                head: end_tag,
            };
            let commits = querier.commit_list(&query).await?;
            if output.json {
                render::write_json(&mut out, &commits)?;
            } else {
                render::write_commits(&mut out, &commits)?;
            }
        }
        ReportCommand::Workflows {
            repo,
            output,
            action,
        } => {
            let billing = match action {
                WorkflowsCommand::Runs { range, page_size } => {
                    let query = WorkflowRunsQuery {
                        repo: repo.repo_id(),
                        window: range.window()?,
                        page_size,
                    };
                    querier.workflow_run_billing(&query).await?
                }
                WorkflowsCommand::Billable => querier.workflow_billing(&repo.repo_id()).await?,
            };
            if output.json {
                render::write_json(&mut out, &billing)?;
            } else {
                render::write_workflow_billing(&mut out, &billing)?;
            }
        }
        ReportCommand::UserRepos {
            page_size,
            page,
            output,
        } => {
            let query = RepositoriesQuery { page_size, page };
            let repositories = querier.user_repositories(&query).await?;
            if output.json {
                render::write_json(&mut out, &repositories)?;
            } else {
                render::write_repositories(&mut out, &repositories)?;
            }
        }
    }

    out.flush()?;
    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(AppState::new(config)?);
    let app = create_app(state);

    tracing::info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("failed to start server")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
