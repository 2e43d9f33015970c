//! Text and JSON output for the command-line reports.

use crate::github::{Commit, Repository};
use crate::metrics::{FlowRatioMap, PullRequestMetrics};
use crate::querier::PullRequestListing;
use crate::release::{ReleaseReport, ReleaseReports};
use crate::sprint::SprintReport;
use crate::workflows::WorkflowBilling;
use chrono::Duration;
use serde::Serialize;
use std::io::{self, Write};

const NOT_AVAILABLE: &str = "n/a";

/// Formats a duration as `N days & HH:MM:SS`; zero renders as an empty string.
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return String::new();
    }
    let sign = if duration < Duration::zero() { "-" } else { "" };
    let total = duration.num_seconds().unsigned_abs();
    let (days, rest) = (total / 86_400, total % 86_400);
    format!(
        "{sign}{days} days & {:02}:{:02}:{:02}",
        rest / 3600,
        rest % 3600 / 60,
        rest % 60
    )
}

fn format_seconds(seconds: f64) -> String {
    format_duration(Duration::seconds(seconds.round() as i64))
}

pub fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)
}

pub fn write_metrics<W: Write>(out: &mut W, metrics: &PullRequestMetrics) -> io::Result<()> {
    writeln!(
        out,
        "{:>6}  {:<40}  {:>8}  {:>8}  {:>7}  {:>9}  {:>9}  {:>7}  {:<20}  {:<20}  {}",
        "#", "Title", "Comments", "Reviews", "Commits", "Additions", "Deletions", "Files",
        "Lead Time", "Time to Merge", "Created At"
    )?;
    for d in &metrics.details {
        writeln!(
            out,
            "{:>6}  {:<40}  {:>8}  {:>8}  {:>7}  {:>9}  {:>9}  {:>7}  {:<20}  {:<20}  {}",
            d.number,
            truncate(&d.title, 40),
            d.comments,
            d.review_comments,
            d.commits,
            d.additions,
            d.deletions,
            d.changed_files,
            format_duration(d.lead_time),
            format_duration(d.time_to_merge),
            d.created_at.format("%Y-%m-%d %H:%M:%S"),
        )?;
    }

    let t = &metrics.total;
    writeln!(
        out,
        "{:>6}  {:<40}  {:>8}  {:>8}  {:>7}  {:>9}  {:>9}  {:>7}  {:<20}  {:<20}",
        "",
        format!("Total ({})", metrics.count),
        t.comments,
        t.review_comments,
        t.commits,
        t.additions,
        t.deletions,
        t.changed_files,
        format_duration(t.lead_time),
        format_duration(t.time_to_merge),
    )?;

    match &metrics.average {
        Some(a) => writeln!(
            out,
            "{:>6}  {:<40}  {:>8.2}  {:>8.2}  {:>7.2}  {:>9.2}  {:>9.2}  {:>7.2}  {:<20}  {:<20}",
            "",
            "Average",
            a.comments,
            a.review_comments,
            a.commits,
            a.additions,
            a.deletions,
            a.changed_files,
            format_seconds(a.lead_time),
            format_seconds(a.time_to_merge),
        )?,
        None => writeln!(out, "{:>6}  {:<40}  {NOT_AVAILABLE}", "", "Average")?,
    }

    for failure in &metrics.failures {
        writeln!(out, "skipped #{}: {}", failure.number, failure.reason)?;
    }
    Ok(())
}

/// Day rows in ascending order followed by the summary row.
pub fn write_flow_ratio<W: Write>(out: &mut W, flow: &FlowRatioMap) -> io::Result<()> {
    writeln!(out, "{:<12}  {:>7}  {:>7}  {:>7}", "Date", "Created", "Merged", "Ratio")?;
    for (day, entry) in flow.rows() {
        writeln!(
            out,
            "{:<12}  {:>7}  {:>7}  {:>7}",
            day,
            entry.created,
            entry.merged,
            entry.ratio.as_deref().unwrap_or(NOT_AVAILABLE)
        )?;
    }
    Ok(())
}

fn write_release_row<W: Write>(out: &mut W, label: &str, report: &ReleaseReport) -> io::Result<()> {
    writeln!(
        out,
        "{:<10}  {:>6}  {:>11}  {:>7}  {:>9}  {:>7.2}",
        label,
        report.draft,
        report.pre_release,
        report.created,
        report.published,
        report.created_to_published_ratio
    )
}

pub fn write_release_reports<W: Write>(out: &mut W, reports: &ReleaseReports) -> io::Result<()> {
    writeln!(
        out,
        "{:<10}  {:>6}  {:>11}  {:>7}  {:>9}  {:>7}",
        "Service", "Drafts", "Pre-release", "Created", "Published", "Ratio"
    )?;
    match reports {
        ReleaseReports::All(report) => write_release_row(out, "all", report),
        ReleaseReports::ByService(reports) => {
            for (service, report) in reports {
                write_release_row(out, service, report)?;
            }
            Ok(())
        }
    }
}

pub fn write_sprint_reports<W: Write>(out: &mut W, reports: &[SprintReport]) -> io::Result<()> {
    for report in reports {
        let sprint = &report.sprint;
        writeln!(
            out,
            "== Sprint {} {} ({} .. {}) ==",
            sprint.number,
            sprint.name,
            sprint.start_date.map(|d| d.to_string()).unwrap_or_default(),
            sprint.end_date.map(|d| d.to_string()).unwrap_or_default(),
        )?;
        write_metrics(out, &report.metrics)?;
        writeln!(out)?;
        write_flow_ratio(out, &report.metrics.flow_ratio)?;
        writeln!(out)?;
        write_release_reports(out, &report.releases)?;
        writeln!(out)?;
    }
    Ok(())
}

pub fn write_listing<W: Write>(out: &mut W, listing: &[PullRequestListing]) -> io::Result<()> {
    writeln!(
        out,
        "{:>6}  {:<40}  {:<16}  {:<7}  {:>8}  {:>12}  {:>12}",
        "#", "Title", "Author", "State", "Approved", "Req. Changes", "Req. Reviews"
    )?;
    for pr in listing {
        writeln!(
            out,
            "{:>6}  {:<40}  {:<16}  {:<7}  {:>8}  {:>12}  {:>12}",
            pr.number,
            truncate(&pr.title, 40),
            truncate(&pr.creator, 16),
            pr.status.as_str(),
            pr.reviews.approved,
            pr.reviews.changes_requested,
            pr.reviews.total
        )?;
    }
    Ok(())
}

/// One line per commit: short sha, commit date, committer and subject line.
pub fn write_commits<W: Write>(out: &mut W, commits: &[Commit]) -> io::Result<()> {
    for commit in commits {
        let sha: String = commit.sha.chars().take(7).collect();
        writeln!(
            out,
            "{sha}  {}  {:<20}  {}",
            commit.committed_at().format("%Y-%m-%d %H:%M"),
            truncate(&commit.details.committer.name, 20),
            commit.details.message.lines().next().unwrap_or_default()
        )?;
    }
    Ok(())
}

pub fn write_repositories<W: Write>(out: &mut W, repositories: &[Repository]) -> io::Result<()> {
    writeln!(
        out,
        "{:>10}  {:<40}  {:<7}  {:<12}  {:>6}  {}",
        "ID", "Full Name", "Private", "Language", "Stars", "Url"
    )?;
    for repository in repositories {
        writeln!(
            out,
            "{:>10}  {:<40}  {:<7}  {:<12}  {:>6}  {}",
            repository.id,
            truncate(&repository.full_name, 40),
            repository.private,
            truncate(repository.language.as_deref().unwrap_or_default(), 12),
            repository.stars,
            repository.html_url
        )?;
    }
    Ok(())
}

pub fn write_workflow_billing<W: Write>(out: &mut W, billing: &[WorkflowBilling]) -> io::Result<()> {
    writeln!(out, "{:<40}  {:<8}  {:>8}  {:>9}", "Workflow", "Runner", "Minutes", "Cost")?;
    for workflow in billing {
        for cost in &workflow.costs {
            writeln!(
                out,
                "{:<40}  {:<8}  {:>8}  {:>9.3}",
                truncate(&workflow.name, 40),
                cost.environment.as_str(),
                cost.minutes,
                cost.cost
            )?;
        }
    }
    let total: f64 = billing.iter().map(WorkflowBilling::total_cost).sum();
    writeln!(out, "{:<40}  {:<8}  {:>8}  {:>9.3}", "Total", "", "", total)
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(width.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}
