//! GitHub Actions billing per workflow.
//!
//! Billable milliseconds are summed per workflow and per runner operating
//! system, then turned into whole minutes and priced with the configured
//! `BillingRates`.

use crate::config::BillingRates;
use crate::error::{MetricsError, Result};
use crate::fetcher::paginate;
use crate::github::{BillableTiming, Workflow, WorkflowSource};
use crate::window::{DateWindow, DATE_FORMAT};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::BTreeMap;

const MILLIS_PER_MINUTE: u64 = 60_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerEnvironment {
    Ubuntu,
    MacOs,
    Windows,
}

impl RunnerEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ubuntu => "Ubuntu",
            Self::MacOs => "MacOs",
            Self::Windows => "Windows",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowCost {
    pub environment: RunnerEnvironment,
    /// Whole billable minutes; the remainder is dropped.
    pub minutes: u64,
    pub cost: f64,
}

/// Billable minutes and their price on each runner for one workflow.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowBilling {
    pub name: String,
    pub costs: Vec<WorkflowCost>,
}

impl WorkflowBilling {
    pub fn new(name: String, billable: &BillableTiming, rates: &BillingRates) -> Self {
        let cost = |environment, total_ms: u64, rate: f64| {
            let minutes = total_ms / MILLIS_PER_MINUTE;
            WorkflowCost {
                environment,
                minutes,
                cost: minutes as f64 * rate,
            }
        };

        Self {
            name,
            costs: vec![
                cost(RunnerEnvironment::Ubuntu, billable.ubuntu.total_ms, rates.linux),
                cost(RunnerEnvironment::MacOs, billable.macos.total_ms, rates.macos),
                cost(RunnerEnvironment::Windows, billable.windows.total_ms, rates.windows),
            ],
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.costs.iter().map(|c| c.cost).sum()
    }
}

fn accumulate(total: &mut BillableTiming, timing: &BillableTiming) {
    total.ubuntu.total_ms += timing.ubuntu.total_ms;
    total.macos.total_ms += timing.macos.total_ms;
    total.windows.total_ms += timing.windows.total_ms;
}

/// The `created` search qualifier covering the window's days, `*` for an open side.
pub fn created_filter(window: &DateWindow) -> String {
    let bound = |day: Option<NaiveDate>| {
        day.map_or_else(|| "*".to_string(), |d| d.format(DATE_FORMAT).to_string())
    };
    let first = Some(window.start.date_naive()).filter(|d| *d != NaiveDate::MIN);
    let last = Some(window.end.date_naive())
        .filter(|d| *d != NaiveDate::MAX)
        .and_then(|d| d.pred_opt());
    format!("{}..{}", bound(first), bound(last))
}

/// Bills every run created in the window, grouped by workflow name in name order.
pub async fn run_billing<S>(
    source: &S,
    owner: &str,
    repo: &str,
    window: &DateWindow,
    page_size: u8,
    concurrency: usize,
    rates: &BillingRates,
) -> Result<Vec<WorkflowBilling>>
where
    S: WorkflowSource + ?Sized,
{
    let created = created_filter(window);
    let created = created.as_str();
    let mut pages = std::pin::pin!(paginate(page_size, move |page| {
        source.workflow_runs_page(owner, repo, created, page_size, page)
    }));

    let mut totals: BTreeMap<String, BillableTiming> = BTreeMap::new();
    let mut runs = 0usize;
    while let Some(page) = pages.try_next().await? {
        runs += page.len();
        let timings: Vec<_> = stream::iter(&page)
            .map(|run| async move {
                let timing = source.run_timing(owner, repo, run.id).await?;
                Ok::<_, MetricsError>((run.name.as_str(), timing))
            })
            .buffered(concurrency.max(1))
            .boxed()
            .try_collect()
            .await?;

        for (name, timing) in timings {
            accumulate(totals.entry(name.to_string()).or_default(), &timing.billable);
        }
    }

    tracing::info!(
        owner = %owner,
        repo = %repo,
        created = %created,
        runs,
        workflows = totals.len(),
        "Calculated workflow run billing"
    );
    Ok(totals
        .into_iter()
        .map(|(name, billable)| WorkflowBilling::new(name, &billable, rates))
        .collect())
}

/// Bills each workflow of the repository for the current billing cycle, in listing order.
pub async fn workflow_billing<S>(
    source: &S,
    owner: &str,
    repo: &str,
    page_size: u8,
    concurrency: usize,
    rates: &BillingRates,
) -> Result<Vec<WorkflowBilling>>
where
    S: WorkflowSource + ?Sized,
{
    let pages: Vec<Vec<Workflow>> = paginate(page_size, move |page| {
        source.workflows_page(owner, repo, page_size, page)
    })
    .try_collect()
    .await?;
    let workflows: Vec<Workflow> = pages.into_iter().flatten().collect();
    tracing::debug!(owner = %owner, repo = %repo, workflows = workflows.len(), "Fetched workflows");

    stream::iter(&workflows)
        .map(|workflow| async move {
            let usage = source.workflow_usage(owner, repo, workflow.id).await?;
            Ok::<_, MetricsError>(WorkflowBilling::new(
                workflow.name.clone(),
                &usage.billable,
                rates,
            ))
        })
        .buffered(concurrency.max(1))
        .boxed()
        .try_collect()
        .await
}
