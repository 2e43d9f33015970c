use crate::enrich::{duration_secs, EnrichmentFailure, MetricDetail};
use crate::github::PullRequestSummary;
use crate::window::{day_key, DateWindow};
use chrono::Duration;
use serde::Serialize;
use std::collections::BTreeMap;

/// Key of the window-wide row in a `FlowRatioMap`.
pub const SUMMARY_KEY: &str = "Summary";

/// Sums of every `MetricDetail` field across the qualifying pull requests.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TotalAggregation {
    #[serde(with = "duration_secs")]
    pub lead_time: Duration,
    #[serde(with = "duration_secs")]
    pub time_to_merge: Duration,
    pub comments: u64,
    pub review_comments: u64,
    pub commits: u64,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
}

impl Default for TotalAggregation {
    fn default() -> Self {
        Self {
            lead_time: Duration::zero(),
            time_to_merge: Duration::zero(),
            comments: 0,
            review_comments: 0,
            commits: 0,
            additions: 0,
            deletions: 0,
            changed_files: 0,
        }
    }
}

impl TotalAggregation {
    fn add(&mut self, detail: &MetricDetail) {
        self.lead_time = self.lead_time + detail.lead_time;
        self.time_to_merge = self.time_to_merge + detail.time_to_merge;
        self.comments += detail.comments;
        self.review_comments += detail.review_comments;
        self.commits += detail.commits;
        self.additions += detail.additions;
        self.deletions += detail.deletions;
        self.changed_files += detail.changed_files;
    }

    /// Arithmetic means over `count` pull requests; `None` when `count` is zero.
    pub fn average(&self, count: usize) -> Option<AverageAggregation> {
        if count == 0 {
            return None;
        }
        let n = count as f64;
        let secs = |d: Duration| d.num_milliseconds() as f64 / 1000.0;

        Some(AverageAggregation {
            lead_time: secs(self.lead_time) / n,
            time_to_merge: secs(self.time_to_merge) / n,
            comments: self.comments as f64 / n,
            review_comments: self.review_comments as f64 / n,
            commits: self.commits as f64 / n,
            additions: self.additions as f64 / n,
            deletions: self.deletions as f64 / n,
            changed_files: self.changed_files as f64 / n,
        })
    }
}

/// Means of the `TotalAggregation` fields. Durations are in seconds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AverageAggregation {
    pub lead_time: f64,
    pub time_to_merge: f64,
    pub comments: f64,
    pub review_comments: f64,
    pub commits: f64,
    pub additions: f64,
    pub deletions: f64,
    pub changed_files: f64,
}

/// Pull requests created and merged on one day (or across the whole window).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlowRatioEntry {
    pub created: u64,
    pub merged: u64,
    /// `created / merged` to two decimals; `None` when nothing was merged.
    pub ratio: Option<String>,
}

impl FlowRatioEntry {
    pub fn new(created: u64, merged: u64) -> Self {
        Self {
            created,
            merged,
            ratio: flow_ratio(created, merged),
        }
    }
}

pub fn flow_ratio(created: u64, merged: u64) -> Option<String> {
    if merged == 0 {
        return None;
    }
    Some(format!("{:.2}", created as f64 / merged as f64))
}

/// Per-day flow rows keyed by `YYYY-MM-DD`, plus the window-wide summary row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlowRatioMap {
    pub days: BTreeMap<String, FlowRatioEntry>,
    pub summary: FlowRatioEntry,
}

impl FlowRatioMap {
    /// Day rows in ascending order followed by the `Summary` row.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &FlowRatioEntry)> {
        self.days
            .iter()
            .map(|(day, entry)| (day.as_str(), entry))
            .chain(std::iter::once((SUMMARY_KEY, &self.summary)))
    }
}

/// Aggregated metrics of one window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PullRequestMetrics {
    pub window: DateWindow,
    /// Number of pull requests whose totals were accumulated.
    pub count: usize,
    pub details: Vec<MetricDetail>,
    pub total: TotalAggregation,
    /// `None` when no pull request qualified.
    pub average: Option<AverageAggregation>,
    pub flow_ratio: FlowRatioMap,
    /// Pull requests left out because enrichment failed.
    pub failures: Vec<EnrichmentFailure>,
}

/// Streaming accumulator for one window.
#[derive(Debug)]
pub struct Aggregator {
    window: DateWindow,
    total: TotalAggregation,
    details: Vec<MetricDetail>,
    created: BTreeMap<String, u64>,
    merged: BTreeMap<String, u64>,
}

impl Aggregator {
    pub fn new(window: DateWindow) -> Self {
        Self {
            window,
            total: TotalAggregation::default(),
            details: Vec::new(),
            created: BTreeMap::new(),
            merged: BTreeMap::new(),
        }
    }

    /// Counts the pull request's created/merged flow and, when it was created
    /// inside the window and `detail` is known, accumulates its totals.
    ///
    /// Returns whether the pull request was created inside the window.
    pub fn record(&mut self, summary: &PullRequestSummary, detail: Option<&MetricDetail>) -> bool {
        if let (Some(_), Some(merged_at)) = (summary.merge_commit(), summary.merged_at) {
            if self.window.contains(merged_at) {
                *self.merged.entry(day_key(merged_at)).or_default() += 1;
            }
        }

        if !self.window.contains(summary.created_at) {
            return false;
        }
        *self.created.entry(day_key(summary.created_at)).or_default() += 1;

        if let Some(detail) = detail {
            self.total.add(detail);
            self.details.push(detail.clone());
        }
        true
    }

    pub fn finish(self, failures: Vec<EnrichmentFailure>) -> PullRequestMetrics {
        let mut days: BTreeMap<String, FlowRatioEntry> = BTreeMap::new();
        for (day, count) in &self.created {
            days.entry(day.clone()).or_default().created = *count;
        }
        for (day, count) in &self.merged {
            days.entry(day.clone()).or_default().merged = *count;
        }
        for entry in days.values_mut() {
            entry.ratio = flow_ratio(entry.created, entry.merged);
        }
        let summary = FlowRatioEntry::new(
            days.values().map(|e| e.created).sum(),
            days.values().map(|e| e.merged).sum(),
        );

        let mut details = self.details;
        details.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.number.cmp(&b.number)));
        let count = details.len();

        PullRequestMetrics {
            window: self.window,
            count,
            average: self.total.average(count),
            total: self.total,
            details,
            flow_ratio: FlowRatioMap { days, summary },
            failures,
        }
    }
}

/// Folds `(summary, detail)` pairs into the metrics of `window`.
///
/// Pairs without a detail only contribute to the flow counts.
pub fn aggregate<'a, I>(window: DateWindow, records: I) -> PullRequestMetrics
where
    I: IntoIterator<Item = (&'a PullRequestSummary, Option<&'a MetricDetail>)>,
{
    let mut aggregator = Aggregator::new(window);
    for (summary, detail) in records {
        aggregator.record(summary, detail);
    }
    aggregator.finish(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::lead_time;
    use crate::enrich::tests::{at, summary};
    use chrono::{DateTime, Utc};

    fn detail(pr: &PullRequestSummary, counters: u64) -> MetricDetail {
        MetricDetail {
            number: pr.number,
            title: pr.title.clone(),
            lead_time: lead_time(pr),
            time_to_merge: Duration::minutes(30),
            created_at: pr.created_at,
            comments: counters,
            review_comments: counters * 2,
            commits: 1,
            additions: counters * 10,
            deletions: counters,
            changed_files: 2,
        }
    }

    fn window(first: u32, last: u32) -> DateWindow {
        let first = format!("2024-01-{first:02}");
        let last = format!("2024-01-{last:02}");
        DateWindow::parse(Some(first.as_str()), Some(last.as_str())).unwrap()
    }

    fn merged(day: u32, hours: i64) -> PullRequestSummary {
        let created: DateTime<Utc> = at(day, 8);
        summary(u64::from(day), created, Some(created + Duration::hours(hours)))
    }

    #[test]
    fn test_end_to_end_window_excludes_later_pull_request() {
        let prs = [merged(5, 1), merged(10, 2), merged(20, 3)];
        let details: Vec<MetricDetail> = prs.iter().map(|pr| detail(pr, 1)).collect();

        let metrics = aggregate(window(1, 15), prs.iter().zip(details.iter().map(Some)));

        assert_eq!(metrics.total.lead_time, Duration::hours(3));
        assert_eq!(metrics.count, 2);
        let average = metrics.average.unwrap();
        assert_eq!(average.lead_time, 5400.0);
        assert!(metrics.details.iter().all(|d| d.number != 20));
        assert!(!metrics.flow_ratio.days.contains_key("2024-01-20"));
        assert_eq!(metrics.flow_ratio.summary.created, 2);
        assert_eq!(metrics.flow_ratio.summary.merged, 2);
        assert_eq!(metrics.flow_ratio.summary.ratio.as_deref(), Some("1.00"));
    }

    #[test]
    fn test_totals_are_sums_and_averages_are_means() {
        let prs = [merged(2, 1), merged(3, 4), summary(4, at(4, 0), None)];
        let details: Vec<MetricDetail> = prs
            .iter()
            .zip([1u64, 3, 8])
            .map(|(pr, counters)| detail(pr, counters))
            .collect();

        let metrics = aggregate(window(1, 31), prs.iter().zip(details.iter().map(Some)));

        assert_eq!(metrics.total.comments, details.iter().map(|d| d.comments).sum::<u64>());
        assert_eq!(metrics.total.review_comments, 24);
        assert_eq!(metrics.total.commits, 3);
        assert_eq!(metrics.total.additions, 120);
        assert_eq!(metrics.total.deletions, 12);
        assert_eq!(metrics.total.changed_files, 6);
        assert_eq!(metrics.total.time_to_merge, Duration::minutes(90));

        let average = metrics.average.unwrap();
        assert_eq!(average.comments, 12.0 / 3.0);
        assert_eq!(average.additions, 40.0);
        assert_eq!(average.time_to_merge, 1800.0);
        assert_eq!(average.lead_time, 5.0 * 3600.0 / 3.0);
    }

    #[test]
    fn test_flow_ratio_per_day() {
        let mut prs: Vec<PullRequestSummary> = (1..=4).map(|n| summary(n, at(3, n as u32), None)).collect();
        // created earlier, merged on the 3rd
        for n in 5..=6 {
            let mut pr = summary(n, at(1, 0), Some(at(3, 12)));
            pr.created_at = at(2, 0);
            prs.push(pr);
        }

        let metrics = aggregate(window(3, 3), prs.iter().map(|pr| (pr, None)));

        let day = &metrics.flow_ratio.days["2024-01-03"];
        assert_eq!(day.created, 4);
        assert_eq!(day.merged, 2);
        assert_eq!(day.ratio.as_deref(), Some("2.00"));
        assert_eq!(metrics.count, 0);
        assert_eq!(metrics.average, None);
    }

    #[test]
    fn test_zero_merged_ratio_is_undefined() {
        let prs = [summary(1, at(3, 0), None)];
        let metrics = aggregate(window(1, 5), prs.iter().map(|pr| (pr, None)));

        assert_eq!(metrics.flow_ratio.days["2024-01-03"].ratio, None);
        assert_eq!(metrics.flow_ratio.summary, FlowRatioEntry::new(1, 0));
        assert_eq!(metrics.flow_ratio.summary.ratio, None);
    }

    #[test]
    fn test_merged_without_merge_commit_is_not_counted() {
        let mut pr = summary(1, at(3, 0), Some(at(3, 5)));
        pr.merge_commit_sha = None;
        let metrics = aggregate(window(1, 5), [(&pr, None)]);

        assert_eq!(metrics.flow_ratio.summary.created, 1);
        assert_eq!(metrics.flow_ratio.summary.merged, 0);
    }

    #[test]
    fn test_empty_window() {
        let metrics = aggregate(window(1, 5), std::iter::empty());

        assert_eq!(metrics.count, 0);
        assert_eq!(metrics.total, TotalAggregation::default());
        assert_eq!(metrics.average, None);
        assert!(metrics.flow_ratio.days.is_empty());
        let rows: Vec<&str> = metrics.flow_ratio.rows().map(|(key, _)| key).collect();
        assert_eq!(rows, [SUMMARY_KEY]);
    }

    #[test]
    fn test_rows_are_sorted_with_summary_last() {
        let prs = [summary(1, at(9, 0), None), summary(2, at(2, 0), None), summary(3, at(5, 0), None)];
        let metrics = aggregate(window(1, 31), prs.iter().map(|pr| (pr, None)));

        let rows: Vec<&str> = metrics.flow_ratio.rows().map(|(key, _)| key).collect();
        assert_eq!(rows, ["2024-01-02", "2024-01-05", "2024-01-09", SUMMARY_KEY]);
    }

    #[test]
    fn test_serialization_contract() {
        let prs = [merged(2, 1)];
        let details = [detail(&prs[0], 1)];
        let metrics = aggregate(window(1, 5), prs.iter().zip(details.iter().map(Some)));

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["total"]["lead_time"], 3600);
        assert_eq!(json["average"]["lead_time"], 3600.0);
        assert_eq!(json["flow_ratio"]["summary"]["ratio"], "1.00");
        assert_eq!(json["details"][0]["number"], 2);
    }
}
