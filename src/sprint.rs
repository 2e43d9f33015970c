//! Sprint definitions and day-bucketed slicing of fetched items.
//!
//! Items are indexed once by `YYYY-MM-DD` day key; each sprint then walks its
//! own days and gathers what was bucketed there. Sprints may overlap, in which
//! case an item lands in every sprint covering its day.

use crate::enrich::{EnrichmentOutcome, MetricDetail};
use crate::error::Result;
use crate::github::PullRequestSummary;
use crate::metrics::{Aggregator, PullRequestMetrics};
use crate::release::ReleaseReports;
use crate::window::{day_key, DateWindow, DATE_FORMAT};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A numbered, named period. Only sprints with both dates set are reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintWindow {
    pub number: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl SprintWindow {
    /// The sprint's days, start and end inclusive, or `None` if a date is unset.
    pub fn window(&self) -> Option<Result<DateWindow>> {
        let (Some(first), Some(last)) = (self.start_date, self.end_date) else {
            return None;
        };
        Some(DateWindow::from_days(first, last))
    }
}

/// A sprint together with its resolved window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sprint {
    pub definition: SprintWindow,
    pub window: DateWindow,
}

/// Parses a JSON array of sprint definitions.
pub fn parse_sprints(json: &str) -> Result<Vec<SprintWindow>> {
    Ok(serde_json::from_str(json)?)
}

/// Keeps the sprints that have both dates, in input order.
pub fn valid_sprints(definitions: Vec<SprintWindow>) -> Result<Vec<Sprint>> {
    let mut sprints = Vec::with_capacity(definitions.len());
    for definition in definitions {
        match definition.window() {
            Some(window) => sprints.push(Sprint {
                window: window?,
                definition,
            }),
            None => {
                tracing::debug!(number = definition.number, "Ignoring sprint without start or end date");
            }
        }
    }
    Ok(sprints)
}

/// The smallest window covering every sprint.
pub fn fetch_range(sprints: &[Sprint]) -> Option<DateWindow> {
    let start = sprints.iter().map(|s| s.window.start).min()?;
    let end = sprints.iter().map(|s| s.window.end).max()?;
    Some(DateWindow { start, end })
}

/// Items grouped by the UTC day they are attributed to.
#[derive(Clone, Debug)]
pub struct DayBuckets<T> {
    days: BTreeMap<String, Vec<T>>,
}

impl<T> Default for DayBuckets<T> {
    fn default() -> Self {
        Self {
            days: BTreeMap::new(),
        }
    }
}

impl<T> DayBuckets<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, at: DateTime<Utc>, item: T) {
        self.days.entry(day_key(at)).or_default().push(item);
    }

    /// Items of every day touched by `window`, in day order.
    pub fn collect(&self, window: &DateWindow) -> Vec<&T> {
        window
            .days()
            .filter_map(|day| self.days.get(&day.format(DATE_FORMAT).to_string()))
            .flatten()
            .collect()
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.days.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// Pull requests bucketed by creation day.
pub fn bucket_pull_requests<I>(pull_requests: I) -> DayBuckets<PullRequestSummary>
where
    I: IntoIterator<Item = PullRequestSummary>,
{
    let mut buckets = DayBuckets::new();
    for pr in pull_requests {
        buckets.insert(pr.created_at, pr);
    }
    buckets
}

/// Aggregates the pull requests of one sprint from shared enrichment results.
///
/// Failures are only reported for pull requests that belong to this sprint.
pub fn sprint_metrics(
    sprint: &Sprint,
    buckets: &DayBuckets<PullRequestSummary>,
    outcome: &EnrichmentOutcome,
) -> PullRequestMetrics {
    let mut aggregator = Aggregator::new(sprint.window);
    let mut failures = Vec::new();

    for pr in buckets.collect(&sprint.window) {
        let detail: Option<&MetricDetail> = outcome.details.get(&pr.number);
        if aggregator.record(pr, detail) && detail.is_none() {
            failures.extend(outcome.failures.iter().filter(|f| f.number == pr.number).cloned());
        }
    }

    aggregator.finish(failures)
}

/// Report of one sprint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SprintReport {
    pub sprint: SprintWindow,
    pub metrics: PullRequestMetrics,
    pub releases: ReleaseReports,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::tests::{at, summary};
    use crate::enrich::EnrichmentFailure;
    use chrono::Duration;

    fn sprint(number: u32, first: u32, last: u32) -> Sprint {
        let definition = SprintWindow {
            number,
            name: format!("Sprint {number}"),
            start_date: NaiveDate::from_ymd_opt(2024, 1, first),
            end_date: NaiveDate::from_ymd_opt(2024, 1, last),
        };
        Sprint {
            window: definition.window().unwrap().unwrap(),
            definition,
        }
    }

    fn detail(pr: &PullRequestSummary) -> MetricDetail {
        MetricDetail {
            number: pr.number,
            title: pr.title.clone(),
            lead_time: Duration::hours(1),
            time_to_merge: Duration::hours(1),
            created_at: pr.created_at,
            comments: 1,
            review_comments: 0,
            commits: 1,
            additions: 5,
            deletions: 1,
            changed_files: 1,
        }
    }

    #[test]
    fn test_parse_sprints_allows_missing_dates() {
        let sprints = parse_sprints(
            r#"[
                {"number": 1, "name": "One", "start_date": "2024-01-01", "end_date": "2024-01-14"},
                {"number": 2, "name": "Two", "start_date": null, "end_date": "2024-01-28"},
                {"number": 3, "name": "Three"}
            ]"#,
        )
        .unwrap();

        assert_eq!(sprints.len(), 3);
        assert_eq!(sprints[1].start_date, None);

        let valid = valid_sprints(sprints).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].definition.number, 1);
    }

    #[test]
    fn test_parse_sprints_rejects_malformed_json() {
        let err = parse_sprints("[{\"number\": \"one\"}]").unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_fetch_range_spans_all_sprints() {
        let sprints = [sprint(1, 8, 14), sprint(2, 1, 7), sprint(3, 10, 20)];
        let range = fetch_range(&sprints).unwrap();

        assert_eq!(range.start, at(1, 0));
        assert_eq!(range.end, at(21, 0));
        assert_eq!(fetch_range(&[]), None);
    }

    #[test]
    fn test_overlapping_sprints_both_include_pull_request() {
        let prs = vec![
            summary(1, at(3, 10), None),
            summary(2, at(9, 10), None),
            summary(3, at(14, 23), None),
        ];
        let buckets = bucket_pull_requests(prs);
        let sprints = [sprint(1, 1, 9), sprint(2, 9, 14), sprint(3, 15, 20)];

        let numbers: Vec<Vec<u64>> = sprints
            .iter()
            .map(|s| buckets.collect(&s.window).iter().map(|pr| pr.number).collect())
            .collect();

        assert_eq!(numbers, [vec![1, 2], vec![2, 3], vec![]]);
    }

    #[test]
    fn test_sprint_metrics_share_enrichment() {
        let prs = vec![summary(1, at(3, 0), None), summary(2, at(9, 0), None), summary(3, at(10, 0), None)];
        let mut outcome = EnrichmentOutcome::default();
        for pr in &prs[..2] {
            outcome.details.insert(pr.number, detail(pr));
        }
        outcome.failures.push(EnrichmentFailure {
            number: 3,
            reason: "unavailable".to_string(),
        });
        let buckets = bucket_pull_requests(prs);

        let first = sprint_metrics(&sprint(1, 1, 9), &buckets, &outcome);
        let second = sprint_metrics(&sprint(2, 9, 14), &buckets, &outcome);

        assert_eq!(first.count, 2);
        assert_eq!(first.total.additions, 10);
        assert!(first.failures.is_empty());

        assert_eq!(second.count, 1);
        assert_eq!(second.flow_ratio.summary.created, 2);
        assert_eq!(second.failures.len(), 1);
        assert_eq!(second.failures[0].number, 3);
    }

    #[test]
    fn test_day_buckets_len() {
        let mut buckets = DayBuckets::new();
        assert!(buckets.is_empty());
        buckets.insert(at(1, 0), 'a');
        buckets.insert(at(1, 5), 'b');
        buckets.insert(at(2, 0), 'c');

        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets.items().copied().collect::<String>(), "abc");
    }
}
