//! Release counts over a window, the created-to-published ratio and the
//! commits between two release tags.

use crate::error::Result;
use crate::fetcher::release_pages;
use crate::github::{validate_reference, Commit, Release, ReleaseSource};
use crate::sprint::DayBuckets;
use crate::window::DateWindow;
use futures::TryStreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plain semantic version tags, e.g. `v1.2.3`.
pub const DEFAULT_VERSION_PATTERN: &str = r"^v\d+\.\d+\.\d+$";

/// Which release tags take part in a report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagFilter {
    #[default]
    Any,
    /// Only `vX.Y.Z` tags.
    Default,
    /// Only `vX.Y.Z-<initials>` tags with exactly this many initials; one
    /// report per initials suffix.
    ServiceInitials(usize),
}

impl TagFilter {
    pub fn from_flags(default_pattern: bool, service_initials: Option<usize>) -> Self {
        match service_initials.filter(|n| *n > 0) {
            Some(n) => Self::ServiceInitials(n),
            None if default_pattern => Self::Default,
            None => Self::Any,
        }
    }

    pub fn compile(self) -> Result<TagMatcher> {
        let pattern = match self {
            Self::Any => None,
            Self::Default => Some(Regex::new(DEFAULT_VERSION_PATTERN)?),
            Self::ServiceInitials(n) => Some(Regex::new(&format!(
                r"^v\d+\.\d+\.\d+-(?P<service>\w{{{n}}})$"
            ))?),
        };
        Ok(TagMatcher {
            pattern,
            grouped: matches!(self, Self::ServiceInitials(_)),
        })
    }
}

#[derive(Clone, Debug)]
pub struct TagMatcher {
    pattern: Option<Regex>,
    grouped: bool,
}

impl TagMatcher {
    /// The report group of `tag`, or `None` when the tag is filtered out.
    ///
    /// Ungrouped matchers put every accepted tag in the `""` group.
    pub fn group_of<'t>(&self, tag: &'t str) -> Option<&'t str> {
        let Some(pattern) = &self.pattern else {
            return Some("");
        };
        let captures = pattern.captures(tag)?;
        if !self.grouped {
            return Some("");
        }
        captures.name("service").map(|m| m.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReleaseReport {
    pub draft: u64,
    pub pre_release: u64,
    pub created: u64,
    pub published: u64,
    pub created_to_published_ratio: f64,
}

impl ReleaseReport {
    fn record(&mut self, release: &Release, window: &DateWindow) {
        if release.draft {
            self.draft += 1;
        }
        if release.prerelease {
            self.pre_release += 1;
        }
        if window.contains(release.created_at) {
            self.created += 1;
        }
        if window.contains_opt(release.published_at) {
            self.published += 1;
        }
    }

    fn finish(mut self) -> Self {
        self.created_to_published_ratio = created_to_published_ratio(self.created, self.published);
        self
    }
}

/// `created / published` rounded to two decimals, or `created` when nothing was published.
pub fn created_to_published_ratio(created: u64, published: u64) -> f64 {
    if published == 0 {
        return created as f64;
    }
    ((created as f64 / published as f64) * 100.0).round() / 100.0
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReports {
    All(ReleaseReport),
    /// Keyed by service initials, in ascending order.
    ByService(BTreeMap<String, ReleaseReport>),
}

/// Counts `releases` against `window`, skipping tags the matcher rejects.
pub fn build_report<'a, I>(window: &DateWindow, releases: I, matcher: &TagMatcher) -> ReleaseReports
where
    I: IntoIterator<Item = &'a Release>,
{
    let mut groups: BTreeMap<String, ReleaseReport> = BTreeMap::new();
    for release in releases {
        let Some(group) = matcher.group_of(&release.tag_name) else {
            continue;
        };
        groups
            .entry(group.to_string())
            .or_default()
            .record(release, window);
    }

    if matcher.grouped {
        ReleaseReports::ByService(
            groups
                .into_iter()
                .map(|(service, report)| (service, report.finish()))
                .collect(),
        )
    } else {
        ReleaseReports::All(groups.remove("").unwrap_or_default().finish())
    }
}

/// Scans the newest-first release feed for releases created or published in `window`.
///
/// The scan stops after a page holding a release that was both created and
/// published (or never published) before the window start.
pub async fn scan_releases<S>(
    source: &S,
    owner: &str,
    repo: &str,
    page_size: u8,
    window: &DateWindow,
) -> Result<Vec<Release>>
where
    S: ReleaseSource + ?Sized,
{
    let mut pages = std::pin::pin!(release_pages(source, owner, repo, page_size));
    let mut kept = Vec::new();

    while let Some(page) = pages.try_next().await? {
        let mut passed_start = false;
        for release in page {
            if window.contains(release.created_at) || window.contains_opt(release.published_at) {
                kept.push(release);
                continue;
            }
            if release.created_at < window.start
                && release.published_at.map_or(true, |at| at < window.start)
            {
                passed_start = true;
            }
        }
        if passed_start {
            break;
        }
    }

    tracing::debug!(owner, repo, releases = kept.len(), "Collected releases in window");
    Ok(kept)
}

/// Releases bucketed by creation day when created within `range`, otherwise
/// by publication day when published within it.
pub fn bucket_releases<I>(releases: I, range: &DateWindow) -> DayBuckets<Release>
where
    I: IntoIterator<Item = Release>,
{
    let mut buckets = DayBuckets::new();
    for release in releases {
        if range.contains(release.created_at) {
            buckets.insert(release.created_at, release);
        } else if let Some(published_at) = release.published_at.filter(|at| range.contains(*at)) {
            buckets.insert(published_at, release);
        }
    }
    buckets
}

/// Reference compared against when no end tag is given.
pub const DEFAULT_HEAD: &str = "HEAD";

/// Commits on `head` (default `HEAD`) that are not on `base`, oldest first.
pub async fn commits_between<S>(
    source: &S,
    owner: &str,
    repo: &str,
    base: &str,
    head: Option<&str>,
) -> Result<Vec<Commit>>
where
    S: ReleaseSource + ?Sized,
{
    let base = validate_reference(base)?;
    let head = validate_reference(head.filter(|h| !h.trim().is_empty()).unwrap_or(DEFAULT_HEAD))?;

    let commits = source.compare_commits(owner, repo, base, head).await?;
    tracing::debug!(owner, repo, base, head, commits = commits.len(), "Compared references");
    Ok(commits)
}
