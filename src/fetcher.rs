//! Page-by-page retrieval of upstream lists.
//!
//! `paginate` turns a "fetch page N" function into a lazy stream of pages. The
//! stream ends on an empty page or after a short page (fewer items than the page
//! size). It never inspects the items: callers that want to stop early (e.g. once
//! the date-ordered feed passes the start of the window) simply stop polling.

use crate::error::{MetricsError, Result};
use crate::github::{
    PullRequestQuery, PullRequestSource, PullRequestSummary, Release, ReleaseSource,
};
use futures::stream::{self, Stream};
use std::future::Future;

/// Streams pages `1, 2, 3, ...` produced by `fetch_page` until the feed is exhausted.
///
/// An error is yielded once and ends the stream.
pub fn paginate<T, F, Fut>(page_size: u8, fetch_page: F) -> impl Stream<Item = Result<Vec<T>>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    stream::try_unfold(
        (Some(1u32), fetch_page),
        move |(page, mut fetch_page)| async move {
            let Some(page) = page else {
                return Ok::<_, MetricsError>(None);
            };

            let items = fetch_page(page).await?;
            if items.is_empty() {
                tracing::debug!(page, "Retrieved empty page");
                return Ok(None);
            }

            let next = (items.len() >= usize::from(page_size)).then(|| page + 1);
            Ok(Some((items, (next, fetch_page))))
        },
    )
}

/// Pages of pull requests matching `query`, newest first.
pub fn pull_request_pages<'a, S>(
    source: &'a S,
    query: &'a PullRequestQuery,
) -> impl Stream<Item = Result<Vec<PullRequestSummary>>> + 'a
where
    S: PullRequestSource + ?Sized,
{
    paginate(query.page_size, move |page| {
        source.pull_requests_page(query, page)
    })
}

pub fn release_pages<'a, S>(
    source: &'a S,
    owner: &'a str,
    repo: &'a str,
    page_size: u8,
) -> impl Stream<Item = Result<Vec<Release>>> + 'a
where
    S: ReleaseSource + ?Sized,
{
    paginate(page_size, move |page| {
        source.releases_page(owner, repo, page_size, page)
    })
}
