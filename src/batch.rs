//! Rate-limit-aware batch execution.
//!
//! Upstream enforces a fixed-window request limit, so fetches run in
//! contiguous groups: full cooperative concurrency inside a group, a pause
//! between groups, and strict sequencing across groups (group k+1 does not
//! start until group k has fully settled). Group size times groups per
//! window must stay under the upstream limit.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;

/// Run `f` over `items` in groups of `batch_size` with `delay` between
/// groups (not after the last). Output order matches input order regardless
/// of completion order within a group.
///
/// A single item's failure must not abort its group: `f` is expected to
/// catch its own errors and return a sentinel (`None`, a default, ...) so
/// aggregation stays failure-agnostic.
pub async fn run_batched<T, R, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    delay: Duration,
    f: F,
) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let batch_size = batch_size.max(1);
    let mut results = Vec::with_capacity(items.len());

    let mut iter = items.into_iter().peekable();
    let mut first = true;
    while iter.peek().is_some() {
        if !first && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        first = false;

        let group: Vec<T> = iter.by_ref().take(batch_size).collect();
        log::debug!("batch: running group of {}", group.len());
        let settled = join_all(group.into_iter().map(&f)).await;
        results.extend(settled);
    }

    results
}
