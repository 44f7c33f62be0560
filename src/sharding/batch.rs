//! Greedy batch dispatch across shards
//!
//! Chunks are handed to whichever worker is idle. When none is, the
//! dispatcher waits for any in-flight chunk to finish and reuses that
//! worker, so fast shards take more chunks than slow ones and there are
//! never more chunks in flight than workers.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::future::Future;

use crate::error::{ShardError, ShardResult};

/// Split items into chunks of at most `chunk_size`, preserving order
pub fn chunk_items<T>(items: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(chunk_size).collect());
    }
    chunks
}

/// Run every chunk on some worker; results come back in chunk order
///
/// `run` gets a worker and a chunk and must hand the worker back with its
/// result. The first failure is returned immediately. Chunks already
/// accepted by a worker are not rolled back.
pub async fn dispatch_greedy<'a, W, C, R, F, Fut>(
    workers: Vec<W>,
    chunks: Vec<C>,
    run: F,
) -> ShardResult<Vec<R>>
where
    W: Send + 'a,
    R: Send + 'a,
    F: Fn(W, C) -> Fut,
    Fut: Future<Output = (W, ShardResult<R>)> + Send + 'a,
{
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    if workers.is_empty() {
        return Err(ShardError::Initializing(
            "no shards available for dispatch".to_string(),
        ));
    }

    let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None)
        .take(chunks.len())
        .collect();
    let mut idle: VecDeque<W> = workers.into();
    let mut in_flight: FuturesUnordered<BoxFuture<'a, (W, usize, ShardResult<R>)>> =
        FuturesUnordered::new();

    for (index, chunk) in chunks.into_iter().enumerate() {
        let worker = match idle.pop_front() {
            Some(worker) => worker,
            None => {
                let (worker, done, result) = in_flight.next().await.ok_or_else(|| {
                    ShardError::Internal("no idle worker and nothing in flight".to_string())
                })?;
                results[done] = Some(result?);
                worker
            }
        };
        let pending = run(worker, chunk);
        in_flight.push(
            async move {
                let (worker, result) = pending.await;
                (worker, index, result)
            }
            .boxed(),
        );
    }

    while let Some((_, done, result)) = in_flight.next().await {
        results[done] = Some(result?);
    }

    results
        .into_iter()
        .enumerate()
        .map(|(index, r)| {
            r.ok_or_else(|| ShardError::Internal(format!("chunk {} produced no result", index)))
        })
        .collect()
}
