use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};

use crate::ItemOutcome;

/// Runs `task` over `items` with at most `workers` in flight.
///
/// Outcomes come back in completion order, tagged with the index they were
/// submitted with. A task that panics is logged and has no outcome.
pub async fn run_bounded<I, T, E, F, Fut>(
    items: Vec<(usize, I)>,
    workers: usize,
    task: F,
) -> Vec<ItemOutcome<T, E>>
where
    I: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let task = Arc::new(task);
    let mut set = JoinSet::new();
    for (reading_index, item) in items {
        let semaphore = semaphore.clone();
        let task = task.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            ItemOutcome {
                reading_index,
                result: (*task)(item).await,
            }
        });
    }

    let total = set.len();
    let mut outcomes = Vec::with_capacity(total);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => log::error!("Worker task failed: {err}"),
        }
        log::debug!(
            "Progress: {:.1}% ({}/{total})",
            (total - set.len()) as f32 / total as f32 * 100.0,
            total - set.len()
        );
    }
    outcomes
}
