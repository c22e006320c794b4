// backuptool/src/utils/pool.rs
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// What a bounded pool run produced.
#[derive(Debug)]
pub(crate) struct PoolOutcome<I, T> {
    pub completed: Vec<T>,
    /// Items never started because cancellation was observed first.
    pub skipped: Vec<I>,
    /// Tasks that panicked; their item is lost with them.
    pub panicked: usize,
}

/// Runs `work` for every item with at most `size` in flight.
///
/// Cancellation is checked before each item is started; items already running
/// are always awaited.
pub(crate) async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    size: usize,
    cancel: &CancellationToken,
    work: F,
) -> PoolOutcome<I, T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(size.max(1)));
    let mut tasks = JoinSet::new();
    let mut skipped = Vec::new();
    let mut pending = items.into_iter();

    while let Some(item) = pending.next() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            skipped.push(item);
            skipped.extend(pending.by_ref());
            break;
        };
        let fut = work(item);
        tasks.spawn(async move {
            let out = fut.await;
            drop(permit);
            out
        });
    }

    let mut completed = Vec::new();
    let mut panicked = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(out) => completed.push(out),
            Err(e) => {
                error!(error = %e, "worker task failed");
                panicked += 1;
            }
        }
    }

    PoolOutcome {
        completed,
        skipped,
        panicked,
    }
}
