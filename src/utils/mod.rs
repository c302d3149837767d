use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

use crate::shutdown::Shutdown;

pub mod secret;

/// Spawns a future that will retry on failure with a backoff duration
///
/// The future will retry until it succeeds or a shutdown signal is received.
/// During a shutdown, the task will be immediately cancelled. Panics are
/// caught and treated like failures so a crashing task is restarted instead
/// of taking the process down.
pub fn spawn_with_backoff_cancel_on_shutdown<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    // Run task in background, returning a handle.
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        select! {
            _ = retry_future(
                future_spawner,
                backoff_duration,
                &shutting_down
            ) => {},
            _ = await_shutdown_begin(shutdown, &shutting_down) => {},
        }
    })
}

async fn await_shutdown_begin(shutdown: Shutdown, shutting_down: &AtomicBool) {
    shutdown.await_shutdown_begin().await;
    shutting_down.store(true, Ordering::SeqCst);
}

async fn retry_future<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutting_down: &AtomicBool,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        let future = future_spawner();

        // Wrap in `AssertUnwindSafe` so we can call `FuturesExt::catch_unwind` on it.
        let future = std::panic::AssertUnwindSafe(future);
        let result = future.catch_unwind().await;

        match result {
            // Task succeeded or is shutting down gracefully
            Ok(Ok(t)) => return t,
            Ok(Err(e)) => {
                error!("Task failed: {e:?}");

                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                tokio::time::sleep(backoff_duration).await;
            }
            Err(e) => {
                error!("Task panicked: {e:?}");

                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                tokio::time::sleep(backoff_duration).await;
            }
        }
    }
}
