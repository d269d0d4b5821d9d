use std::{error::Error, time::Duration};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs `task` every `period` until `cancel` fires. A task error is logged
/// and the loop keeps going; a sweep that fails once shouldn't stop future
/// sweeps from running.
pub fn run_periodically<F, E, Fut>(task: F, period: Duration, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + 'static,
    E: Error,
    Fut: Future<Output = Result<(), E>> + Send,
{
    tokio::spawn(async move {
        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("periodic task cancelled");
                    return;
                }
                _ = tokio::time::sleep(period) => {
                    if let Err(err) = task().await {
                        error!(error = %err, "periodic task failed");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug)]
    struct NeverError;

    impl std::fmt::Display for NeverError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "never")
        }
    }
    impl Error for NeverError {}

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = count.clone();
        run_periodically::<_, NeverError, _>(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::advance(Duration::from_millis(35)).await;
        cancel.cancel();
        tokio::time::advance(Duration::from_millis(50)).await;

        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
