use std::future::Future;

use anyhow::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A background worker fed through a bounded channel. Producers hold a
/// sender and never wait on the worker; the worker stops when the
/// cancellation token fires or every sender is gone.
pub trait AsyncService<T>: Sized + Send + 'static
where
    T: Send + 'static,
{
    /// Used as the `service` field of every log line
    const NAME: &'static str;

    fn get_sender(&self) -> mpsc::Sender<T>;
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<T>>;

    fn handle_task(&self, task: T) -> impl Future<Output = Result<()>> + Send;

    fn handle_failure(&self, error: Error) {
        warn!(service = Self::NAME, "Task failed: {error:#}");
    }

    fn run(mut self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(mut receiver) = self.take_receiver() else {
                error!(service = Self::NAME, "Service was already started, not running it twice");
                return;
            };

            loop {
                let task = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    task = receiver.recv() => task,
                };

                let Some(task) = task else {
                    warn!(service = Self::NAME, "All senders dropped");
                    break;
                };
                if let Err(e) = self.handle_task(task).await {
                    self.handle_failure(e);
                }
            }

            receiver.close();
            let dropped = receiver.len();
            if dropped > 0 {
                warn!(service = Self::NAME, dropped, "Dropping queued tasks on shutdown");
            }
            info!(service = Self::NAME, "Service shut down");
        })
    }
}
