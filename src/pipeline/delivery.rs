//! Delivery context: the serial executor for user callbacks.
//!
//! Progress, preview, and completion callbacks never run on the
//! orchestrator context. They are boxed and sent here, preserving
//! per-session scheduling order; each job re-checks its task's cancelled
//! flag before invoking anything, so a prompt cancel suppresses callbacks
//! that were already queued.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A user callback, ready to run.
pub(crate) type DeliveryJob = Box<dyn FnOnce() + Send>;

/// Spawns the delivery actor and returns its submission handle.
pub(crate) fn spawn(shutdown: CancellationToken) -> mpsc::UnboundedSender<DeliveryJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<DeliveryJob>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job(),
                    None => break,
                },
            }
        }
    });
    tx
}
