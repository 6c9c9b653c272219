//! The periodic dispatch tick.

use std::hash::Hash;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::coordinator::Coordinator;

/// Drive [`Coordinator::dispatch`] on a fixed interval until shutdown is
/// signalled or the coordinator is dropped.
///
/// Holds only a weak reference so an abandoned coordinator can drop; the
/// watch sender going away counts as shutdown too.
pub(crate) async fn run<K, V>(
    coordinator: Weak<Coordinator<K, V>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    debug!(interval_secs = interval.as_secs(), "scheduler starting");
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = sleep(interval) => {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.dispatch().await;
            }
        }
    }
    debug!("scheduler stopped");
}
