use crate::engine::FolderEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const BACKGROUND_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Long-lived task: every ten seconds, or immediately when an oversized
/// write signals for room, syncs every dirty file.
pub(crate) async fn run(engine: Arc<FolderEngine>, mut force_rx: mpsc::Receiver<()>) {
    let shutdown = engine.shutdown_token().clone();
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
            forced = force_rx.recv() => {
                if forced.is_none() {
                    return;
                }
            }
        }

        for node in engine.dirty_nodes().await {
            match tokio::time::timeout(BACKGROUND_SYNC_TIMEOUT, engine.sync(node)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("background sync of {:?} failed: {}", node, err),
                Err(_) => debug!("background sync of {:?} timed out; will retry", node),
            }
        }
    }
}
