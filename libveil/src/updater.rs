use crate::engine::FolderEngine;
use crate::error::VeilResult;
use std::sync::Arc;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Long-lived task: registers with the metadata server for new merged
/// revisions and applies them as they arrive. Registration failures back
/// off exponentially; application failures are logged and retried on the
/// next signal.
pub(crate) async fn run(engine: Arc<FolderEngine>) {
    let shutdown = engine.shutdown_token().clone();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match register_and_wait(&engine).await {
            Ok(true) => {
                backoff = INITIAL_BACKOFF;
                let before = *engine.head_rev_receiver().borrow();
                if engine.updates_enabled() {
                    if let Err(err) = engine.handle_incoming_updates().await {
                        warn!("failed to apply incoming updates: {}", err);
                    }
                }
                let after = *engine.head_rev_receiver().borrow();
                if after == before {
                    // paused, dirty or errored: do not spin against a
                    // server that will re-signal immediately
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    }
                }
            }
            Ok(false) => return,
            Err(err) => {
                debug!("update registration failed, backing off {:?}: {}", backoff, err);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Ok(true) on a signal, Ok(false) on shutdown.
async fn register_and_wait(engine: &Arc<FolderEngine>) -> VeilResult<bool> {
    let (head, _branch, _staged) = engine.head_snapshot().await;
    let signal = engine
        .config()
        .mdserver()
        .register_for_update(engine.tlf(), head.md.revision)
        .await?;
    tokio::select! {
        _ = engine.shutdown_token().cancelled() => Ok(false),
        // sender loss counts as a signal so the loop re-registers
        _ = signal => Ok(true),
    }
}
