use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};

use crate::db::{execute_async, now_secs, DbPool};
use crate::services::node_registry;

/// Background sweep that flips nodes to `offline` once their last report is
/// older than the liveness window. Administrative statuses are never touched.
pub async fn heartbeat_monitor(pool: DbPool, interval: Duration, window: Duration) -> Result<()> {
    info!(
        "Starting liveness sweep (interval {:?}, window {:?})",
        interval, window
    );
    let window_secs = window.as_secs() as i64;

    loop {
        tokio::time::sleep(interval).await;

        match sweep(&pool, window_secs).await {
            Ok(count) if count > 0 => {
                info!("Marked {} node(s) offline due to missing heartbeat", count);
            }
            Err(e) => {
                error!("Liveness sweep error: {}", e);
            }
            _ => {}
        }
    }
}

async fn sweep(pool: &DbPool, window_secs: i64) -> Result<usize> {
    let now = now_secs();
    execute_async(pool, move |conn| {
        node_registry::mark_stale_nodes(conn, now, window_secs)
    })
    .await
}
