//! Periodic purge of expired status records.
//!
//! Terminal records older than the table's TTL are dropped on a fixed
//! interval using `tokio::time::interval`. Queued and processing records
//! are never touched.

use std::sync::Arc;
use std::time::Duration;

use meshgen_pipeline::status_table::StatusTable;
use tokio_util::sync::CancellationToken;

/// How often the purge runs.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Run the status retention loop until `cancel` is triggered.
pub async fn run(table: Arc<StatusTable>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Status retention job started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Status retention job stopping");
                break;
            }
            _ = ticker.tick() => {
                let purged = table.purge_expired().await;
                if purged > 0 {
                    tracing::info!(purged, "Status retention: purged expired records");
                } else {
                    tracing::debug!("Status retention: nothing to purge");
                }
            }
        }
    }
}
