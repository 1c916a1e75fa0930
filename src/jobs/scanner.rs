//! Library scanner job

use std::sync::Arc;

use anyhow::Result;

use crate::services::ScannerService;

/// Run a full library scan
pub async fn run_scan(scanner: Arc<ScannerService>) -> Result<()> {
    let summary = scanner.scan().await?;
    tracing::info!(
        added = summary.added,
        updated = summary.updated,
        removed = summary.removed,
        queued = summary.thumbnails_queued,
        "Scheduled library scan completed"
    );
    Ok(())
}
