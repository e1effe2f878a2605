//! Event emission helpers for the download system.
//!
//! Failures reach the embedding application the same way from every layer
//! (spawn errors, dispatch errors, non-zero exits): logged, then reported as
//! an unsuccessful `Finished` event.

use tracing::error;

use crate::download_queue::JobId;
use crate::events::{DownloadEvent, EventBus};

/// Log and report a failed job.
pub fn emit_job_failed(events: &EventBus, job_id: JobId, message: &str, skipped_tracks: Vec<String>) {
    error!(job_id, "Download failed: {}", message);

    events.emit(DownloadEvent::Finished {
        job_id,
        success: false,
        message: message.to_string(),
        skipped_tracks,
    });
}
