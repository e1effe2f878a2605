//! Centralized event names and payloads emitted to the embedding layer.
//! Keep the names in sync with whatever frontend consumes them.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::download_queue::{Job, JobId};

pub const EVT_FETCHING_STARTED: &str = "fetching-started";
pub const EVT_DOWNLOAD_PROGRESS: &str = "download-progress";
pub const EVT_TRACK_SKIPPED: &str = "track-skipped";
pub const EVT_STREAM_LABEL: &str = "stream-label";
pub const EVT_ERROR_LINE: &str = "error-line";
pub const EVT_DOWNLOAD_FINISHED: &str = "download-finished";
pub const EVT_PAUSE_QUEUE_REQUESTED: &str = "pause-queue-requested";
pub const EVT_QUEUE_STATUS: &str = "queue-status-update";
pub const EVT_JOB_CANCELLED: &str = "job-cancelled";
pub const EVT_JOB_STARTED: &str = "job-started";
pub const EVT_QUEUE_PAUSED: &str = "queue-has-been-paused";

/// Everything the queue tells the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DownloadEvent {
    FetchingStarted {
        job_id: JobId,
    },
    Progress {
        job_id: JobId,
        status: String,
        track_percent: f64,
        overall_percent: f64,
    },
    TrackSkipped {
        job_id: JobId,
        name: String,
    },
    StreamLabel {
        job_id: JobId,
        text: String,
    },
    ErrorLine {
        job_id: JobId,
        text: String,
    },
    Finished {
        job_id: JobId,
        success: bool,
        message: String,
        skipped_tracks: Vec<String>,
    },
    PauseQueueRequested {
        job_id: JobId,
    },
    QueueStatusUpdate {
        queued: usize,
    },
    JobCancelled {
        job_id: JobId,
    },
    JobStarted {
        job_id: JobId,
    },
    QueueHasBeenPaused {
        jobs: Vec<Job>,
    },
}

impl DownloadEvent {
    /// Wire name of this event.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FetchingStarted { .. } => EVT_FETCHING_STARTED,
            Self::Progress { .. } => EVT_DOWNLOAD_PROGRESS,
            Self::TrackSkipped { .. } => EVT_TRACK_SKIPPED,
            Self::StreamLabel { .. } => EVT_STREAM_LABEL,
            Self::ErrorLine { .. } => EVT_ERROR_LINE,
            Self::Finished { .. } => EVT_DOWNLOAD_FINISHED,
            Self::PauseQueueRequested { .. } => EVT_PAUSE_QUEUE_REQUESTED,
            Self::QueueStatusUpdate { .. } => EVT_QUEUE_STATUS,
            Self::JobCancelled { .. } => EVT_JOB_CANCELLED,
            Self::JobStarted { .. } => EVT_JOB_STARTED,
            Self::QueueHasBeenPaused { .. } => EVT_QUEUE_PAUSED,
        }
    }
}

/// Sending half handed to the worker and every runner.
///
/// Emission is fire-and-forget: a consumer that went away is logged, never
/// propagated into the download flow.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl EventBus {
    /// Create a bus together with the receiver the embedding layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: DownloadEvent) {
        let name = event.name();
        if let Err(e) = self.tx.send(event) {
            warn!(event = name, "Failed to emit {}: receiver dropped ({})", name, e);
        }
    }
}
