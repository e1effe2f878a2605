//! Single-flight download queue for the Apple Music downloader backend.
//!
//! [`DownloadWorker`] runs queued jobs one at a time, turns the backend's
//! output into weighted progress updates and reports everything through
//! [`DownloadEvent`]s on an [`EventBus`].

pub mod download_queue;
pub mod downloader;
pub mod error;
pub mod events;
pub mod logging;

pub use download_queue::{Job, JobId, MediaData, PausedJobs};
pub use downloader::{DownloadWorker, WorkerSettings};
pub use error::{DownloaderError, ErrorCode, Result};
pub use events::{DownloadEvent, EventBus};
pub use logging::init_logging;
