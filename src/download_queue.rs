/// Download Queue
///
/// FIFO of pending jobs plus the single in-flight slot.
/// At most one job runs at a time; the backend and the local decryptor
/// cannot serve parallel downloads.
use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::downloader::JobControl;
use crate::error::DownloaderError;

pub type JobId = u64;

/// Catalog metadata for the requested album, playlist, song or music video.
///
/// Kept as the raw catalog JSON tree; only the handful of fields the queue
/// needs are read out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaData(pub Value);

/// Catalog resource type of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Album,
    Playlist,
    Song,
    MusicVideo,
    Other,
}

impl MediaData {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn kind(&self) -> MediaKind {
        let raw = self
            .0
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| self.0.pointer("/attributes/playParams/kind").and_then(Value::as_str))
            .unwrap_or_default();

        match raw {
            "albums" | "album" => MediaKind::Album,
            "playlists" | "playlist" => MediaKind::Playlist,
            "songs" | "song" => MediaKind::Song,
            "music-videos" | "musicVideo" | "music-video" => MediaKind::MusicVideo,
            _ => MediaKind::Other,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.0
            .pointer("/attributes/name")
            .or_else(|| self.0.get("name"))
            .and_then(Value::as_str)
    }

    /// Number of tracks the job is expected to produce.
    ///
    /// Songs and music videos are always one track. Collections use the
    /// embedded track list when present, else the catalog's `trackCount`.
    pub fn track_count(&self) -> Result<usize, DownloaderError> {
        match self.kind() {
            MediaKind::Song | MediaKind::MusicVideo => return Ok(1),
            _ => {}
        }

        let listed = self
            .0
            .pointer("/relationships/tracks/data")
            .and_then(Value::as_array)
            .map(Vec::len)
            .filter(|n| *n > 0);
        let declared = self
            .0
            .pointer("/attributes/trackCount")
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        match listed.or(declared) {
            Some(n) if n > 0 => Ok(n),
            _ => Err(DownloaderError::invalid_media(format!(
                "'{}' has no tracks",
                self.name().unwrap_or("untitled")
            ))),
        }
    }
}

/// One user-requested download unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub media_data: MediaData,
    pub quality: String,
    pub original_url: String,
}

impl Job {
    pub fn new(job_id: JobId, media_data: MediaData, quality: impl Into<String>, original_url: impl Into<String>) -> Self {
        Self {
            job_id,
            media_data,
            quality: quality.into(),
            original_url: original_url.into(),
        }
    }
}

/// Ordered snapshot of every job that was running or queued when the queue
/// paused itself. The running job comes first.
pub type PausedJobs = Vec<Job>;

/// The job currently owned by a runner.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job: Job,
    pub control: Arc<JobControl>,
}

/// Download Queue
#[derive(Debug, Default)]
pub struct DownloadQueue {
    /// Queue of pending jobs
    queue: VecDeque<Job>,

    /// In-flight job, if any
    current: Option<ActiveJob>,

    /// Paused queues never start new jobs
    paused: bool,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the back of the queue
    pub fn enqueue(&mut self, job: Job) -> Result<(), DownloaderError> {
        if self.queue.iter().any(|j| j.job_id == job.job_id) {
            return Err(DownloaderError::queue_duplicate(format!("Job {} already queued", job.job_id)));
        }
        if self.current_job_id() == Some(job.job_id) {
            return Err(DownloaderError::queue_duplicate(format!("Job {} already running", job.job_id)));
        }

        self.queue.push_back(job);
        Ok(())
    }

    /// Pop the next job and mark it in flight, if the slot is free and the
    /// queue is not paused.
    pub fn next_to_start(&mut self) -> Option<ActiveJob> {
        if self.paused || self.current.is_some() {
            return None;
        }

        let job = self.queue.pop_front()?;
        let active = ActiveJob {
            job,
            control: Arc::new(JobControl::new()),
        };
        self.current = Some(active.clone());
        Some(active)
    }

    /// Release the in-flight slot if it still belongs to `job_id`.
    ///
    /// A pause may already have reset the slot (and a resumed job may own it
    /// by now), so a stale runner finishing late must not clear it.
    pub fn finish(&mut self, job_id: JobId) -> bool {
        if self.current_job_id() == Some(job_id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Remove a queued (not running) job.
    pub fn remove_queued(&mut self, job_id: JobId) -> Option<Job> {
        let pos = self.queue.iter().position(|j| j.job_id == job_id)?;
        self.queue.remove(pos)
    }

    /// Drain every queued job, leaving the in-flight slot untouched.
    pub fn drain_queued(&mut self) -> Vec<Job> {
        self.queue.drain(..).collect()
    }

    /// Pause the queue, capture `[current, queued...]` and reset to idle.
    ///
    /// Every job that was running or queued appears exactly once in the
    /// returned snapshot, and the queue is empty afterwards. The returned
    /// control (if any) belongs to the job that must be torn down.
    pub fn pause_and_snapshot(&mut self) -> (PausedJobs, Option<Arc<JobControl>>) {
        self.paused = true;

        let mut snapshot = Vec::with_capacity(self.queue.len() + 1);
        let control = self.current.take().map(|active| {
            snapshot.push(active.job);
            active.control
        });
        snapshot.extend(self.queue.drain(..));

        (snapshot, control)
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&ActiveJob> {
        self.current.as_ref()
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        self.current.as_ref().map(|a| a.job.job_id)
    }

    /// Get current queue size (excluding the in-flight job)
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }
}
