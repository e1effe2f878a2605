//! The download worker: single-flight scheduling on top of [`DownloadQueue`].
//!
//! Jobs run strictly one at a time. Every public operation takes the queue
//! lock briefly and never awaits while holding it; the runner owns all the
//! per-job state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::download_queue::{ActiveJob, DownloadQueue, Job, JobId, PausedJobs};
use crate::error::{DownloaderError, Result};
use crate::events::{DownloadEvent, EventBus};

use super::events::emit_job_failed;
use super::settings::{BackendCommand, WorkerSettings, build_command, load_backend_config, validate_quality, validate_url};
use super::state::{JobFlags, JobState, Outcome};
use super::subprocess::{JobRunner, PauseHook, RunResult};

struct WorkerInner {
    queue: Mutex<DownloadQueue>,
    events: EventBus,
    settings: WorkerSettings,
    runtime: Handle,
    next_id: AtomicU64,
}

/// Handle to the download worker. Cheap to clone.
#[derive(Clone)]
pub struct DownloadWorker {
    inner: Arc<WorkerInner>,
}

/// What `cancel_job` found.
enum CancelTarget {
    Running,
    Queued,
    Missing,
}

impl DownloadWorker {
    /// Create a worker bound to the current tokio runtime.
    pub fn new(settings: WorkerSettings, events: EventBus) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| DownloaderError::no_runtime(format!("DownloadWorker needs a tokio runtime: {}", e)))?;

        Ok(Self {
            inner: Arc::new(WorkerInner {
                queue: Mutex::new(DownloadQueue::new()),
                events,
                settings,
                runtime,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Run `f` with exclusive access to the queue.
    ///
    /// A poisoned lock is recovered: queue operations are all single-step,
    /// so a panic elsewhere cannot leave the queue half-updated.
    fn with_queue<T>(&self, f: impl FnOnce(&mut DownloadQueue) -> T) -> T {
        let mut guard: MutexGuard<'_, DownloadQueue> =
            self.inner.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn emit(&self, event: DownloadEvent) {
        self.inner.events.emit(event);
    }

    fn emit_queue_status(&self) {
        let queued = self.queue_len();
        self.emit(DownloadEvent::QueueStatusUpdate { queued });
    }

    /// Mint a fresh job id.
    pub fn next_job_id(&self) -> JobId {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Queue a job and try to start it.
    pub fn add_job_to_queue(&self, job: Job) -> Result<()> {
        validate_url(&job.original_url)?;
        validate_quality(&job.quality)?;

        let job_id = job.job_id;
        self.with_queue(|queue| queue.enqueue(job))?;
        info!(job_id, "Job queued");

        self.emit_queue_status();
        self.process_queue();
        Ok(())
    }

    /// Cancel a running or queued job. Returns whether anything was done.
    ///
    /// A running job is terminated and reports its own `Finished` event; a
    /// queued one is dropped right away with `JobCancelled`.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let target = self.with_queue(|queue| {
            if let Some(active) = queue.current().filter(|a| a.job.job_id == job_id) {
                active.control.terminate();
                CancelTarget::Running
            } else if queue.remove_queued(job_id).is_some() {
                CancelTarget::Queued
            } else {
                CancelTarget::Missing
            }
        });

        match target {
            CancelTarget::Running => {
                info!(job_id, "Terminating running job");
                true
            }
            CancelTarget::Queued => {
                info!(job_id, "Removed queued job");
                self.emit(DownloadEvent::JobCancelled { job_id });
                self.emit_queue_status();
                true
            }
            CancelTarget::Missing => {
                debug!(job_id, "Cancel requested for unknown job");
                false
            }
        }
    }

    /// Stop starting new jobs. An in-flight job keeps running.
    pub fn pause_queue(&self) {
        self.with_queue(DownloadQueue::pause);
        info!("Queue paused");
    }

    pub fn resume_queue(&self) {
        self.with_queue(DownloadQueue::resume);
        info!("Queue resumed");
        self.process_queue();
    }

    /// Put a paused snapshot back in line, in order, and resume.
    ///
    /// Jobs whose id is already queued or running are skipped. Returns the
    /// number of jobs queued.
    pub fn resubmit(&self, jobs: PausedJobs) -> usize {
        let queued = self.with_queue(|queue| {
            queue.resume();
            let mut queued = 0;
            for job in jobs {
                let job_id = job.job_id;
                match queue.enqueue(job) {
                    Ok(()) => queued += 1,
                    Err(e) => warn!(job_id, "Skipping resubmitted job: {}", e),
                }
            }
            queued
        });

        info!(queued, "Resubmitted paused jobs");
        self.emit_queue_status();
        self.process_queue();
        queued
    }

    /// Decryptor failure recovery.
    ///
    /// Pauses the queue, tears the running job down and hands every job
    /// that was running or queued to the embedding layer in one snapshot.
    /// The queue is empty and idle afterwards.
    pub fn handle_pause_request(&self, job_id: JobId) {
        let (jobs, control) = self.with_queue(DownloadQueue::pause_and_snapshot);

        if let Some(control) = control {
            control.terminate();
        }

        warn!(
            job_id,
            paused_jobs = jobs.len(),
            "Decryptor unavailable, queue paused and snapshotted"
        );
        self.emit(DownloadEvent::QueueHasBeenPaused { jobs });
        self.emit(DownloadEvent::QueueStatusUpdate { queued: 0 });
    }

    /// Drop every queued job and terminate the running one.
    ///
    /// Returns the ids acted on, running job first.
    pub fn cancel_all_jobs(&self) -> Vec<JobId> {
        let (running, drained) = self.with_queue(|queue| {
            let running = queue.current().map(|active| {
                active.control.terminate();
                active.job.job_id
            });
            (running, queue.drain_queued())
        });

        for job in &drained {
            self.emit(DownloadEvent::JobCancelled { job_id: job.job_id });
        }
        self.emit(DownloadEvent::QueueStatusUpdate { queued: 0 });

        let ids: Vec<JobId> = running.into_iter().chain(drained.iter().map(|j| j.job_id)).collect();
        info!(?ids, "Cancelled all jobs");
        ids
    }

    pub fn is_paused(&self) -> bool {
        self.with_queue(|queue| queue.is_paused())
    }

    /// Number of waiting jobs, excluding the running one.
    pub fn queue_len(&self) -> usize {
        self.with_queue(|queue| queue.queue_size())
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        self.with_queue(|queue| queue.current_job_id())
    }

    /// OS pid of the running backend process.
    pub fn current_process_id(&self) -> Option<u32> {
        self.with_queue(|queue| queue.current().and_then(|a| a.control.process_id()))
    }

    /// Start the next job if the slot is free and the queue is not paused.
    fn process_queue(&self) {
        let Some(active) = self.with_queue(DownloadQueue::next_to_start) else {
            return;
        };

        let job_id = active.job.job_id;
        info!(job_id, url = %active.job.original_url, "Starting job");
        self.emit(DownloadEvent::JobStarted { job_id });
        self.emit_queue_status();

        let worker = self.clone();
        self.inner.runtime.spawn(async move {
            let result = worker.dispatch(active).await;

            if result != RunResult::Paused {
                worker.with_queue(|queue| queue.finish(job_id));
            }
            worker.process_queue();
        });
    }

    /// Build and run one job. Never fails: every error becomes a
    /// `Finished { success: false }` event.
    async fn dispatch(&self, active: ActiveJob) -> RunResult {
        let job_id = active.job.job_id;
        let settings = &self.inner.settings;

        let (command, state) = match self.prepare(&active.job) {
            Ok(prepared) => prepared,
            Err(e) => {
                let message = format!("Failed: {}", e);
                emit_job_failed(&self.inner.events, job_id, &message, Vec::new());
                return RunResult::Finished(Outcome::Failed { message });
            }
        };

        let worker = self.clone();
        let on_pause: PauseHook = Arc::new(move |job_id| worker.handle_pause_request(job_id));

        let runner = JobRunner::new(
            command,
            settings.working_dir.clone(),
            state,
            active.control,
            self.inner.events.clone(),
            on_pause,
            settings.drain_timeout(),
            settings.backend_log_path.clone(),
        );

        match tokio::spawn(runner.run()).await {
            Ok(result) => result,
            Err(e) => {
                let err = DownloaderError::job(job_id, format!("runner task aborted: {}", e));
                let message = format!("Failed: {}", err);
                emit_job_failed(&self.inner.events, job_id, &message, Vec::new());
                RunResult::Finished(Outcome::Failed { message })
            }
        }
    }

    /// Resolve everything a run needs at dispatch time, so config edits
    /// made while a job waited in the queue take effect.
    fn prepare(&self, job: &Job) -> Result<(BackendCommand, JobState)> {
        let settings = &self.inner.settings;

        let config = load_backend_config(&settings.config_path)?;
        let command = build_command(settings, job, &config);

        let flags = JobFlags::from_job(job);
        let total_tracks = if flags.is_mv || flags.is_single_song {
            1
        } else {
            job.media_data.track_count()?
        };

        debug!(job_id = job.job_id, ?flags, total_tracks, argv = ?command.argv(), "Prepared job");
        Ok((command, JobState::new(job.job_id, flags, total_tracks, settings.emit_interval())))
    }
}
