//! Downloader subprocess management.
//!
//! Spawns the backend, drains stdout and stderr on two reader tasks into one
//! channel, folds every line into the job's [`JobState`], and turns the exit
//! into a terminal outcome.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::download_queue::JobId;
use crate::error::DownloaderError;
use crate::events::{DownloadEvent, EventBus};
use crate::logging::append_backend_log;

use super::events::emit_job_failed;
use super::progress::Stream;
use super::settings::BackendCommand;
use super::state::{Effect, JobState, Outcome};

/// Callback invoked when a runner detects the decryptor is unreachable.
pub type PauseHook = Arc<dyn Fn(JobId) + Send + Sync>;

/// Cross-task signals for one job.
///
/// Both flags are one-shot: once set they stay set.
#[derive(Debug, Default)]
pub struct JobControl {
    terminate: CancellationToken,
    pause_triggered: AtomicBool,
    pid: AtomicU32,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the runner to tear the backend process down.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn was_terminated_intentionally(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn mark_pause_triggered(&self) {
        self.pause_triggered.store(true, Ordering::SeqCst);
    }

    pub fn pause_triggered(&self) -> bool {
        self.pause_triggered.load(Ordering::SeqCst)
    }

    /// OS pid of the live backend process, if one is running.
    pub fn process_id(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn set_process_id(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    async fn terminated(&self) {
        self.terminate.cancelled().await
    }
}

/// How a runner ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// A terminal outcome was reported through `Finished`.
    Finished(Outcome),
    /// Handed over to the pause-and-snapshot flow; nothing was reported.
    Paused,
}

/// One line of backend output.
#[derive(Debug)]
struct OutputLine {
    stream: Stream,
    text: String,
}

/// Owns one backend process for one job.
pub struct JobRunner {
    job_id: JobId,
    command: BackendCommand,
    working_dir: Option<PathBuf>,
    state: JobState,
    control: Arc<JobControl>,
    events: EventBus,
    on_pause: PauseHook,
    drain_timeout: Duration,
    backend_log_path: Option<PathBuf>,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command: BackendCommand,
        working_dir: Option<PathBuf>,
        state: JobState,
        control: Arc<JobControl>,
        events: EventBus,
        on_pause: PauseHook,
        drain_timeout: Duration,
        backend_log_path: Option<PathBuf>,
    ) -> Self {
        Self {
            job_id: state.job_id,
            command,
            working_dir,
            state,
            control,
            events,
            on_pause,
            drain_timeout,
            backend_log_path,
        }
    }

    /// Run the job to completion.
    ///
    /// Every failure is reported as a `Finished` event; nothing propagates
    /// to the caller except the [`RunResult`].
    pub async fn run(mut self) -> RunResult {
        let started = Instant::now();
        self.events.emit(DownloadEvent::FetchingStarted { job_id: self.job_id });
        info!(job_id = self.job_id, argv = ?self.command.argv(), "Starting backend");

        let result = self.run_process(started).await;

        self.control.set_process_id(None);

        match result {
            Ok(RunResult::Paused) => {
                info!(job_id = self.job_id, "Job handed over to pause recovery");
                RunResult::Paused
            }
            Ok(RunResult::Finished(outcome)) => {
                self.finish(&outcome);
                RunResult::Finished(outcome)
            }
            Err(e) => {
                debug!(job_id = self.job_id, code = e.code().as_str(), "Backend run failed: {}", e);
                let outcome = Outcome::Failed {
                    message: format!("Failed: {}", e),
                };
                self.finish(&outcome);
                RunResult::Finished(outcome)
            }
        }
    }

    async fn run_process(&mut self, started: Instant) -> Result<RunResult, DownloaderError> {
        if self.control.was_terminated_intentionally() {
            let outcome = self.state.outcome(None, true, started.elapsed());
            return Ok(RunResult::Finished(outcome));
        }

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(windows)]
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW

        let mut child = cmd
            .spawn()
            .map_err(|e| DownloaderError::spawn(self.command.program.display().to_string(), e))?;
        self.control.set_process_id(child.id());

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(DownloaderError::internal("backend output pipes unavailable"));
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let readers = [
            spawn_reader(stdout, Stream::Stdout, tx.clone(), self.control.clone()),
            spawn_reader(stderr, Stream::Stderr, tx, self.control.clone()),
        ];

        let mut exit_code: Option<i32> = None;
        let mut process_exited = false;
        let mut kill_sent = false;
        let mut output_done = false;
        let mut drain_timed_out = false;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            if process_exited && output_done {
                break;
            }

            tokio::select! {
                _ = self.control.terminated(), if !kill_sent && !process_exited => {
                    kill_sent = true;
                    info!(job_id = self.job_id, "Terminating backend process");
                    if let Err(e) = child.start_kill() {
                        warn!(job_id = self.job_id, "Failed to kill backend process: {}", e);
                    }
                }

                res = child.wait(), if !process_exited => {
                    process_exited = true;
                    drain_deadline = Some(tokio::time::Instant::now() + self.drain_timeout);
                    match res {
                        Ok(status) => {
                            exit_code = status.code();
                            debug!(job_id = self.job_id, ?status, "Backend exited");
                        }
                        Err(e) => warn!(job_id = self.job_id, "Error waiting for backend: {}", e),
                    }
                }

                line = rx.recv(), if !output_done => {
                    match line {
                        Some(line) => self.handle_line(line),
                        None => output_done = true,
                    }
                }

                _ = sleep_until(drain_deadline), if process_exited && !output_done => {
                    warn!(job_id = self.job_id, "Backend output still open after exit, abandoning readers");
                    output_done = true;
                    drain_timed_out = true;
                }
            }
        }

        if drain_timed_out {
            for reader in &readers {
                reader.abort();
            }
        } else {
            for res in join_all(readers).await {
                if let Err(e) = res {
                    warn!(job_id = self.job_id, "Output reader task failed: {}", e);
                }
            }
        }

        if self.state.pause_triggered {
            return Ok(RunResult::Paused);
        }

        let terminated = self.control.was_terminated_intentionally();
        Ok(RunResult::Finished(self.state.outcome(exit_code, terminated, started.elapsed())))
    }

    fn handle_line(&mut self, line: OutputLine) {
        if self.state.pause_triggered {
            return;
        }

        for effect in self.state.process_line(line.stream, &line.text, Instant::now()) {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        let job_id = self.job_id;
        match effect {
            Effect::Progress {
                status,
                track_percent,
                overall_percent,
            } => self.events.emit(DownloadEvent::Progress {
                job_id,
                status,
                track_percent,
                overall_percent,
            }),
            Effect::TrackSkipped(name) => self.events.emit(DownloadEvent::TrackSkipped { job_id, name }),
            Effect::StreamLabel(text) => self.events.emit(DownloadEvent::StreamLabel { job_id, text }),
            Effect::ErrorLine(text) => {
                if let Some(path) = &self.backend_log_path {
                    append_backend_log(path, job_id, &text);
                }
                self.events.emit(DownloadEvent::ErrorLine { job_id, text });
            }
            Effect::PauseRequested => {
                warn!(job_id, "Decryptor refused the connection, pausing the queue");
                self.control.mark_pause_triggered();
                self.events.emit(DownloadEvent::PauseQueueRequested { job_id });
                (self.on_pause)(job_id);
            }
        }
    }

    fn finish(&mut self, outcome: &Outcome) {
        if let Some(pending) = self.state.take_pending() {
            self.apply_effect(pending);
        }

        match outcome {
            Outcome::Success { message } => info!(job_id = self.job_id, "{}", message),
            Outcome::Cancelled { message } => info!(job_id = self.job_id, "{}", message),
            Outcome::Failed { message } => {
                emit_job_failed(&self.events, self.job_id, message, self.state.skipped_tracks.clone());
                return;
            }
        }

        self.events.emit(DownloadEvent::Finished {
            job_id: self.job_id,
            success: outcome.is_success(),
            message: outcome.message().to_string(),
            skipped_tracks: self.state.skipped_tracks.clone(),
        });
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drain one pipe line by line until EOF or until the job paused.
///
/// Output is decoded as UTF-8 with invalid sequences replaced. Carriage
/// returns split lines too, so in-place progress bars arrive as separate
/// updates.
fn spawn_reader<R>(
    pipe: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<OutputLine>,
    control: Arc<JobControl>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();

        loop {
            if control.pause_triggered() {
                break;
            }

            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    for segment in text.split('\r') {
                        let segment = segment.trim_end_matches('\n');
                        if segment.trim().is_empty() {
                            continue;
                        }
                        if tx
                            .send(OutputLine {
                                stream,
                                text: segment.to_string(),
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(?stream, "Error reading backend output: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::downloader::state::{DEFAULT_EMIT_INTERVAL, JobFlags};

    fn sh_command(script: &str) -> BackendCommand {
        BackendCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn runner(script: &str, control: Arc<JobControl>) -> (JobRunner, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (events, rx) = EventBus::channel();
        let state = JobState::new(9, JobFlags::default(), 1, DEFAULT_EMIT_INTERVAL);
        let runner = JobRunner::new(
            sh_command(script),
            None,
            state,
            control,
            events,
            Arc::new(|_| {}),
            Duration::from_millis(500),
            None,
        );
        (runner, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn reports_success_with_progress() {
        let (runner, mut rx) = runner(
            r#"echo 'AMDL_PROGRESS::{"type":"track_start","name":"A"}'; echo 'AMDL_PROGRESS::{"type":"track_complete","name":"A"}'"#,
            Arc::new(JobControl::new()),
        );

        let result = runner.run().await;
        assert!(matches!(result, RunResult::Finished(Outcome::Success { .. })));

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&DownloadEvent::FetchingStarted { job_id: 9 }));
        assert!(matches!(events.last(), Some(DownloadEvent::Finished { success: true, .. })));
    }

    #[tokio::test]
    async fn carriage_returns_split_progress_updates() {
        let (runner, mut rx) = runner(r"printf 'Downloading 10%%\rDownloading 50%%\n'", Arc::new(JobControl::new()));

        runner.run().await;
        let tracks: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                DownloadEvent::Progress { track_percent, .. } => Some(track_percent),
                _ => None,
            })
            .collect();
        assert_eq!(tracks.len(), 2);
        assert!((tracks[1] - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_finished() {
        let (events, mut rx) = EventBus::channel();
        let state = JobState::new(3, JobFlags::default(), 1, DEFAULT_EMIT_INTERVAL);
        let runner = JobRunner::new(
            BackendCommand {
                program: PathBuf::from("/nonexistent/amdl-backend"),
                args: vec![],
            },
            None,
            state,
            Arc::new(JobControl::new()),
            events,
            Arc::new(|_| {}),
            Duration::from_millis(500),
            None,
        );

        let result = runner.run().await;
        assert!(matches!(result, RunResult::Finished(Outcome::Failed { .. })));
        let finished = drain(&mut rx).into_iter().find(|e| matches!(e, DownloadEvent::Finished { .. }));
        match finished {
            Some(DownloadEvent::Finished { success, message, .. }) => {
                assert!(!success);
                assert!(message.starts_with("Failed: failed to launch"));
            }
            other => panic!("expected finished event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn termination_is_reported_as_cancelled() {
        let control = Arc::new(JobControl::new());
        let (runner, mut rx) = runner("exec sleep 30", control.clone());

        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(control.process_id().is_some());
        control.terminate();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(result, RunResult::Finished(Outcome::Cancelled { .. })));
        assert!(control.process_id().is_none());

        let finished = drain(&mut rx).into_iter().find_map(|e| match e {
            DownloadEvent::Finished { success, message, .. } => Some((success, message)),
            _ => None,
        });
        let (success, message) = finished.unwrap();
        assert!(!success);
        assert!(message.starts_with("Cancelled after"));
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_replaced() {
        let (runner, mut rx) = runner(
            r#"printf 'bad \377\376 bytes\n' >&2; echo 'AMDL_PROGRESS::{"type":"track_complete","name":"A"}'"#,
            Arc::new(JobControl::new()),
        );

        let result = runner.run().await;
        assert!(matches!(result, RunResult::Finished(Outcome::Success { .. })));

        let events = drain(&mut rx);
        let error_lines: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::ErrorLine { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(error_lines.len(), 1);
        assert!(error_lines[0].contains('\u{FFFD}'));
        assert!(error_lines[0].starts_with("bad "));
        assert!(matches!(events.last(), Some(DownloadEvent::Finished { success: true, .. })));
    }
}
