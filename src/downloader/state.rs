//! Per-job progress state.
//!
//! Every track's progress is folded onto a single 0-100 "track percent"
//! with phase-dependent weights, and overall progress is
//! `(completed_tracks * 100 + track_percent) / total_tracks`. Tracks each
//! restart at 0%, the overall figure does not.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::download_queue::{Job, JobId, MediaKind};

use super::progress::{LegacyEvent, LineEvent, Stream, StructuredEvent, classify_line};

/// Minimum spacing between two non-forced progress emissions.
pub const DEFAULT_EMIT_INTERVAL: Duration = Duration::from_millis(50);

/// Share of an audio track spent downloading; decrypting covers the rest.
const AUDIO_DOWNLOAD_WEIGHT: f64 = 0.6;
/// Share of a music video spent downloading; remuxing covers the rest.
const MV_DOWNLOAD_WEIGHT: f64 = 0.9;

const AAC_QUALITIES: &[&str] = &[
    "aac",
    "aac-lc",
    "aac-he",
    "aac-binaural",
    "aac-downmix",
    "aac-he-binaural",
    "aac-he-downmix",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Downloading,
    Decrypting,
    Remuxing,
}

/// What kind of download a job is, derived once from its metadata and URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    pub is_aac: bool,
    pub is_mv: bool,
    pub is_single_song: bool,
    pub is_playlist: bool,
    pub is_user_playlist: bool,
}

impl JobFlags {
    pub fn from_job(job: &Job) -> Self {
        let url = job.original_url.as_str();
        let kind = job.media_data.kind();
        let quality = job.quality.to_lowercase();

        Self {
            is_aac: AAC_QUALITIES.contains(&quality.as_str()),
            is_mv: kind == MediaKind::MusicVideo || url.contains("/music-video/"),
            is_single_song: kind == MediaKind::Song || is_song_url(url),
            is_playlist: kind == MediaKind::Playlist || url.contains("/playlist/"),
            is_user_playlist: url.contains("pl.u-"),
        }
    }
}

/// A track link: `/song/...` or an album link carrying an `i=` track id.
pub fn is_song_url(url: &str) -> bool {
    url.contains("/song/") || url.contains("?i=") || url.contains("&i=")
}

/// One side effect produced while folding a line into the state.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Progress {
        status: String,
        track_percent: f64,
        overall_percent: f64,
    },
    TrackSkipped(String),
    StreamLabel(String),
    ErrorLine(String),
    PauseRequested,
}

/// How a finished run turned out.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { message: String },
    Failed { message: String },
    Cancelled { message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message } | Self::Failed { message } | Self::Cancelled { message } => message,
        }
    }
}

/// Running state of one job. Owned by its runner.
#[derive(Debug, Clone)]
pub struct JobState {
    pub job_id: JobId,
    pub flags: JobFlags,
    pub total_tracks: usize,
    pub completed_tracks: usize,
    pub current_track_name: String,
    pub current_phase: Phase,
    pub track_progress: f64,
    pub skipped_tracks: Vec<String>,
    pub error_lines: Vec<String>,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Backend declared the playlist as a user playlist. Sticky.
    pub backend_says_user_playlist: bool,
    pub saw_progress: bool,
    pub pause_triggered: bool,
    emit_interval: Duration,
    last_emit_time: Option<Instant>,
    last_emitted: Option<(i64, i64)>,
    latest_progress_data: Option<Effect>,
}

impl JobState {
    pub fn new(job_id: JobId, flags: JobFlags, total_tracks: usize, emit_interval: Duration) -> Self {
        let total_tracks = if flags.is_mv || flags.is_single_song {
            1
        } else {
            total_tracks.max(1)
        };

        Self {
            job_id,
            flags,
            total_tracks,
            completed_tracks: 0,
            current_track_name: String::new(),
            current_phase: Phase::Starting,
            track_progress: 0.0,
            skipped_tracks: Vec::new(),
            error_lines: Vec::new(),
            total_bytes: 0,
            downloaded_bytes: 0,
            backend_says_user_playlist: false,
            saw_progress: false,
            pause_triggered: false,
            emit_interval,
            last_emit_time: None,
            last_emitted: None,
            latest_progress_data: None,
        }
    }

    /// Playlists only trust the backend's track numbering when they are
    /// user playlists; albums always do.
    pub fn is_album_like(&self) -> bool {
        !self.flags.is_playlist || self.flags.is_user_playlist || self.backend_says_user_playlist
    }

    pub fn overall_percent(&self) -> f64 {
        let total = self.total_tracks.max(1) as f64;
        ((self.completed_tracks as f64 * 100.0 + self.track_progress) / total).clamp(0.0, 100.0)
    }

    /// Number of tracks that were actually downloaded.
    pub fn downloaded_count(&self) -> usize {
        self.total_tracks.saturating_sub(self.skipped_tracks.len())
    }

    /// Most recent unrecognized stderr line.
    pub fn last_error(&self) -> Option<&str> {
        self.error_lines.last().map(String::as_str)
    }

    /// Fold one output line into the state.
    pub fn process_line(&mut self, stream: Stream, line: &str, now: Instant) -> Vec<Effect> {
        if self.pause_triggered {
            return Vec::new();
        }

        match classify_line(stream, line) {
            LineEvent::Structured(event) => self.apply_structured(event, now),
            LineEvent::Legacy(event) => self.apply_legacy(event, now),
            LineEvent::DecryptorRefused => {
                self.pause_triggered = true;
                vec![Effect::PauseRequested]
            }
            LineEvent::ErrorCandidate(text) => {
                self.error_lines.push(text.clone());
                vec![Effect::ErrorLine(text)]
            }
            LineEvent::Informational | LineEvent::Ignored => Vec::new(),
        }
    }

    pub fn apply_structured(&mut self, event: StructuredEvent, now: Instant) -> Vec<Effect> {
        debug!(job_id = self.job_id, ?event, "structured progress");
        let mut effects = Vec::new();

        match event {
            StructuredEvent::Unknown => return effects,
            StructuredEvent::Size { total_bytes } => {
                self.saw_progress = true;
                self.total_bytes = total_bytes;
            }
            StructuredEvent::Bytes {
                downloaded_bytes,
                total_bytes,
            } => {
                self.saw_progress = true;
                self.downloaded_bytes = downloaded_bytes;
                if let Some(total) = total_bytes {
                    self.total_bytes = total;
                }
                effects.extend(self.progress(false, now));
            }
            StructuredEvent::TrackStart {
                name,
                track_num,
                total_tracks,
                is_user_playlist,
            } => {
                self.saw_progress = true;
                self.backend_says_user_playlist |= is_user_playlist;
                self.current_track_name = name;
                self.current_phase = Phase::Downloading;
                self.track_progress = 0.0;
                self.downloaded_bytes = 0;
                self.total_bytes = 0;

                if self.is_album_like() && !self.flags.is_mv && !self.flags.is_single_song {
                    if let Some(total) = total_tracks.filter(|t| *t > 0) {
                        self.total_tracks = total;
                    }
                    if let Some(num) = track_num {
                        self.completed_tracks = self.completed_tracks.max(num.saturating_sub(1));
                    }
                }
                effects.extend(self.progress(false, now));
            }
            StructuredEvent::TrackSkip { name, track_num, reason } => {
                self.saw_progress = true;
                debug!(job_id = self.job_id, track = %name, ?reason, "track skipped");
                self.completed_tracks += 1;
                if self.is_album_like() {
                    if let Some(num) = track_num {
                        self.completed_tracks = self.completed_tracks.max(num);
                    }
                }
                self.track_progress = 0.0;
                self.skipped_tracks.push(name.clone());
                effects.push(Effect::TrackSkipped(name));
                effects.extend(self.progress(true, now));
            }
            StructuredEvent::TrackStream { text } => {
                effects.push(Effect::StreamLabel(text));
            }
            StructuredEvent::TrackProgress { percent, name } => {
                self.saw_progress = true;
                if let Some(name) = name.filter(|n| !n.is_empty()) {
                    self.current_track_name = name;
                }
                let percent = percent.clamp(0.0, 100.0);
                if self.flags.is_mv {
                    self.current_phase = if percent >= 90.0 {
                        Phase::Remuxing
                    } else {
                        Phase::Downloading
                    };
                } else if self.current_phase == Phase::Starting {
                    self.current_phase = Phase::Downloading;
                }
                self.track_progress = percent;
                effects.extend(self.progress(false, now));
            }
            StructuredEvent::TrackComplete { name, track_num } => {
                self.saw_progress = true;
                if !name.is_empty() {
                    self.current_track_name = name;
                }
                self.track_progress = 100.0;
                effects.extend(self.progress(true, now));

                let next = self.completed_tracks + 1;
                self.completed_tracks = match track_num {
                    Some(num) if self.is_album_like() => next.max(num),
                    _ => next,
                };
                self.track_progress = 0.0;
            }
        }

        effects
    }

    pub fn apply_legacy(&mut self, event: LegacyEvent, now: Instant) -> Vec<Effect> {
        let is_mv = self.flags.is_mv;
        if is_mv && matches!(event, LegacyEvent::Decrypting(_)) {
            return Vec::new();
        }
        self.saw_progress = true;

        let force = match event {
            LegacyEvent::Downloading(percent) => {
                self.current_phase = Phase::Downloading;
                let weight = if is_mv { MV_DOWNLOAD_WEIGHT } else { AUDIO_DOWNLOAD_WEIGHT };
                self.track_progress = percent * weight;
                false
            }
            LegacyEvent::Decrypting(percent) => {
                self.current_phase = Phase::Decrypting;
                self.track_progress = AUDIO_DOWNLOAD_WEIGHT * 100.0 + percent * (1.0 - AUDIO_DOWNLOAD_WEIGHT);
                false
            }
            LegacyEvent::Downloaded => {
                self.track_progress = if is_mv {
                    MV_DOWNLOAD_WEIGHT * 100.0
                } else {
                    AUDIO_DOWNLOAD_WEIGHT * 100.0
                };
                true
            }
            LegacyEvent::MvRemuxing => {
                self.current_phase = Phase::Remuxing;
                if is_mv {
                    self.track_progress = self.track_progress.max(MV_DOWNLOAD_WEIGHT * 100.0);
                }
                true
            }
        };

        self.progress(force, now).into_iter().collect()
    }

    /// Build a progress emission, subject to throttling.
    ///
    /// Emission is forced for the first update of a job, whenever the
    /// integer track or overall percent changes, and for phase-defining
    /// events. Otherwise at most one update per `emit_interval` goes out and
    /// the rest is parked in `latest_progress_data`.
    fn progress(&mut self, force: bool, now: Instant) -> Option<Effect> {
        let track_percent = self.track_progress;
        let overall_percent = self.overall_percent();
        let key = (track_percent as i64, overall_percent as i64);

        let force = force || self.last_emitted.is_none_or(|last| last != key);
        let effect = Effect::Progress {
            status: self.status_text(),
            track_percent,
            overall_percent,
        };

        let due = self
            .last_emit_time
            .is_none_or(|last| now.saturating_duration_since(last) >= self.emit_interval);

        if !force && !due {
            self.latest_progress_data = Some(effect);
            return None;
        }

        self.last_emit_time = Some(now);
        self.last_emitted = Some(key);
        self.latest_progress_data = None;
        Some(effect)
    }

    /// Throttled update that never went out, if any.
    pub fn take_pending(&mut self) -> Option<Effect> {
        self.latest_progress_data.take()
    }

    pub fn status_text(&self) -> String {
        let phase = match self.current_phase {
            Phase::Starting => "Starting",
            Phase::Downloading if self.flags.is_mv && self.track_progress >= 50.0 => "Processing",
            Phase::Downloading if self.flags.is_aac => "Downloading AAC",
            Phase::Downloading => "Downloading",
            Phase::Decrypting => "Decrypting",
            Phase::Remuxing => "Remuxing",
        };

        let mut status = if self.current_track_name.is_empty() {
            phase.to_string()
        } else {
            format!("{} '{}'", phase, self.current_track_name)
        };

        if self.total_tracks > 1 {
            let position = (self.completed_tracks + 1).min(self.total_tracks);
            status.push_str(&format!(" ({}/{})", position, self.total_tracks));
        }

        if self.downloaded_bytes > 0 && self.total_bytes > 0 {
            status.push_str(&format!(
                " - {:.1}/{:.1} MB",
                self.downloaded_bytes as f64 / 1_048_576.0,
                self.total_bytes as f64 / 1_048_576.0
            ));
        }

        status
    }

    /// Decide how the run ended.
    ///
    /// Intentional termination wins over the exit code. A zero exit code is
    /// not trusted on its own: a run that never reported progress failed.
    pub fn outcome(&self, exit_code: Option<i32>, terminated: bool, elapsed: Duration) -> Outcome {
        if terminated {
            return Outcome::Cancelled {
                message: format!("Cancelled after {}", format_elapsed(elapsed)),
            };
        }

        match exit_code {
            Some(0) => {}
            Some(code) => {
                return Outcome::Failed {
                    message: match self.last_error() {
                        Some(line) => format!("Failed: {}", line),
                        None => format!("Failed: downloader exited with code {}", code),
                    },
                };
            }
            None => {
                return Outcome::Failed {
                    message: match self.last_error() {
                        Some(line) => format!("Failed: {}", line),
                        None => "Failed: downloader was terminated by a signal".to_string(),
                    },
                };
            }
        }

        if !self.saw_progress {
            return Outcome::Failed {
                message: "Failed: No progress reported by the downloader (exit code 0)".to_string(),
            };
        }

        let mut message = format!("Done in {}", format_elapsed(elapsed));
        if !self.skipped_tracks.is_empty() {
            message.push_str(&format!(
                ": {} downloaded, {} skipped",
                self.downloaded_count(),
                self.skipped_tracks.len()
            ));
        }
        Outcome::Success { message }
    }
}

/// `12.3s` below a minute, `3m 05s` above.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let whole = elapsed.as_secs();
        format!("{}m {:02}s", whole / 60, whole % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album_state(total: usize) -> JobState {
        JobState::new(1, JobFlags::default(), total, DEFAULT_EMIT_INTERVAL)
    }

    fn mv_state() -> JobState {
        let flags = JobFlags {
            is_mv: true,
            ..JobFlags::default()
        };
        JobState::new(1, flags, 1, DEFAULT_EMIT_INTERVAL)
    }

    fn line(state: &mut JobState, text: &str, now: Instant) -> Vec<Effect> {
        state.process_line(Stream::Stdout, text, now)
    }

    fn progress_of(effects: &[Effect]) -> Option<(f64, f64)> {
        effects.iter().find_map(|e| match e {
            Effect::Progress {
                track_percent,
                overall_percent,
                ..
            } => Some((*track_percent, *overall_percent)),
            _ => None,
        })
    }

    #[test]
    fn test_overall_formula() {
        let mut state = album_state(4);
        let now = Instant::now();
        state.completed_tracks = 2;

        let effects = line(&mut state, r#"AMDL_PROGRESS::{"type":"track_progress","percent":50}"#, now);
        let (track, overall) = progress_of(&effects).unwrap();
        assert_eq!(track, 50.0);
        assert!((overall - (2.0 * 100.0 + 50.0) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_non_decreasing_within_track() {
        let mut state = album_state(3);
        let start = Instant::now();
        let mut last = 0.0;
        for (i, p) in [0, 10, 10, 35, 60, 99, 100].iter().enumerate() {
            state.process_line(
                Stream::Stdout,
                &format!(r#"AMDL_PROGRESS::{{"type":"track_progress","percent":{}}}"#, p),
                start + Duration::from_millis(100 * i as u64),
            );
            let overall = state.overall_percent();
            assert!(overall >= last);
            last = overall;
        }
    }

    #[test]
    fn test_legacy_weights_audio() {
        let mut state = album_state(1);
        let now = Instant::now();

        line(&mut state, "Downloading 50%", now);
        assert!((state.track_progress - 30.0).abs() < 1e-9);
        assert_eq!(state.current_phase, Phase::Downloading);

        line(&mut state, "Downloaded", now);
        assert_eq!(state.track_progress, 60.0);

        line(&mut state, "Decrypting 50%", now);
        assert!((state.track_progress - 80.0).abs() < 1e-9);
        assert_eq!(state.current_phase, Phase::Decrypting);
    }

    #[test]
    fn test_legacy_weights_mv() {
        let mut state = mv_state();
        let now = Instant::now();

        line(&mut state, "Downloading 50%", now);
        assert!((state.track_progress - 45.0).abs() < 1e-9);

        line(&mut state, "Downloaded", now);
        assert_eq!(state.track_progress, 90.0);

        assert!(line(&mut state, "Decrypting 50%", now).is_empty());
        assert_eq!(state.track_progress, 90.0);

        let effects = line(&mut state, "MV Remuxing...", now);
        assert_eq!(state.current_phase, Phase::Remuxing);
        assert!(progress_of(&effects).is_some(), "remux marker forces an emission");
    }

    #[test]
    fn test_mv_decrypting_alone_is_not_progress() {
        let mut state = mv_state();
        let now = Instant::now();
        assert!(line(&mut state, "Decrypting 40%", now).is_empty());
        assert!(!state.saw_progress);
        assert!(
            state
                .outcome(Some(0), false, Duration::from_secs(1))
                .message()
                .contains("No progress reported")
        );
    }

    #[test]
    fn test_stderr_downloaded_error_is_not_progress() {
        let mut state = album_state(1);
        let now = Instant::now();
        let effects = state.process_line(Stream::Stderr, "error: Downloaded file failed checksum", now);
        assert_eq!(effects, vec![Effect::ErrorLine("error: Downloaded file failed checksum".into())]);
        assert!(!state.saw_progress);
        assert!(!state.outcome(Some(0), false, Duration::from_secs(1)).is_success());
    }

    #[test]
    fn test_refusal_line_with_percent_requests_pause() {
        let mut state = album_state(1);
        let now = Instant::now();
        let effects = state.process_line(
            Stream::Stderr,
            "Decrypting 0% failed: dial tcp 127.0.0.1:10020: actively refused",
            now,
        );
        assert_eq!(effects, vec![Effect::PauseRequested]);
        assert!(state.pause_triggered);
        assert_eq!(state.track_progress, 0.0);
    }

    #[test]
    fn test_mv_track_progress_status() {
        let mut state = mv_state();
        let now = Instant::now();

        line(&mut state, r#"AMDL_PROGRESS::{"type":"track_progress","percent":20}"#, now);
        assert!(state.status_text().starts_with("Downloading"));
        line(&mut state, r#"AMDL_PROGRESS::{"type":"track_progress","percent":70}"#, now);
        assert!(state.status_text().starts_with("Processing"));
        assert_eq!(state.track_progress, 70.0);
        line(&mut state, r#"AMDL_PROGRESS::{"type":"track_progress","percent":95}"#, now);
        assert!(state.status_text().starts_with("Remuxing"));
    }

    #[test]
    fn test_track_complete_sets_100_and_advances() {
        for mut state in [album_state(3), mv_state()] {
            let now = Instant::now();
            let effects = line(&mut state, r#"AMDL_PROGRESS::{"type":"track_complete","name":"A"}"#, now);
            assert_eq!(progress_of(&effects).unwrap().0, 100.0);
            assert_eq!(state.completed_tracks, 1);
        }
    }

    #[test]
    fn test_track_complete_resyncs_to_backend_track_num() {
        let mut state = album_state(10);
        let now = Instant::now();
        line(&mut state, r#"AMDL_PROGRESS::{"type":"track_complete","name":"A","track_num":4}"#, now);
        assert_eq!(state.completed_tracks, 4);

        // Never goes backwards.
        line(&mut state, r#"AMDL_PROGRESS::{"type":"track_complete","name":"B","track_num":2}"#, now);
        assert_eq!(state.completed_tracks, 5);
    }

    #[test]
    fn test_track_skip_accounting() {
        let mut state = album_state(3);
        let now = Instant::now();

        let effects = line(&mut state, r#"AMDL_PROGRESS::{"type":"track_skip","name":"Song B"}"#, now);
        assert_eq!(state.completed_tracks, 1);
        assert_eq!(state.skipped_tracks, vec!["Song B".to_string()]);
        assert!(effects.contains(&Effect::TrackSkipped("Song B".into())));
        assert_eq!(state.downloaded_count(), 2);
    }

    #[test]
    fn test_track_start_adopts_total_for_albums() {
        let mut state = album_state(3);
        let now = Instant::now();
        line(
            &mut state,
            r#"AMDL_PROGRESS::{"type":"track_start","name":"X","track_num":5,"total_tracks":12}"#,
            now,
        );
        assert_eq!(state.total_tracks, 12);
        assert_eq!(state.completed_tracks, 4);
        assert_eq!(state.current_track_name, "X");
    }

    #[test]
    fn test_catalog_playlist_counts_sequentially() {
        let flags = JobFlags {
            is_playlist: true,
            ..JobFlags::default()
        };
        let mut state = JobState::new(1, flags, 8, DEFAULT_EMIT_INTERVAL);
        let now = Instant::now();
        line(
            &mut state,
            r#"AMDL_PROGRESS::{"type":"track_start","name":"X","track_num":5,"total_tracks":40}"#,
            now,
        );
        assert_eq!(state.total_tracks, 8);
        assert_eq!(state.completed_tracks, 0);
    }

    #[test]
    fn test_user_playlist_flag_is_sticky() {
        let flags = JobFlags {
            is_playlist: true,
            ..JobFlags::default()
        };
        let mut state = JobState::new(1, flags, 8, DEFAULT_EMIT_INTERVAL);
        let now = Instant::now();
        line(
            &mut state,
            r#"AMDL_PROGRESS::{"type":"track_start","name":"X","track_num":1,"total_tracks":30,"isUserPlaylist":true}"#,
            now,
        );
        assert!(state.is_album_like());
        assert_eq!(state.total_tracks, 30);

        line(
            &mut state,
            r#"AMDL_PROGRESS::{"type":"track_start","name":"Y","track_num":7,"total_tracks":30}"#,
            now,
        );
        assert!(state.backend_says_user_playlist);
        assert_eq!(state.completed_tracks, 6);
    }

    #[test]
    fn test_user_playlist_from_url() {
        let job = Job::new(
            1,
            crate::download_queue::MediaData::new(serde_json::json!({"type": "playlists", "attributes": {"trackCount": 3}})),
            "aac-lc",
            "https://music.apple.com/library/playlist/pl.u-abc123",
        );
        let flags = JobFlags::from_job(&job);
        assert!(flags.is_playlist);
        assert!(flags.is_user_playlist);
        assert!(flags.is_aac);
        assert!(!flags.is_mv);
    }

    #[test]
    fn test_throttle_bounds_emissions() {
        let mut state = album_state(1);
        let start = Instant::now();
        let mut emitted = 0;

        // 100 updates within 10ms, all on the same integer percent after the first.
        for i in 0..100u64 {
            let percent = 42.0 + (i as f64) / 1000.0;
            let effects = state.process_line(
                Stream::Stdout,
                &format!(r#"AMDL_PROGRESS::{{"type":"track_progress","percent":{}}}"#, percent),
                start + Duration::from_micros(i * 100),
            );
            if progress_of(&effects).is_some() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
        assert!(state.take_pending().is_some());
    }

    #[test]
    fn test_throttle_never_skips_visible_percent() {
        let mut state = album_state(1);
        let start = Instant::now();
        let mut seen = Vec::new();
        for p in 0..100u64 {
            let effects = state.process_line(
                Stream::Stdout,
                &format!(r#"AMDL_PROGRESS::{{"type":"track_progress","percent":{}}}"#, p),
                start + Duration::from_micros(p * 50),
            );
            if let Some((track, _)) = progress_of(&effects) {
                seen.push(track as i64);
            }
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicate_bytes_event_is_throttled() {
        let mut state = album_state(2);
        let now = Instant::now();
        let bytes = r#"AMDL_PROGRESS::{"type":"bytes","downloaded":1048576,"total":4194304}"#;

        let first = line(&mut state, bytes, now);
        assert!(progress_of(&first).is_some());
        let second = line(&mut state, bytes, now + Duration::from_millis(5));
        assert!(second.is_empty());
        assert_eq!(state.completed_tracks, 0);
        assert!(state.status_text().contains("1.0/4.0 MB"));
    }

    #[test]
    fn test_stream_label_and_error_lines() {
        let mut state = album_state(1);
        let now = Instant::now();
        let effects = line(&mut state, r#"AMDL_PROGRESS::{"type":"trackstream","text":"ALAC 24/96"}"#, now);
        assert_eq!(effects, vec![Effect::StreamLabel("ALAC 24/96".into())]);

        let effects = state.process_line(Stream::Stderr, "failed to decrypt segment", now);
        assert_eq!(effects, vec![Effect::ErrorLine("failed to decrypt segment".into())]);
        assert!(state.process_line(Stream::Stderr, "Connected to device", now).is_empty());
        assert_eq!(state.last_error(), Some("failed to decrypt segment"));
    }

    #[test]
    fn test_decryptor_refusal_requests_pause_once() {
        let mut state = album_state(1);
        let now = Instant::now();
        let refused = "dial tcp 127.0.0.1:10020: connect: actively refused";
        assert_eq!(state.process_line(Stream::Stderr, refused, now), vec![Effect::PauseRequested]);
        assert!(state.pause_triggered);
        assert!(state.process_line(Stream::Stderr, refused, now).is_empty());
        assert!(line(&mut state, "Downloading 50%", now).is_empty());
    }

    #[test]
    fn test_outcomes() {
        let mut state = album_state(3);
        let elapsed = Duration::from_millis(12_300);

        assert!(matches!(state.outcome(Some(1), true, elapsed), Outcome::Cancelled { .. }));
        assert_eq!(
            state.outcome(Some(3), false, elapsed).message(),
            "Failed: downloader exited with code 3"
        );
        assert!(
            state
                .outcome(Some(0), false, elapsed)
                .message()
                .contains("No progress reported")
        );

        state.saw_progress = true;
        let outcome = state.outcome(Some(0), false, elapsed);
        assert!(outcome.is_success());
        assert_eq!(outcome.message(), "Done in 12.3s");

        state.skipped_tracks.push("B".into());
        assert_eq!(
            state.outcome(Some(0), false, elapsed).message(),
            "Done in 12.3s: 2 downloaded, 1 skipped"
        );

        state.error_lines.push("m3u8 not found".into());
        assert_eq!(state.outcome(Some(2), false, elapsed).message(), "Failed: m3u8 not found");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(4_240)), "4.2s");
        assert_eq!(format_elapsed(Duration::from_secs(185)), "3m 05s");
    }
}
