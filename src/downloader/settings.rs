//! Worker settings, backend config loading and command-line building.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::download_queue::Job;
use crate::error::DownloaderError;

use super::state::is_song_url;

/// Maximum URL length to prevent abuse
pub const MAX_URL_LENGTH: usize = 4096;

/// Backend config keys forwarded as command-line flags, in emission order.
/// Part of the backend's command-line contract; do not reorder casually.
pub const ALLOWED_CONFIG_FLAGS: &[&str] = &[
    "alac-max",
    "atmos-max",
    "aac-type",
    "mv-audio-type",
    "mv-max",
    "storefront",
    "language",
    "lrc-type",
    "lrc-format",
    "embed-lrc",
    "save-lrc-file",
    "embed-cover",
    "cover-size",
    "cover-format",
    "save-artist-cover",
    "save-animated-artwork",
    "alac-save-folder",
    "atmos-save-folder",
    "aac-save-folder",
    "limit-max",
    "max-memory-limit",
    "decrypt-m3u8-port",
    "get-m3u8-port",
    "get-m3u8-from-device",
    "get-m3u8-mode",
    "debug",
];

/// Worker settings supplied by the embedding application.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    /// Downloader backend executable.
    pub executable: PathBuf,
    /// Arguments placed before the generated flags (launcher wrappers).
    pub backend_args: Vec<String>,
    /// Backend YAML config, re-read for every job.
    pub config_path: PathBuf,
    /// Working directory of the backend process.
    pub working_dir: Option<PathBuf>,
    /// Minimum spacing of non-forced progress updates.
    pub emit_interval_ms: u64,
    /// How long to keep draining output after the process exited.
    pub drain_timeout_ms: u64,
    /// Optional rotated log of backend error output.
    pub backend_log_path: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(default_executable()),
            backend_args: Vec::new(),
            config_path: PathBuf::from("config.yaml"),
            working_dir: None,
            emit_interval_ms: 50,
            drain_timeout_ms: 2000,
            backend_log_path: None,
        }
    }
}

fn default_executable() -> &'static str {
    if cfg!(windows) {
        "apple-music-downloader.exe"
    } else {
        "apple-music-downloader"
    }
}

impl WorkerSettings {
    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// A fully built backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl BackendCommand {
    /// Program followed by its arguments, as text.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Read the backend config from disk.
///
/// A missing file is an empty config. Anything else that goes wrong is an
/// error the caller reports as a failed job.
pub fn load_backend_config(path: &Path) -> Result<Mapping, DownloaderError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Backend config not found, using defaults");
            return Ok(Mapping::new());
        }
        Err(e) => return Err(DownloaderError::io(format!("reading {}", path.display()), e)),
    };

    if raw.trim().is_empty() {
        return Ok(Mapping::new());
    }

    serde_yaml::from_str::<Option<Mapping>>(&raw)
        .map(Option::unwrap_or_default)
        .map_err(|e| DownloaderError::config(path.display().to_string(), e))
}

/// Turn allow-listed config entries into backend flags.
///
/// `true` becomes a bare `--key`, strings and numbers become `--key value`,
/// everything else (false, null, lists, maps, unknown keys) is dropped.
pub fn build_config_args(config: &Mapping) -> Vec<String> {
    let mut args = Vec::new();

    for key in ALLOWED_CONFIG_FLAGS {
        let Some(value) = config.get(*key) else {
            continue;
        };

        match value {
            Value::Bool(true) => args.push(format!("--{}", key)),
            Value::String(s) => {
                args.push(format!("--{}", key));
                args.push(s.clone());
            }
            Value::Number(n) => {
                args.push(format!("--{}", key));
                args.push(n.to_string());
            }
            _ => {}
        }
    }

    args
}

/// `--music-video` or `--song`, derived from the link shape.
pub fn job_type_flag(url: &str) -> Option<&'static str> {
    if url.contains("/music-video/") {
        Some("--music-video")
    } else if is_song_url(url) {
        Some("--song")
    } else {
        None
    }
}

/// Build the backend invocation for a job:
/// `<exe> [backend args] [config flags] --codec-preference <quality> [--music-video|--song] <url>`.
pub fn build_command(settings: &WorkerSettings, job: &Job, config: &Mapping) -> BackendCommand {
    let mut args = settings.backend_args.clone();
    args.extend(build_config_args(config));

    args.push("--codec-preference".to_string());
    args.push(job.quality.clone());

    if let Some(flag) = job_type_flag(&job.original_url) {
        args.push(flag.to_string());
    }

    args.push(job.original_url.clone());

    BackendCommand {
        program: settings.executable.clone(),
        args,
    }
}

/// Characters that could be dangerous if passed to a shell.
/// `Command::arg()` does not invoke a shell; these are rejected anyway.
const DANGEROUS_SHELL_CHARS: &[char] = &['|', '&', ';', '$', '`', '\n', '\r', '(', ')', '<', '>'];

/// Validate URL input
pub fn validate_url(url: &str) -> Result<(), DownloaderError> {
    if url.trim().is_empty() {
        return Err(DownloaderError::invalid_url("URL cannot be empty"));
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(DownloaderError::invalid_url("URL must start with http:// or https://"));
    }

    if url.len() > MAX_URL_LENGTH {
        return Err(DownloaderError::invalid_url(format!(
            "URL is too long (max {} characters)",
            MAX_URL_LENGTH
        )));
    }

    // `&` is legitimate in query strings (`&i=`); only reject it outside of them.
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    if path.chars().any(|c| DANGEROUS_SHELL_CHARS.contains(&c))
        || query.chars().any(|c| c != '&' && DANGEROUS_SHELL_CHARS.contains(&c))
    {
        return Err(DownloaderError::invalid_url("URL contains invalid characters"));
    }

    Ok(())
}

/// Validate the codec preference passed to the backend.
pub fn validate_quality(quality: &str) -> Result<(), DownloaderError> {
    if quality.trim().is_empty() {
        return Err(DownloaderError::invalid_quality("Quality cannot be empty"));
    }
    if quality.chars().any(|c| c.is_whitespace() || DANGEROUS_SHELL_CHARS.contains(&c)) {
        return Err(DownloaderError::invalid_quality(format!("Invalid quality: {}", quality)));
    }
    Ok(())
}
