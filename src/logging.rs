use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::download_queue::JobId;

/// Maximum size of the backend log file before rotation (in bytes).
const MAX_LOG_BYTES: u64 = 1_000_000; // ~1 MB

/// Environment variable holding a `tracing` filter directive.
pub const LOG_FILTER_ENV_VAR: &str = "AMDL_LOG";

/// Default filter when neither the caller nor the environment sets one.
pub const DEFAULT_LOG_FILTER: &str = "amdl_queue_lib=info";

/// Install the global tracing subscriber.
///
/// `directive` wins over `AMDL_LOG`, which wins over [`DEFAULT_LOG_FILTER`].
/// Fails if a global subscriber is already set or the directive is invalid.
pub fn init_logging(directive: Option<&str>) -> Result<(), String> {
    let filter = match directive {
        Some(d) => EnvFilter::try_new(d).map_err(|e| format!("Invalid log filter '{}': {}", d, e))?,
        None => EnvFilter::try_from_env(LOG_FILTER_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| format!("Failed to install log subscriber: {}", e))
}

fn current_timestamp() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}

fn rotate_if_needed(path: &Path) -> io::Result<()> {
    if let Ok(meta) = fs::metadata(path)
        && meta.len() >= MAX_LOG_BYTES
    {
        // Simple single-file rotation: backend.log -> backend.log.1
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "amdl-backend.log".to_string());

        let rotated_path = path.with_file_name(format!("{}.1", file_name));

        // Best-effort cleanup of any existing rotated file
        let _ = fs::remove_file(&rotated_path);

        fs::rename(path, rotated_path)?;
    }

    Ok(())
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    rotate_if_needed(path)?;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "[{}] {}", current_timestamp(), line)
}

/// Append one line of backend error output to the rotated log file.
///
/// Best effort: failures are logged and otherwise ignored.
pub fn append_backend_log(path: &Path, job_id: JobId, line: &str) {
    let decorated_line = format!("[job-{}] {}", job_id, line);

    if let Err(e) = append_line(path, &decorated_line) {
        warn!(path = %path.display(), "Failed to write backend log entry: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_backend_log_decorates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("backend.log");

        append_backend_log(&path, 7, "failed to get m3u8");
        append_backend_log(&path, 8, "second");

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[job-7] failed to get m3u8"));
        assert!(lines[1].ends_with("[job-8] second"));
    }

    #[test]
    fn test_rotation_at_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        fs::write(&path, vec![b'x'; MAX_LOG_BYTES as usize]).unwrap();

        append_backend_log(&path, 1, "fresh");

        let rotated = dir.path().join("backend.log.1");
        assert_eq!(fs::metadata(&rotated).unwrap().len(), MAX_LOG_BYTES);
        assert!(fs::read_to_string(&path).unwrap().contains("fresh"));
    }

    #[test]
    fn test_invalid_directive_is_rejected() {
        assert!(init_logging(Some("amdl_queue_lib=notalevel")).is_err());
    }
}
