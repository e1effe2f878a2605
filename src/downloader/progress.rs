//! Line parsers for the downloader backend's output.
//!
//! The backend speaks two progress dialects at once: structured
//! `AMDL_PROGRESS::{json}` lines and older free-form text markers. Each
//! dialect has its own pure parser; `classify_line` tries them in order.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::trace;

/// Prefix of structured progress lines.
pub const STRUCTURED_PREFIX: &str = "AMDL_PROGRESS::";

/// Address of the local decryptor the backend talks to.
const DECRYPTOR_ADDR: &str = "127.0.0.1:10020";

/// Expected stderr chatter that is not an error.
const INFORMATIONAL_STDERR: &[&str] = &[
    "Fetching album details...",
    "Fetching playlist details...",
    "Fetching song details...",
    "Fetching music video details...",
    "Fetching artist details...",
    "Connected to device",
    "Received URL",
    "Checking for existing files",
    "Track already exists",
    "Getting m3u8",
    "Decrypting...",
    "Downloading...",
];

static LEGACY_PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\r?\s*(Downloading|Decrypting)[^\d%]*(\d+(?:\.\d+)?)\s*%").expect("valid legacy progress regex")
});

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A decoded `AMDL_PROGRESS::` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuredEvent {
    Size {
        #[serde(alias = "total", alias = "size", alias = "totalBytes")]
        total_bytes: u64,
    },
    Bytes {
        #[serde(alias = "downloaded", alias = "bytes", alias = "downloadedBytes")]
        downloaded_bytes: u64,
        #[serde(default, alias = "total", alias = "totalBytes")]
        total_bytes: Option<u64>,
    },
    TrackStart {
        #[serde(default)]
        name: String,
        #[serde(default, alias = "trackNum")]
        track_num: Option<usize>,
        #[serde(default, alias = "totalTracks")]
        total_tracks: Option<usize>,
        #[serde(default, rename = "isUserPlaylist", alias = "is_user_playlist")]
        is_user_playlist: bool,
    },
    TrackSkip {
        #[serde(default)]
        name: String,
        #[serde(default, alias = "trackNum")]
        track_num: Option<usize>,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "trackstream")]
    TrackStream {
        #[serde(alias = "label", alias = "stream", alias = "info")]
        text: String,
    },
    TrackProgress {
        #[serde(alias = "progress")]
        percent: f64,
        #[serde(default)]
        name: Option<String>,
    },
    TrackComplete {
        #[serde(default)]
        name: String,
        #[serde(default, alias = "trackNum")]
        track_num: Option<usize>,
    },
    #[serde(other)]
    Unknown,
}

/// Markers of the older free-form progress output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LegacyEvent {
    Downloading(f64),
    Decrypting(f64),
    /// Download phase of the current track is over.
    Downloaded,
    /// Music video entered the remux phase.
    MvRemuxing,
}

/// Classification of one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Structured(StructuredEvent),
    Legacy(LegacyEvent),
    /// The backend cannot reach the local decryptor.
    DecryptorRefused,
    /// Expected chatter, not an error.
    Informational,
    /// Unrecognized stderr; a candidate failure message.
    ErrorCandidate(String),
    /// Anything else: malformed structured lines, unknown stdout text.
    Ignored,
}

/// Parse an `AMDL_PROGRESS::` line.
///
/// Returns `None` for lines without the prefix and for malformed JSON; an
/// unrecognized `type` decodes to [`StructuredEvent::Unknown`].
pub fn parse_structured(line: &str) -> Option<StructuredEvent> {
    let idx = line.find(STRUCTURED_PREFIX)?;
    let payload = line[idx + STRUCTURED_PREFIX.len()..].trim();

    match serde_json::from_str::<StructuredEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            trace!("Dropping malformed progress payload: {} ({})", payload, e);
            None
        }
    }
}

/// Parse the free-form progress markers.
pub fn parse_legacy(line: &str) -> Option<LegacyEvent> {
    if let Some(caps) = LEGACY_PERCENT.captures(line) {
        let percent = caps[2].parse::<f64>().ok()?.clamp(0.0, 100.0);
        return Some(match &caps[1] {
            "Decrypting" => LegacyEvent::Decrypting(percent),
            _ => LegacyEvent::Downloading(percent),
        });
    }

    if line.contains("MV Remuxing...") {
        return Some(LegacyEvent::MvRemuxing);
    }

    if line.contains("Downloaded") && !line.contains("Downloading") {
        return Some(LegacyEvent::Downloaded);
    }

    None
}

/// Whether a stderr line reports the local decryptor refusing connections.
pub fn is_decryptor_refused(line: &str) -> bool {
    line.contains(DECRYPTOR_ADDR) && line.to_lowercase().contains("actively refused")
}

/// Whether a stderr line is expected chatter rather than an error.
pub fn is_informational_stderr(line: &str) -> bool {
    INFORMATIONAL_STDERR.iter().any(|pattern| line.contains(pattern))
}

/// Classify one line of backend output.
pub fn classify_line(stream: Stream, line: &str) -> LineEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineEvent::Ignored;
    }

    if trimmed.contains(STRUCTURED_PREFIX) {
        return match parse_structured(trimmed) {
            Some(event) => LineEvent::Structured(event),
            None => LineEvent::Ignored,
        };
    }

    // Refusal wins over any progress text the same line carries.
    if stream == Stream::Stderr && is_decryptor_refused(trimmed) {
        return LineEvent::DecryptorRefused;
    }

    match parse_legacy(line) {
        // Too loose a match for stderr, where error text mentions "Downloaded".
        Some(LegacyEvent::Downloaded) if stream == Stream::Stderr => {}
        Some(event) => return LineEvent::Legacy(event),
        None => {}
    }

    match stream {
        Stream::Stdout => LineEvent::Ignored,
        Stream::Stderr if is_informational_stderr(trimmed) => LineEvent::Informational,
        Stream::Stderr => LineEvent::ErrorCandidate(trimmed.to_string()),
    }
}
