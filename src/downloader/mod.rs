//! Download orchestration.
//!
//! ## Module Structure
//! - `events` - Event emission helpers
//! - `progress` - Backend output line parsing
//! - `settings` - Worker settings, backend config and command building
//! - `state` - Per-job progress reducer and terminal outcome
//! - `subprocess` - Backend process management
//! - `worker` - Queue scheduling, pause/resume and cancellation

mod events;
pub mod progress;
pub mod settings;
pub mod state;
mod subprocess;
mod worker;

// Re-exports for external consumers
pub use settings::{BackendCommand, WorkerSettings, build_command, load_backend_config};
pub use state::{JobFlags, JobState, Outcome, format_elapsed};
pub use subprocess::{JobControl, JobRunner, PauseHook, RunResult};
pub use worker::DownloadWorker;
