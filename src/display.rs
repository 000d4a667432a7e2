//! Display mode primitive.
//!
//! Backends query the active mode, enumerate supported modes and apply a
//! mode. Calls may block for a noticeable time while the display retrains,
//! so async callers run them on the blocking pool.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::domain::ResolutionMode;

/// Attempts made by [`query_current_with_retry`].
pub const QUERY_ATTEMPTS: u32 = 3;

/// Pause between query attempts.
const QUERY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Errors from the display primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplayError {
    /// The query hiccupped; retrying may succeed.
    #[error("Display query failed: {0}")]
    Query(String),

    /// The display refused the requested mode.
    #[error("Display rejected mode {mode}: {reason}")]
    Rejected {
        mode: ResolutionMode,
        reason: String,
    },

    /// The mode is not in the display's supported list.
    #[error("Mode {0} is not supported by the display")]
    Unsupported(ResolutionMode),
}

impl DisplayError {
    /// Whether this is a transient query failure rather than a refusal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Query(_))
    }
}

/// The OS resolution query/apply primitive.
pub trait DisplayBackend: Send + Sync {
    /// Currently active mode.
    fn current_mode(&self) -> Result<ResolutionMode, DisplayError>;

    /// Modes the display accepts. Ordering is backend-defined.
    fn supported_modes(&self) -> Result<Vec<ResolutionMode>, DisplayError>;

    /// Switch to `mode`.
    fn apply_mode(&self, mode: ResolutionMode) -> Result<(), DisplayError>;
}

/// Query the current mode, retrying transient failures silently.
///
/// Returns `None` when the backend cannot determine the mode.
pub fn query_current_with_retry(display: &dyn DisplayBackend) -> Option<ResolutionMode> {
    for attempt in 1..=QUERY_ATTEMPTS {
        match display.current_mode() {
            Ok(mode) => return Some(mode),
            Err(e) if e.is_transient() && attempt < QUERY_ATTEMPTS => {
                trace!("Current mode query attempt {} failed: {}", attempt, e);
                thread::sleep(QUERY_RETRY_DELAY);
            }
            Err(e) => {
                trace!("Current mode unavailable: {}", e);
                return None;
            }
        }
    }
    None
}
