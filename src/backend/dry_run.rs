//! Dry-run primitives: log what would happen, change nothing.

use std::sync::Mutex;

use tracing::info;

use crate::cursor::CursorConfiner;
use crate::cursor::CursorError;
use crate::display::DisplayBackend;
use crate::display::DisplayError;
use crate::domain::Rect;
use crate::domain::ResolutionMode;

/// In-memory display with a fixed mode list.
#[derive(Debug)]
pub struct DryRunDisplay {
    current: Mutex<ResolutionMode>,
    modes: Vec<ResolutionMode>,
}

impl DryRunDisplay {
    pub fn new(current: ResolutionMode, modes: Vec<ResolutionMode>) -> Self {
        Self {
            current: Mutex::new(current),
            modes,
        }
    }

    /// A typical 1440p monitor.
    pub fn standard() -> Self {
        let modes = vec![
            ResolutionMode::new(2560, 1440, 165),
            ResolutionMode::new(2560, 1440, 144),
            ResolutionMode::new(2560, 1440, 60),
            ResolutionMode::new(1920, 1080, 144),
            ResolutionMode::new(1920, 1080, 60),
            ResolutionMode::new(1280, 720, 60),
        ];
        Self::new(ResolutionMode::new(2560, 1440, 60), modes)
    }
}

impl DisplayBackend for DryRunDisplay {
    fn current_mode(&self) -> Result<ResolutionMode, DisplayError> {
        self.current
            .lock()
            .map(|mode| *mode)
            .map_err(|_| DisplayError::Query("dry-run state poisoned".to_string()))
    }

    fn supported_modes(&self) -> Result<Vec<ResolutionMode>, DisplayError> {
        Ok(self.modes.clone())
    }

    fn apply_mode(&self, mode: ResolutionMode) -> Result<(), DisplayError> {
        if !self.modes.contains(&mode) {
            return Err(DisplayError::Unsupported(mode));
        }

        let mut current = self
            .current
            .lock()
            .map_err(|_| DisplayError::Query("dry-run state poisoned".to_string()))?;
        info!("[DRY RUN] Would switch display from {} to {}", *current, mode);
        *current = mode;
        Ok(())
    }
}

/// Cursor confiner that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunCursor;

impl CursorConfiner for DryRunCursor {
    fn confine(&mut self, rect: Rect) -> Result<(), CursorError> {
        info!("[DRY RUN] Would confine cursor to {}", rect);
        Ok(())
    }

    fn release(&mut self) -> Result<(), CursorError> {
        info!("[DRY RUN] Would release cursor");
        Ok(())
    }
}
