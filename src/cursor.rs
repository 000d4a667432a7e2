//! Cursor confinement primitive and the confinement rectangle math.

use thiserror::Error;

use crate::config::MouseLockEntry;
use crate::domain::Rect;

/// Errors from the cursor confinement primitive.
#[derive(Error, Debug)]
pub enum CursorError {
    #[error("Cursor confinement unavailable: {0}")]
    Unavailable(String),

    #[error("Cursor confinement request failed: {0}")]
    Request(String),
}

/// The OS cursor clipping primitive.
///
/// Only one confinement is live at a time; `confine` replaces any previous one.
pub trait CursorConfiner: Send {
    fn confine(&mut self, rect: Rect) -> Result<(), CursorError>;

    /// Release confinement. Releasing when nothing is confined is a no-op.
    fn release(&mut self) -> Result<(), CursorError>;
}

/// Shrink `window` by the entry's padding on every side.
///
/// When the padding exceeds half an extent, that extent collapses to zero at
/// the window's centre instead of going negative.
pub fn confinement_rect(window: Rect, entry: &MouseLockEntry) -> Rect {
    let (x, width) = shrink_axis(window.x, window.width, entry.padding_x);
    let (y, height) = shrink_axis(window.y, window.height, entry.padding_y);
    Rect::new(x, y, width, height)
}

fn shrink_axis(origin: i32, extent: u32, padding: u32) -> (i32, u32) {
    let total = u64::from(padding) * 2;
    if total <= u64::from(extent) {
        let shrunk = extent - padding * 2;
        (saturating_offset(origin, padding), shrunk)
    } else {
        (saturating_offset(origin, extent / 2), 0)
    }
}

fn saturating_offset(origin: i32, by: u32) -> i32 {
    i32::try_from(i64::from(origin) + i64::from(by)).unwrap_or(i32::MAX)
}
