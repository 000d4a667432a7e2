//! Domain types shared by the controllers and the OS primitives.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// A display mode: pixel dimensions plus refresh rate.
///
/// Used both for supported modes reported by the display and for targets
/// requested by profiles. Equality is structural and exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionMode {
    pub width: u32,
    pub height: u32,
    pub frequency: u32,
}

impl ResolutionMode {
    /// Create a new mode.
    pub const fn new(width: u32, height: u32, frequency: u32) -> Self {
        Self {
            width,
            height,
            frequency,
        }
    }
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.frequency)
    }
}

/// Error parsing a `WIDTHxHEIGHT@HZ` string.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid resolution '{0}', expected WIDTHxHEIGHT@HZ (e.g. 1920x1080@144)")]
pub struct ParseModeError(String);

impl FromStr for ResolutionMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseModeError(s.to_string());
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_suffix("Hz")
            .or_else(|| trimmed.strip_suffix("hz"))
            .unwrap_or(trimmed);

        let (size, frequency) = trimmed.split_once('@').ok_or_else(err)?;
        let (width, height) = size.split_once('x').ok_or_else(err)?;

        Ok(Self {
            width: width.trim().parse().map_err(|_| err())?,
            height: height.trim().parse().map_err(|_| err())?,
            frequency: frequency.trim().parse().map_err(|_| err())?,
        })
    }
}

/// Screen rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    /// Whether the point lies inside the rectangle (edges inclusive).
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (x, y) = (i64::from(x), i64::from(y));
        x >= i64::from(self.x) && x <= self.right() && y >= i64::from(self.y) && y <= self.bottom()
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// What the focus monitor currently knows about the foreground window.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FocusState {
    /// A top-level window owned by `process` has focus.
    Focused { process: String, rect: Rect },
    /// Nothing identifiable has focus, or the probe keeps failing.
    #[default]
    Unknown,
}

impl FocusState {
    pub fn focused(process: impl Into<String>, rect: Rect) -> Self {
        Self::Focused {
            process: process.into(),
            rect,
        }
    }

    /// Name of the focused process, if any.
    pub fn process(&self) -> Option<&str> {
        match self {
            Self::Focused { process, .. } => Some(process),
            Self::Unknown => None,
        }
    }

    /// Rectangle of the focused window, if any.
    pub fn rect(&self) -> Option<Rect> {
        match self {
            Self::Focused { rect, .. } => Some(*rect),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for FocusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Focused { process, rect } => write!(f, "{process} [{rect}]"),
            Self::Unknown => f.write_str("<unknown>"),
        }
    }
}

/// A running process as reported to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Resident memory in bytes.
    pub memory: u64,
}
