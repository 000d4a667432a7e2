//! OS primitive backends.
//!
//! A [`Backends`] bundles the three primitives the engine drives: display
//! mode query/apply, cursor confinement and focus introspection. The X11
//! backend talks to a live X server; the dry-run backend keeps the real focus
//! probe but only logs display and cursor changes.

pub mod dry_run;
pub mod x11;

use std::sync::Arc;

use thiserror::Error;

use crate::cursor::CursorConfiner;
use crate::display::DisplayBackend;
use crate::focus::FocusProbe;
use crate::processes::ProcessTable;

pub use dry_run::DryRunCursor;
pub use dry_run::DryRunDisplay;
pub use x11::X11Session;

/// Errors that can occur while setting up a backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("X11 connection failed: {0}")]
    Connect(String),

    #[error("X server lacks the {0} extension")]
    MissingExtension(&'static str),

    #[error("X11 request failed: {0}")]
    Request(String),
}

/// The primitives one engine instance drives.
pub struct Backends {
    pub display: Arc<dyn DisplayBackend>,
    pub cursor: Box<dyn CursorConfiner>,
    pub focus: Box<dyn FocusProbe>,
}

impl Backends {
    /// Everything backed by a live X11 session.
    pub fn x11(processes: Arc<ProcessTable>) -> Result<Self, BackendError> {
        let session = X11Session::connect()?;
        Ok(Self {
            display: Arc::new(session.display()?),
            cursor: session.cursor(),
            focus: Box::new(session.focus_probe(processes)),
        })
    }

    /// Real focus probe, logging display and cursor.
    pub fn dry_run(processes: Arc<ProcessTable>) -> Result<Self, BackendError> {
        let session = X11Session::connect()?;
        Ok(Self {
            display: Arc::new(DryRunDisplay::standard()),
            cursor: Box::new(DryRunCursor),
            focus: Box::new(session.focus_probe(processes)),
        })
    }
}
