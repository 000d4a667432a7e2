//! dynres - per-application display resolution switching.
//!
//! Watches which process owns the focused window, switches the display to
//! that process's configured mode, and reverts after a grace period once it
//! loses focus. Listed processes can also have the cursor confined to their
//! window.

pub mod backend;
pub mod config;
pub mod cursor;
pub mod display;
pub mod domain;
pub mod engine;
pub mod events;
pub mod focus;
pub mod matcher;
pub mod mouse_lock;
pub mod processes;
pub mod resolution;

#[cfg(test)]
pub(crate) mod test_utils;

pub use engine::Engine;
pub use engine::EngineError;
