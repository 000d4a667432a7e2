//! Status events pushed to the presentation layer.
//!
//! Two independent streams, each delivered over a `broadcast` channel. A
//! slow subscriber may lag and lose old events; publishers never block.

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::ResolutionMode;

/// Event name of the resolution stream.
pub const RESOLUTION_CHANGED: &str = "resolution-changed";

/// Event name of the mouse-lock stream.
pub const MOUSE_LOCK_CHANGED: &str = "mouse-lock-changed";

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStatus {
    Changed,
    RevertPending,
    Reverted,
}

/// Payload of `resolution-changed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionChanged {
    pub status: ResolutionStatus,
    pub process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl ResolutionChanged {
    pub fn changed(process: impl Into<String>, mode: ResolutionMode) -> Self {
        Self {
            status: ResolutionStatus::Changed,
            process: Some(process.into()),
            resolution: Some(mode.to_string()),
        }
    }

    /// `process` is the one whose profile lost focus, `revert_to` the mode
    /// that will be applied when the timer fires.
    pub fn revert_pending(process: impl Into<String>, revert_to: Option<ResolutionMode>) -> Self {
        Self {
            status: ResolutionStatus::RevertPending,
            process: Some(process.into()),
            resolution: revert_to.map(|m| m.to_string()),
        }
    }

    pub fn reverted(mode: ResolutionMode) -> Self {
        Self {
            status: ResolutionStatus::Reverted,
            process: None,
            resolution: Some(mode.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Active,
    Inactive,
}

/// Payload of `mouse-lock-changed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseLockChanged {
    pub status: LockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

impl MouseLockChanged {
    pub fn active(process: impl Into<String>) -> Self {
        Self {
            status: LockStatus::Active,
            process: Some(process.into()),
        }
    }

    pub fn inactive(process: impl Into<String>) -> Self {
        Self {
            status: LockStatus::Inactive,
            process: Some(process.into()),
        }
    }
}

/// Fan-out for both event streams.
#[derive(Debug, Clone)]
pub struct EventBus {
    resolution: broadcast::Sender<ResolutionChanged>,
    mouse_lock: broadcast::Sender<MouseLockChanged>,
}

impl EventBus {
    pub fn new() -> Self {
        let (resolution, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (mouse_lock, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            resolution,
            mouse_lock,
        }
    }

    pub fn publish_resolution(&self, event: ResolutionChanged) {
        trace!("{} {:?}", RESOLUTION_CHANGED, event);
        // No subscribers is not an error.
        let _ = self.resolution.send(event);
    }

    pub fn publish_mouse_lock(&self, event: MouseLockChanged) {
        trace!("{} {:?}", MOUSE_LOCK_CHANGED, event);
        let _ = self.mouse_lock.send(event);
    }

    pub fn subscribe_resolution(&self) -> broadcast::Receiver<ResolutionChanged> {
        self.resolution.subscribe()
    }

    pub fn subscribe_mouse_lock(&self) -> broadcast::Receiver<MouseLockChanged> {
        self.mouse_lock.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changed_payload() {
        let event = ResolutionChanged::changed("game.exe", ResolutionMode::new(1920, 1080, 144));
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"status": "changed", "process": "game.exe", "resolution": "1920x1080@144"})
        );
    }

    #[test]
    fn test_revert_pending_payload() {
        let event = ResolutionChanged::revert_pending("game.exe", None);
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"status": "revert-pending", "process": "game.exe"})
        );
    }

    #[test]
    fn test_reverted_payload_has_null_process() {
        let event = ResolutionChanged::reverted(ResolutionMode::new(2560, 1440, 60));
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"status": "reverted", "process": null, "resolution": "2560x1440@60"})
        );
    }

    #[test]
    fn test_mouse_lock_payload() {
        assert_eq!(
            serde_json::to_value(MouseLockChanged::active("game.exe")).unwrap(),
            json!({"status": "active", "process": "game.exe"})
        );
        assert_eq!(
            serde_json::to_value(MouseLockChanged::inactive("game.exe")).unwrap(),
            json!({"status": "inactive", "process": "game.exe"})
        );
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        bus.publish_resolution(ResolutionChanged::reverted(ResolutionMode::new(1, 1, 1)));

        let mut rx = bus.subscribe_mouse_lock();
        bus.publish_mouse_lock(MouseLockChanged::active("a"));
        assert_eq!(rx.recv().await.unwrap(), MouseLockChanged::active("a"));
    }
}
