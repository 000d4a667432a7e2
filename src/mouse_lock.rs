//! Mouse lock controller.
//!
//! Confines the cursor to the focused window (minus padding) while a listed
//! process has focus. Unlike resolution switching there is no grace period:
//! confinement is released on the same update that moves focus away.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::AppConfig;
use crate::config::AutomationConfig;
use crate::cursor::CursorConfiner;
use crate::cursor::confinement_rect;
use crate::domain::FocusState;
use crate::domain::Rect;
use crate::events::EventBus;
use crate::events::MouseLockChanged;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,
    Locked {
        process: String,
        clip: Rect,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEffect {
    Confine(Rect),
    Release,
    Emit(MouseLockChanged),
}

#[derive(Debug, Default)]
pub struct MouseLockMachine {
    state: LockState,
    /// State before the latest update, i.e. what the cursor and the last
    /// published event reflect if that update's confine fails.
    prior: LockState,
}

impl MouseLockMachine {
    pub fn state(&self) -> &LockState {
        &self.state
    }

    /// Evaluate the latest focus against the lock list.
    ///
    /// Called for every focus update, including moves and resizes of the
    /// same window, so a locked clip follows its window.
    pub fn on_focus(&mut self, focus: &FocusState, config: &AutomationConfig) -> Vec<LockEffect> {
        let wanted = match focus {
            FocusState::Focused { process, rect } => config
                .mouse_lock_for(process)
                .map(|entry| (process.clone(), confinement_rect(*rect, entry))),
            FocusState::Unknown => None,
        };

        let prior = std::mem::take(&mut self.state);
        self.prior = prior.clone();

        match (prior, wanted) {
            (LockState::Unlocked, None) => Vec::new(),
            (LockState::Unlocked, Some((process, clip))) => {
                info!("Locking cursor to {} for {}", clip, process);
                self.state = LockState::Locked {
                    process: process.clone(),
                    clip,
                };
                vec![
                    LockEffect::Confine(clip),
                    LockEffect::Emit(MouseLockChanged::active(process)),
                ]
            }
            (LockState::Locked { process, clip }, Some((next, next_clip))) if process == next => {
                let effects = if clip == next_clip {
                    Vec::new()
                } else {
                    debug!("Window of {} changed, re-confining to {}", process, next_clip);
                    vec![LockEffect::Confine(next_clip)]
                };
                self.state = LockState::Locked {
                    process,
                    clip: next_clip,
                };
                effects
            }
            (LockState::Locked { process, .. }, Some((next, clip))) => {
                info!("Moving cursor lock from {} to {}", process, next);
                self.state = LockState::Locked {
                    process: next.clone(),
                    clip,
                };
                vec![
                    LockEffect::Confine(clip),
                    LockEffect::Emit(MouseLockChanged::inactive(process)),
                    LockEffect::Emit(MouseLockChanged::active(next)),
                ]
            }
            (LockState::Locked { process, .. }, None) => {
                info!("Releasing cursor lock for {}", process);
                Self::unlock_effects(process)
            }
        }
    }

    /// The confine call failed; forget the lock so the next update retries.
    ///
    /// A lock that was already in effect is released and reported inactive.
    pub fn confine_failed(&mut self) -> Vec<LockEffect> {
        self.state = LockState::Unlocked;
        match std::mem::take(&mut self.prior) {
            LockState::Locked { process, .. } => {
                warn!("Dropping cursor lock for {}", process);
                Self::unlock_effects(process)
            }
            LockState::Unlocked => Vec::new(),
        }
    }

    /// Drop any lock, e.g. on shutdown.
    pub fn release(&mut self) -> Vec<LockEffect> {
        match std::mem::take(&mut self.state) {
            LockState::Locked { process, .. } => Self::unlock_effects(process),
            LockState::Unlocked => Vec::new(),
        }
    }

    fn unlock_effects(process: String) -> Vec<LockEffect> {
        vec![
            LockEffect::Release,
            LockEffect::Emit(MouseLockChanged::inactive(process)),
        ]
    }
}

/// The task that owns a [`MouseLockMachine`] and the cursor primitive.
pub struct MouseLockController {
    machine: MouseLockMachine,
    cursor: Box<dyn CursorConfiner>,
    events: EventBus,
    focus: watch::Receiver<FocusState>,
    config: watch::Receiver<Arc<AppConfig>>,
    last_focus: FocusState,
}

impl MouseLockController {
    pub fn new(
        cursor: Box<dyn CursorConfiner>,
        events: EventBus,
        focus: watch::Receiver<FocusState>,
        config: watch::Receiver<Arc<AppConfig>>,
    ) -> Self {
        Self {
            machine: MouseLockMachine::default(),
            cursor,
            events,
            focus,
            config,
            last_focus: FocusState::Unknown,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!("Mouse lock controller started");
        let mut focus_open = true;
        let mut config_open = true;

        self.last_focus = self.focus.borrow_and_update().clone();
        self.evaluate();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = self.focus.changed(), if focus_open => {
                    if changed.is_err() {
                        focus_open = false;
                        self.last_focus = FocusState::Unknown;
                    } else {
                        self.last_focus = self.focus.borrow_and_update().clone();
                    }
                    self.evaluate();
                }
                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    self.config.borrow_and_update();
                    self.evaluate();
                }
            }
        }

        let effects = self.machine.release();
        self.execute(effects);
        info!("Mouse lock controller stopped");
    }

    fn evaluate(&mut self) {
        let config = self.config.borrow().clone();
        let effects = self.machine.on_focus(&self.last_focus, &config.automation);
        self.execute(effects);
    }

    fn execute(&mut self, effects: Vec<LockEffect>) {
        for effect in effects {
            match effect {
                LockEffect::Confine(rect) => {
                    if let Err(e) = self.cursor.confine(rect) {
                        warn!("Could not confine cursor to {}: {}", rect, e);
                        let effects = self.machine.confine_failed();
                        self.execute(effects);
                        return;
                    }
                }
                LockEffect::Release => {
                    if let Err(e) = self.cursor.release() {
                        warn!("Could not release cursor: {}", e);
                    }
                }
                LockEffect::Emit(event) => self.events.publish_mouse_lock(event),
            }
        }
    }
}
