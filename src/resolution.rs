//! Resolution switch controller.
//!
//! [`ResolutionMachine`] is the state machine: it consumes focus changes,
//! timer expiries, apply outcomes and commands, and answers with
//! [`Effect`]s. [`ResolutionController`] is the single task that owns the
//! machine, runs display calls on the blocking pool, keeps the one revert
//! timer, and publishes events. Every transition goes through that task.
//!
//! The revert timer is tagged with a generation number. Cancelling bumps the
//! live generation, so a timer that fires after cancellation no longer
//! matches and is discarded.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::AppConfig;
use crate::config::AutomationConfig;
use crate::display::DisplayBackend;
use crate::display::DisplayError;
use crate::display::query_current_with_retry;
use crate::domain::FocusState;
use crate::domain::ResolutionMode;
use crate::events::EventBus;
use crate::events::ResolutionChanged;
use crate::matcher::ResolvedTarget;
use crate::matcher::resolve_target;

/// Controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// No automated mode is applied.
    Idle,
    /// A profile's mode is being applied for `process`.
    Applying {
        process: String,
        target: ResolutionMode,
    },
    /// `applied` is on screen because of `process`'s profile.
    Active {
        process: String,
        applied: ResolutionMode,
    },
    /// `process` lost focus; the revert timer `generation` is running.
    RevertPending {
        process: String,
        applied: ResolutionMode,
        generation: u64,
    },
    /// The revert target is being applied.
    Reverting { target: ResolutionMode },
}

/// Side effects requested by the machine, executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Call the display primitive; report back with the same ticket.
    Apply { ticket: u64, mode: ResolutionMode },
    /// Start the revert timer, replacing any running one.
    ArmTimer { generation: u64, delay: Duration },
    CancelTimer,
    Emit(ResolutionChanged),
}

/// Result of an apply call, as fed back into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The call failed; `current` is the re-queried mode, if available.
    Failed { current: Option<ResolutionMode> },
}

/// The resolution switching state machine.
#[derive(Debug)]
pub struct ResolutionMachine {
    phase: Phase,
    /// Revert target when no default is configured. Captured on the first
    /// automated change of a period, cleared when the period ends.
    baseline: Option<ResolutionMode>,
    /// Last known display mode.
    current: Option<ResolutionMode>,
    generation: u64,
    next_ticket: u64,
    in_flight: Option<u64>,
    /// Latest focus seen while an apply was in flight.
    deferred: Option<FocusState>,
    /// Automated mode the in-flight apply is replacing, and its owner.
    displaced: Option<(String, ResolutionMode)>,
}

impl ResolutionMachine {
    pub fn new(current: Option<ResolutionMode>) -> Self {
        Self {
            phase: Phase::Idle,
            baseline: None,
            current,
            generation: 0,
            next_ticket: 0,
            in_flight: None,
            deferred: None,
            displaced: None,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn baseline(&self) -> Option<ResolutionMode> {
        self.baseline
    }

    pub fn current(&self) -> Option<ResolutionMode> {
        self.current
    }

    /// Whether an apply call is outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Record a freshly queried display mode.
    pub fn observe_current(&mut self, mode: Option<ResolutionMode>) {
        if mode.is_some() {
            self.current = mode;
        }
    }

    /// A different process (or none) has focus.
    pub fn on_focus(&mut self, focus: &FocusState, config: &AutomationConfig) -> Vec<Effect> {
        if self.is_busy() {
            debug!("Apply in flight, deferring focus {}", focus);
            self.deferred = Some(focus.clone());
            return Vec::new();
        }
        self.evaluate(focus, config)
    }

    /// The revert timer tagged `generation` expired.
    pub fn on_timer(&mut self, generation: u64, config: &AutomationConfig) -> Vec<Effect> {
        match self.phase {
            Phase::RevertPending {
                generation: live, ..
            } if live == generation => {
                info!("Revert timer expired");
                self.begin_revert(config)
            }
            _ => {
                debug!("Discarding stale revert timer (generation {})", generation);
                Vec::new()
            }
        }
    }

    /// Skip the remaining revert delay. Only meaningful while a revert is pending.
    pub fn on_force_revert(&mut self, config: &AutomationConfig) -> Vec<Effect> {
        if !matches!(self.phase, Phase::RevertPending { .. }) {
            debug!("Force revert ignored in phase {:?}", self.phase);
            return Vec::new();
        }

        info!("Forcing pending revert");
        self.generation += 1;
        let mut effects = vec![Effect::CancelTimer];
        effects.extend(self.begin_revert(config));
        effects
    }

    /// An apply call issued by this machine finished.
    pub fn on_apply_finished(
        &mut self,
        ticket: u64,
        outcome: ApplyOutcome,
        config: &AutomationConfig,
    ) -> Vec<Effect> {
        if self.in_flight != Some(ticket) {
            debug!("Ignoring outcome of stale apply ticket {}", ticket);
            return Vec::new();
        }
        self.in_flight = None;
        let deferred = self.deferred.take();
        let displaced = self.displaced.take();
        let mut effects = Vec::new();

        match (std::mem::replace(&mut self.phase, Phase::Idle), outcome) {
            (Phase::Applying { process, target }, ApplyOutcome::Applied) => {
                self.current = Some(target);
                let superseded = deferred.as_ref().is_some_and(|focus| {
                    matches!(
                        self.target_for(focus, config),
                        ResolvedTarget::Profile(next) if next != target
                    )
                });

                if superseded {
                    debug!("Applied {} for {}, but focus has moved on", target, process);
                } else {
                    info!("Resolution changed to {} for {}", target, process);
                    effects.push(Effect::Emit(ResolutionChanged::changed(
                        process.clone(),
                        target,
                    )));
                }
                self.phase = Phase::Active {
                    process,
                    applied: target,
                };
            }
            (Phase::Applying { process, target }, ApplyOutcome::Failed { current }) => {
                self.observe_current(current);
                warn!(
                    "Could not apply {} for {}; display is at {}",
                    target,
                    process,
                    describe(self.current)
                );
                // The display still shows the previous automated mode, which
                // now belongs to nobody in focus.
                if let Some((owner, applied)) = displaced {
                    let applied = self.current.unwrap_or(applied);
                    let revert_to = self.revert_target(config);
                    effects.extend(self.leave_active(owner, applied, revert_to, config));
                }
            }
            (Phase::Reverting { target }, ApplyOutcome::Applied) => {
                self.current = Some(target);
                self.baseline = None;
                info!("Reverted to {}", target);
                effects.push(Effect::Emit(ResolutionChanged::reverted(target)));
            }
            (Phase::Reverting { target }, ApplyOutcome::Failed { current }) => {
                self.observe_current(current);
                self.baseline = None;
                warn!(
                    "Could not revert to {}; display is at {}",
                    target,
                    describe(self.current)
                );
            }
            (phase, _) => self.phase = phase,
        }

        if let Some(focus) = deferred {
            effects.extend(self.evaluate(&focus, config));
        }
        effects
    }

    /// A manual mode change succeeded.
    ///
    /// From `Idle` it becomes the new baseline. A pending revert is cancelled:
    /// the manual choice wins. In other phases it is an out-of-band override
    /// and automation state is left alone.
    pub fn on_manual_applied(&mut self, mode: ResolutionMode) -> Vec<Effect> {
        self.current = Some(mode);
        match self.phase {
            Phase::Idle => {
                self.baseline = Some(mode);
                Vec::new()
            }
            Phase::RevertPending { .. } => {
                info!("Manual mode {} cancels the pending revert", mode);
                self.generation += 1;
                self.phase = Phase::Idle;
                self.baseline = Some(mode);
                vec![Effect::CancelTimer]
            }
            _ => {
                debug!("Manual mode {} applied out of band", mode);
                Vec::new()
            }
        }
    }

    /// A manual mode change failed.
    pub fn on_manual_failed(&mut self, current: Option<ResolutionMode>) {
        self.observe_current(current);
    }

    /// Mode to restore when the engine stops, if automation left one applied.
    pub fn shutdown_target(&self, config: &AutomationConfig) -> Option<ResolutionMode> {
        match self.phase {
            Phase::Applying { .. } | Phase::Active { .. } | Phase::RevertPending { .. } => self
                .revert_target(config)
                .filter(|target| Some(*target) != self.current),
            Phase::Idle | Phase::Reverting { .. } => None,
        }
    }

    fn revert_target(&self, config: &AutomationConfig) -> Option<ResolutionMode> {
        config.default_profile.or(self.baseline)
    }

    fn target_for(&self, focus: &FocusState, config: &AutomationConfig) -> ResolvedTarget {
        resolve_target(
            focus.process(),
            &config.profiles,
            config.default_profile,
            self.baseline,
        )
    }

    fn evaluate(&mut self, focus: &FocusState, config: &AutomationConfig) -> Vec<Effect> {
        let target = self.target_for(focus, config);
        let focused = focus.process().unwrap_or_default().to_string();

        match (self.phase.clone(), target) {
            (Phase::Idle, ResolvedTarget::Profile(mode)) => {
                if self.current == Some(mode) {
                    debug!("{} wants {}, already active", focused, mode);
                    return Vec::new();
                }
                if self.baseline.is_none() {
                    self.baseline = self.current;
                    match self.baseline {
                        Some(baseline) => info!("Captured baseline {}", baseline),
                        None => warn!("Current mode unknown, no baseline to revert to"),
                    }
                }
                self.start_apply(focused, mode)
            }
            (Phase::Idle, _) => Vec::new(),

            (Phase::Active { process, applied }, ResolvedTarget::Profile(mode)) => {
                if mode == applied {
                    if process != focused {
                        debug!("{} shares {} with {}, keeping it", focused, mode, process);
                        self.phase = Phase::Active {
                            process: focused,
                            applied,
                        };
                    }
                    Vec::new()
                } else {
                    self.start_apply(focused, mode)
                }
            }
            (Phase::Active { process, applied }, target) => {
                self.leave_active(process, applied, target.mode(), config)
            }

            (Phase::RevertPending { applied, .. }, ResolvedTarget::Profile(mode)) => {
                self.generation += 1;
                let mut effects = vec![Effect::CancelTimer];
                if mode == applied {
                    info!("{} regained {}, revert cancelled", focused, mode);
                    self.phase = Phase::Active {
                        process: focused.clone(),
                        applied,
                    };
                    effects.push(Effect::Emit(ResolutionChanged::changed(focused, mode)));
                } else {
                    effects.extend(self.start_apply(focused, mode));
                }
                effects
            }
            (Phase::RevertPending { .. }, _) => {
                debug!("{} has no profile, revert still pending", focused);
                Vec::new()
            }

            (Phase::Applying { .. } | Phase::Reverting { .. }, _) => Vec::new(),
        }
    }

    /// `process` no longer wants `applied`: arm the revert, or settle in
    /// `Idle` when there is nothing to revert to.
    fn leave_active(
        &mut self,
        process: String,
        applied: ResolutionMode,
        revert_to: Option<ResolutionMode>,
        config: &AutomationConfig,
    ) -> Vec<Effect> {
        match revert_to {
            Some(revert_to) if revert_to != applied => {
                self.generation += 1;
                info!(
                    "{} lost focus, reverting to {} in {}ms",
                    process, revert_to, config.revert_delay
                );
                self.phase = Phase::RevertPending {
                    process: process.clone(),
                    applied,
                    generation: self.generation,
                };
                vec![
                    Effect::ArmTimer {
                        generation: self.generation,
                        delay: config.revert_delay(),
                    },
                    Effect::Emit(ResolutionChanged::revert_pending(process, Some(revert_to))),
                ]
            }
            Some(_) => {
                debug!("{} is already the revert target, nothing to revert", applied);
                self.phase = Phase::Idle;
                self.baseline = None;
                Vec::new()
            }
            None => {
                warn!("{} lost focus but no revert target is known", process);
                self.phase = Phase::Idle;
                Vec::new()
            }
        }
    }

    fn start_apply(&mut self, process: String, mode: ResolutionMode) -> Vec<Effect> {
        info!("Switching to {} for {}", mode, process);
        self.displaced = match &self.phase {
            Phase::Active { process, applied } | Phase::RevertPending { process, applied, .. } => {
                Some((process.clone(), *applied))
            }
            _ => None,
        };
        let ticket = self.issue_ticket();
        self.phase = Phase::Applying {
            process,
            target: mode,
        };
        vec![Effect::Apply { ticket, mode }]
    }

    fn begin_revert(&mut self, config: &AutomationConfig) -> Vec<Effect> {
        match self.revert_target(config) {
            Some(target) if Some(target) != self.current => {
                let ticket = self.issue_ticket();
                self.phase = Phase::Reverting { target };
                vec![Effect::Apply {
                    ticket,
                    mode: target,
                }]
            }
            Some(target) => {
                debug!("Display already at revert target {}", target);
                self.phase = Phase::Idle;
                self.baseline = None;
                vec![Effect::Emit(ResolutionChanged::reverted(target))]
            }
            None => {
                warn!("No default profile and no baseline, nothing to revert to");
                self.phase = Phase::Idle;
                Vec::new()
            }
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.in_flight = Some(self.next_ticket);
        self.next_ticket
    }
}

fn describe(mode: Option<ResolutionMode>) -> String {
    mode.map_or_else(|| "an unknown mode".to_string(), |m| m.to_string())
}

/// The controller task has exited.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Resolution controller is not running")]
pub struct ControllerStopped;

/// Commands from the command surface.
#[derive(Debug)]
pub enum ControlMessage {
    ForceRevert,
    SetResolution {
        mode: ResolutionMode,
        reply: oneshot::Sender<Result<(), DisplayError>>,
    },
}

/// Cheap handle for sending commands to the controller task.
#[derive(Debug, Clone)]
pub struct ResolutionHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl ResolutionHandle {
    pub async fn force_revert(&self) -> Result<(), ControllerStopped> {
        self.tx
            .send(ControlMessage::ForceRevert)
            .await
            .map_err(|_| ControllerStopped)
    }

    /// Apply `mode` directly, bypassing automation.
    pub async fn set_resolution(
        &self,
        mode: ResolutionMode,
    ) -> Result<Result<(), DisplayError>, ControllerStopped> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlMessage::SetResolution { mode, reply })
            .await
            .map_err(|_| ControllerStopped)?;
        rx.await.map_err(|_| ControllerStopped)
    }
}

/// Messages the controller sends itself from timers and blocking calls.
enum Internal {
    TimerFired(u64),
    ApplyFinished {
        ticket: u64,
        outcome: ApplyOutcome,
    },
    ManualFinished {
        mode: ResolutionMode,
        result: Result<(), DisplayError>,
        current: Option<ResolutionMode>,
        reply: oneshot::Sender<Result<(), DisplayError>>,
    },
}

/// The task that owns a [`ResolutionMachine`].
pub struct ResolutionController {
    machine: ResolutionMachine,
    display: Arc<dyn DisplayBackend>,
    events: EventBus,
    focus: watch::Receiver<FocusState>,
    config: watch::Receiver<Arc<AppConfig>>,
    commands: mpsc::Receiver<ControlMessage>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    timer: Option<JoinHandle<()>>,
    last_focus: FocusState,
}

impl ResolutionController {
    pub fn new(
        display: Arc<dyn DisplayBackend>,
        events: EventBus,
        focus: watch::Receiver<FocusState>,
        config: watch::Receiver<Arc<AppConfig>>,
        current: Option<ResolutionMode>,
    ) -> (Self, ResolutionHandle) {
        let (tx, commands) = mpsc::channel(16);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let controller = Self {
            machine: ResolutionMachine::new(current),
            display,
            events,
            focus,
            config,
            commands,
            internal_tx,
            internal_rx,
            timer: None,
            last_focus: FocusState::Unknown,
        };
        (controller, ResolutionHandle { tx })
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!("Resolution controller started");
        let mut focus_open = true;
        let mut config_open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = self.focus.changed(), if focus_open => {
                    if changed.is_err() {
                        warn!("Focus monitor stopped, treating focus as unknown");
                        focus_open = false;
                        self.handle_focus(FocusState::Unknown).await;
                        continue;
                    }
                    let focus = self.focus.borrow_and_update().clone();
                    self.handle_focus(focus).await;
                }
                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    self.config.borrow_and_update();
                    debug!("Config changed, re-evaluating {}", self.last_focus);
                    self.evaluate_focus().await;
                }
                Some(message) = self.commands.recv() => self.handle_command(message),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
            }
        }

        self.shutdown().await;
    }

    /// Window moves within the same process are not transitions here.
    async fn handle_focus(&mut self, focus: FocusState) {
        let same_process = focus.process() == self.last_focus.process();
        self.last_focus = focus;
        if !same_process {
            self.evaluate_focus().await;
        }
    }

    async fn evaluate_focus(&mut self) {
        if *self.machine.phase() == Phase::Idle && !self.machine.is_busy() {
            // Idle is where the baseline gets captured, so ask the display.
            let display = Arc::clone(&self.display);
            let current =
                tokio::task::spawn_blocking(move || query_current_with_retry(display.as_ref()))
                    .await
                    .ok()
                    .flatten();
            self.machine.observe_current(current);
        }

        let config = self.snapshot();
        let effects = self.machine.on_focus(&self.last_focus, &config.automation);
        self.execute(effects);
    }

    fn handle_command(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::ForceRevert => {
                let config = self.snapshot();
                let effects = self.machine.on_force_revert(&config.automation);
                self.execute(effects);
            }
            ControlMessage::SetResolution { mode, reply } => {
                info!("Manual resolution change to {}", mode);
                let display = Arc::clone(&self.display);
                let tx = self.internal_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let result = display.apply_mode(mode);
                    let current = if result.is_ok() {
                        Some(mode)
                    } else {
                        query_current_with_retry(display.as_ref())
                    };
                    let _ = tx.send(Internal::ManualFinished {
                        mode,
                        result,
                        current,
                        reply,
                    });
                });
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        let config = self.snapshot();
        match internal {
            Internal::TimerFired(generation) => {
                let effects = self.machine.on_timer(generation, &config.automation);
                self.execute(effects);
            }
            Internal::ApplyFinished { ticket, outcome } => {
                let effects = self
                    .machine
                    .on_apply_finished(ticket, outcome, &config.automation);
                self.execute(effects);
            }
            Internal::ManualFinished {
                mode,
                result,
                current,
                reply,
            } => {
                match &result {
                    Ok(()) => {
                        let effects = self.machine.on_manual_applied(mode);
                        self.execute(effects);
                    }
                    Err(e) => {
                        warn!("Manual resolution change failed: {}", e);
                        self.machine.on_manual_failed(current);
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Apply { ticket, mode } => {
                    let display = Arc::clone(&self.display);
                    let tx = self.internal_tx.clone();
                    tokio::task::spawn_blocking(move || {
                        let outcome = apply_blocking(display.as_ref(), mode);
                        let _ = tx.send(Internal::ApplyFinished { ticket, outcome });
                    });
                }
                Effect::ArmTimer { generation, delay } => {
                    self.cancel_timer();
                    let tx = self.internal_tx.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Internal::TimerFired(generation));
                    }));
                }
                Effect::CancelTimer => self.cancel_timer(),
                Effect::Emit(event) => self.events.publish_resolution(event),
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn snapshot(&self) -> Arc<AppConfig> {
        self.config.borrow().clone()
    }

    async fn shutdown(&mut self) {
        self.cancel_timer();
        let config = self.snapshot();
        if let Some(target) = self.machine.shutdown_target(&config.automation) {
            info!("Restoring {} before exit", target);
            let display = Arc::clone(&self.display);
            let result = tokio::task::spawn_blocking(move || display.apply_mode(target)).await;
            if let Ok(Err(e)) = result {
                warn!("Could not restore {}: {}", target, e);
            }
        }
        info!("Resolution controller stopped");
    }
}

fn apply_blocking(display: &dyn DisplayBackend, mode: ResolutionMode) -> ApplyOutcome {
    match display.apply_mode(mode) {
        Ok(()) => ApplyOutcome::Applied,
        Err(e) => {
            warn!("{}", e);
            ApplyOutcome::Failed {
                current: query_current_with_retry(display),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionProfile;
    use crate::domain::Rect;
    use crate::events::ResolutionStatus;
    use crate::test_utils::FakeDisplay;
    use tokio::sync::broadcast::error::TryRecvError;

    const BASE: ResolutionMode = ResolutionMode::new(2560, 1440, 60);
    const GAME: ResolutionMode = ResolutionMode::new(1920, 1080, 144);
    const RETRO: ResolutionMode = ResolutionMode::new(1024, 768, 60);
    const DEFAULT: ResolutionMode = ResolutionMode::new(1920, 1080, 60);

    fn config() -> AutomationConfig {
        AutomationConfig {
            revert_delay: 5000,
            default_profile: None,
            mouse_lock: Vec::new(),
            profiles: vec![
                ResolutionProfile::new("game.exe", GAME),
                ResolutionProfile::new("launcher.exe", GAME),
                ResolutionProfile::new("retro.exe", RETRO),
            ],
        }
    }

    fn focus(process: &str) -> FocusState {
        FocusState::focused(process, Rect::new(0, 0, 800, 600))
    }

    fn applied_modes(effects: &[Effect]) -> Vec<ResolutionMode> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Apply { mode, .. } => Some(*mode),
                _ => None,
            })
            .collect()
    }

    fn ticket(effects: &[Effect]) -> u64 {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Apply { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .expect("apply effect")
    }

    fn armed_generation(effects: &[Effect]) -> u64 {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::ArmTimer { generation, .. } => Some(*generation),
                _ => None,
            })
            .expect("timer effect")
    }

    fn emitted(effects: &[Effect]) -> Vec<ResolutionChanged> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Machine in `Active` for game.exe at `GAME`.
    fn active_machine(cfg: &AutomationConfig) -> ResolutionMachine {
        let mut machine = ResolutionMachine::new(Some(BASE));
        let effects = machine.on_focus(&focus("game.exe"), cfg);
        machine.on_apply_finished(ticket(&effects), ApplyOutcome::Applied, cfg);
        assert!(matches!(machine.phase(), Phase::Active { .. }));
        machine
    }

    /// Machine in `RevertPending` after game.exe lost focus; returns the timer generation.
    fn pending_machine(cfg: &AutomationConfig) -> (ResolutionMachine, u64) {
        let mut machine = active_machine(cfg);
        let effects = machine.on_focus(&focus("explorer.exe"), cfg);
        let generation = armed_generation(&effects);
        (machine, generation)
    }

    #[test]
    fn test_idle_to_active_captures_baseline() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(BASE));

        let effects = machine.on_focus(&focus("game.exe"), &cfg);
        assert_eq!(applied_modes(&effects), vec![GAME]);
        assert_eq!(machine.baseline(), Some(BASE));
        assert!(matches!(machine.phase(), Phase::Applying { .. }));

        let effects = machine.on_apply_finished(ticket(&effects), ApplyOutcome::Applied, &cfg);
        assert_eq!(
            emitted(&effects),
            vec![ResolutionChanged::changed("game.exe", GAME)]
        );
        assert_eq!(
            machine.phase(),
            &Phase::Active {
                process: "game.exe".to_string(),
                applied: GAME
            }
        );
        assert_eq!(machine.current(), Some(GAME));
    }

    #[test]
    fn test_idle_ignores_unmatched_and_already_active() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(GAME));

        assert!(machine.on_focus(&focus("explorer.exe"), &cfg).is_empty());
        assert!(machine.on_focus(&FocusState::Unknown, &cfg).is_empty());
        assert!(machine.on_focus(&focus("game.exe"), &cfg).is_empty());
        assert_eq!(machine.phase(), &Phase::Idle);
    }

    #[test]
    fn test_idle_ignores_default_profile() {
        let mut cfg = config();
        cfg.default_profile = Some(DEFAULT);
        let mut machine = ResolutionMachine::new(Some(BASE));

        assert!(machine.on_focus(&focus("explorer.exe"), &cfg).is_empty());
        assert_eq!(machine.phase(), &Phase::Idle);
    }

    #[test]
    fn test_apply_failure_returns_to_idle() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(BASE));

        let effects = machine.on_focus(&focus("game.exe"), &cfg);
        let effects = machine.on_apply_finished(
            ticket(&effects),
            ApplyOutcome::Failed {
                current: Some(BASE),
            },
            &cfg,
        );

        assert!(effects.is_empty());
        assert_eq!(machine.phase(), &Phase::Idle);
        assert_eq!(machine.current(), Some(BASE));

        // The next focus event re-attempts.
        let effects = machine.on_focus(&focus("game.exe"), &cfg);
        assert_eq!(applied_modes(&effects), vec![GAME]);
    }

    #[test]
    fn test_shared_mode_stays_active_without_apply() {
        let cfg = config();
        let mut machine = active_machine(&cfg);

        let effects = machine.on_focus(&focus("launcher.exe"), &cfg);
        assert!(effects.is_empty());
        assert_eq!(
            machine.phase(),
            &Phase::Active {
                process: "launcher.exe".to_string(),
                applied: GAME
            }
        );
    }

    #[test]
    fn test_switch_between_profiles_keeps_baseline() {
        let cfg = config();
        let mut machine = active_machine(&cfg);

        let effects = machine.on_focus(&focus("retro.exe"), &cfg);
        assert_eq!(applied_modes(&effects), vec![RETRO]);
        machine.on_apply_finished(ticket(&effects), ApplyOutcome::Applied, &cfg);

        assert_eq!(machine.baseline(), Some(BASE));
        assert_eq!(machine.current(), Some(RETRO));
    }

    #[test]
    fn test_lost_focus_arms_revert() {
        let cfg = config();
        let mut machine = active_machine(&cfg);

        let effects = machine.on_focus(&focus("explorer.exe"), &cfg);
        assert_eq!(
            effects[0],
            Effect::ArmTimer {
                generation: 1,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            emitted(&effects),
            vec![ResolutionChanged::revert_pending("game.exe", Some(BASE))]
        );
        assert!(applied_modes(&effects).is_empty());
        assert!(matches!(machine.phase(), Phase::RevertPending { .. }));
    }

    #[test]
    fn test_unknown_focus_arms_revert() {
        let cfg = config();
        let mut machine = active_machine(&cfg);

        let effects = machine.on_focus(&FocusState::Unknown, &cfg);
        assert_eq!(armed_generation(&effects), 1);
    }

    #[test]
    fn test_timer_expiry_reverts_to_baseline() {
        let cfg = config();
        let (mut machine, generation) = pending_machine(&cfg);

        let effects = machine.on_timer(generation, &cfg);
        assert_eq!(applied_modes(&effects), vec![BASE]);
        assert_eq!(machine.phase(), &Phase::Reverting { target: BASE });

        let effects = machine.on_apply_finished(ticket(&effects), ApplyOutcome::Applied, &cfg);
        assert_eq!(emitted(&effects), vec![ResolutionChanged::reverted(BASE)]);
        assert_eq!(machine.phase(), &Phase::Idle);
        assert_eq!(machine.baseline(), None);
    }

    #[test]
    fn test_revert_prefers_default_profile() {
        let mut cfg = config();
        cfg.default_profile = Some(DEFAULT);
        let (mut machine, generation) = pending_machine(&cfg);

        let effects = machine.on_timer(generation, &cfg);
        assert_eq!(applied_modes(&effects), vec![DEFAULT]);
    }

    #[test]
    fn test_revert_failure_still_idles() {
        let cfg = config();
        let (mut machine, generation) = pending_machine(&cfg);

        let effects = machine.on_timer(generation, &cfg);
        let effects = machine.on_apply_finished(
            ticket(&effects),
            ApplyOutcome::Failed {
                current: Some(GAME),
            },
            &cfg,
        );

        assert!(emitted(&effects).is_empty());
        assert_eq!(machine.phase(), &Phase::Idle);
        assert_eq!(machine.current(), Some(GAME));
    }

    #[test]
    fn test_stale_timer_is_discarded() {
        let cfg = config();
        let (mut machine, generation) = pending_machine(&cfg);

        // Regain focus, then lose it again: a new timer replaces the old one.
        machine.on_focus(&focus("game.exe"), &cfg);
        let effects = machine.on_focus(&focus("explorer.exe"), &cfg);
        let live = armed_generation(&effects);
        assert_ne!(live, generation);

        assert!(machine.on_timer(generation, &cfg).is_empty());
        assert!(matches!(machine.phase(), Phase::RevertPending { .. }));
        assert_eq!(applied_modes(&machine.on_timer(live, &cfg)), vec![BASE]);
    }

    #[test]
    fn test_force_revert_skips_timer() {
        let cfg = config();
        let (mut machine, generation) = pending_machine(&cfg);

        let effects = machine.on_force_revert(&cfg);
        assert_eq!(effects[0], Effect::CancelTimer);
        assert_eq!(applied_modes(&effects), vec![BASE]);

        let effects = machine.on_apply_finished(ticket(&effects), ApplyOutcome::Applied, &cfg);
        assert_eq!(emitted(&effects), vec![ResolutionChanged::reverted(BASE)]);
        assert_eq!(machine.phase(), &Phase::Idle);

        // The original timer firing late does nothing.
        assert!(machine.on_timer(generation, &cfg).is_empty());
    }

    #[test]
    fn test_force_revert_is_noop_outside_pending() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(BASE));
        assert!(machine.on_force_revert(&cfg).is_empty());

        let mut machine = active_machine(&cfg);
        assert!(machine.on_force_revert(&cfg).is_empty());
        assert!(matches!(machine.phase(), Phase::Active { .. }));
    }

    #[test]
    fn test_refocus_cancels_revert_without_apply() {
        let cfg = config();
        let (mut machine, generation) = pending_machine(&cfg);

        let effects = machine.on_focus(&focus("game.exe"), &cfg);
        assert_eq!(effects[0], Effect::CancelTimer);
        assert!(applied_modes(&effects).is_empty());
        assert_eq!(
            emitted(&effects),
            vec![ResolutionChanged::changed("game.exe", GAME)]
        );
        assert!(matches!(machine.phase(), Phase::Active { .. }));
        assert!(machine.on_timer(generation, &cfg).is_empty());
    }

    #[test]
    fn test_other_profile_during_pending_applies_new_target() {
        let cfg = config();
        let (mut machine, _) = pending_machine(&cfg);

        let effects = machine.on_focus(&focus("retro.exe"), &cfg);
        assert_eq!(effects[0], Effect::CancelTimer);
        assert_eq!(applied_modes(&effects), vec![RETRO]);
        assert_eq!(machine.baseline(), Some(BASE));
    }

    #[test]
    fn test_unmatched_focus_during_pending_keeps_timer() {
        let cfg = config();
        let (mut machine, generation) = pending_machine(&cfg);

        assert!(machine.on_focus(&focus("browser.exe"), &cfg).is_empty());
        assert!(machine.on_focus(&FocusState::Unknown, &cfg).is_empty());
        assert_eq!(applied_modes(&machine.on_timer(generation, &cfg)), vec![BASE]);
    }

    #[test]
    fn test_focus_during_apply_is_deferred() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(BASE));

        let first = machine.on_focus(&focus("game.exe"), &cfg);
        assert!(machine.on_focus(&focus("retro.exe"), &cfg).is_empty());

        // The stale apply completes: no event for it, the newer target is applied.
        let effects = machine.on_apply_finished(ticket(&first), ApplyOutcome::Applied, &cfg);
        assert!(emitted(&effects).is_empty());
        assert_eq!(applied_modes(&effects), vec![RETRO]);

        let effects = machine.on_apply_finished(ticket(&effects), ApplyOutcome::Applied, &cfg);
        assert_eq!(
            emitted(&effects),
            vec![ResolutionChanged::changed("retro.exe", RETRO)]
        );
    }

    #[test]
    fn test_deferred_unmatched_focus_reports_then_arms_revert() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(BASE));

        let first = machine.on_focus(&focus("game.exe"), &cfg);
        machine.on_focus(&focus("explorer.exe"), &cfg);

        let effects = machine.on_apply_finished(ticket(&first), ApplyOutcome::Applied, &cfg);
        let statuses: Vec<ResolutionStatus> = emitted(&effects).iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![ResolutionStatus::Changed, ResolutionStatus::RevertPending]
        );
    }

    #[test]
    fn test_stale_ticket_is_ignored() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(BASE));
        let effects = machine.on_focus(&focus("game.exe"), &cfg);

        assert!(
            machine
                .on_apply_finished(ticket(&effects) + 10, ApplyOutcome::Applied, &cfg)
                .is_empty()
        );
        assert!(machine.is_busy());
    }

    #[test]
    fn test_failed_switch_from_active_arms_revert() {
        let cfg = config();
        let mut machine = active_machine(&cfg);

        let effects = machine.on_focus(&focus("retro.exe"), &cfg);
        let effects = machine.on_apply_finished(
            ticket(&effects),
            ApplyOutcome::Failed {
                current: Some(GAME),
            },
            &cfg,
        );

        let generation = armed_generation(&effects);
        assert_eq!(
            emitted(&effects),
            vec![ResolutionChanged::revert_pending("game.exe", Some(BASE))]
        );
        assert_eq!(
            machine.phase(),
            &Phase::RevertPending {
                process: "game.exe".to_string(),
                applied: GAME,
                generation,
            }
        );
        assert_eq!(machine.shutdown_target(&cfg), Some(BASE));

        // Unmatched focus leaves the timer running; expiry restores the baseline.
        assert!(machine.on_focus(&focus("explorer.exe"), &cfg).is_empty());
        let effects = machine.on_timer(generation, &cfg);
        assert_eq!(applied_modes(&effects), vec![BASE]);
    }

    #[test]
    fn test_failed_switch_from_pending_rearms_timer() {
        let cfg = config();
        let (mut machine, old_generation) = pending_machine(&cfg);

        let effects = machine.on_focus(&focus("retro.exe"), &cfg);
        assert_eq!(effects[0], Effect::CancelTimer);
        let effects = machine.on_apply_finished(
            ticket(&effects),
            ApplyOutcome::Failed {
                current: Some(GAME),
            },
            &cfg,
        );

        let generation = armed_generation(&effects);
        assert_ne!(generation, old_generation);
        assert!(matches!(machine.phase(), Phase::RevertPending { .. }));
        assert!(machine.on_timer(old_generation, &cfg).is_empty());
        assert_eq!(applied_modes(&machine.on_timer(generation, &cfg)), vec![BASE]);
    }

    #[test]
    fn test_default_equal_to_applied_ends_period_quietly() {
        let mut cfg = config();
        cfg.default_profile = Some(GAME);
        let mut machine = active_machine(&cfg);
        assert_eq!(machine.baseline(), Some(BASE));

        let effects = machine.on_focus(&focus("explorer.exe"), &cfg);

        assert!(effects.is_empty());
        assert_eq!(machine.phase(), &Phase::Idle);
        assert_eq!(machine.baseline(), None);
        assert_eq!(machine.shutdown_target(&cfg), None);
    }

    #[test]
    fn test_manual_in_idle_sets_baseline() {
        let cfg = config();
        let mut machine = ResolutionMachine::new(Some(BASE));

        assert!(machine.on_manual_applied(DEFAULT).is_empty());
        assert_eq!(machine.baseline(), Some(DEFAULT));

        // The next automated period reverts to the manual mode.
        let effects = machine.on_focus(&focus("game.exe"), &cfg);
        machine.on_apply_finished(ticket(&effects), ApplyOutcome::Applied, &cfg);
        let effects = machine.on_focus(&focus("explorer.exe"), &cfg);
        let effects = machine.on_timer(armed_generation(&effects), &cfg);
        assert_eq!(applied_modes(&effects), vec![DEFAULT]);
    }

    #[test]
    fn test_manual_cancels_pending_revert() {
        let cfg = config();
        let (mut machine, generation) = pending_machine(&cfg);

        assert_eq!(machine.on_manual_applied(RETRO), vec![Effect::CancelTimer]);
        assert_eq!(machine.phase(), &Phase::Idle);
        assert_eq!(machine.baseline(), Some(RETRO));
        assert!(machine.on_timer(generation, &cfg).is_empty());
    }

    #[test]
    fn test_manual_while_active_is_out_of_band() {
        let cfg = config();
        let mut machine = active_machine(&cfg);

        assert!(machine.on_manual_applied(RETRO).is_empty());
        assert!(matches!(machine.phase(), Phase::Active { .. }));
        assert_eq!(machine.baseline(), Some(BASE));
        assert_eq!(machine.current(), Some(RETRO));
    }

    #[test]
    fn test_shutdown_target() {
        let cfg = config();
        assert_eq!(ResolutionMachine::new(Some(BASE)).shutdown_target(&cfg), None);
        assert_eq!(active_machine(&cfg).shutdown_target(&cfg), Some(BASE));
        assert_eq!(pending_machine(&cfg).0.shutdown_target(&cfg), Some(BASE));
    }

    struct Harness {
        display: Arc<FakeDisplay>,
        focus_tx: watch::Sender<FocusState>,
        _config_tx: watch::Sender<Arc<AppConfig>>,
        events: tokio::sync::broadcast::Receiver<ResolutionChanged>,
        handle: ResolutionHandle,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn harness(automation: AutomationConfig) -> Harness {
        let display = Arc::new(FakeDisplay::new(BASE));
        let bus = EventBus::new();
        let events = bus.subscribe_resolution();
        let (focus_tx, focus_rx) = watch::channel(FocusState::Unknown);
        let (config_tx, config_rx) = watch::channel(Arc::new(AppConfig {
            automation,
            ..AppConfig::default()
        }));
        let (controller, handle) =
            ResolutionController::new(display.clone(), bus, focus_rx, config_rx, Some(BASE));
        let cancel = CancellationToken::new();
        let task = controller.spawn(cancel.clone());

        Harness {
            display,
            focus_tx,
            _config_tx: config_tx,
            events,
            handle,
            cancel,
            task,
        }
    }

    impl Harness {
        async fn next_event(&mut self) -> ResolutionChanged {
            tokio::time::timeout(Duration::from_secs(60), self.events.recv())
                .await
                .expect("event timeout")
                .expect("event channel open")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_revert_after_delay() {
        let mut h = harness(config());

        h.focus_tx.send_replace(focus("game.exe"));
        assert_eq!(
            serde_json::to_value(h.next_event().await).unwrap(),
            serde_json::json!({"status": "changed", "process": "game.exe", "resolution": "1920x1080@144"})
        );

        h.focus_tx.send_replace(focus("explorer.exe"));
        let pending = h.next_event().await;
        assert_eq!(pending.status, ResolutionStatus::RevertPending);
        let started = tokio::time::Instant::now();

        let reverted = h.next_event().await;
        assert_eq!(reverted, ResolutionChanged::reverted(BASE));
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(h.display.applied(), vec![GAME, BASE]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refocus_before_expiry_issues_no_revert() {
        let mut h = harness(config());

        h.focus_tx.send_replace(focus("game.exe"));
        h.next_event().await;
        h.focus_tx.send_replace(focus("explorer.exe"));
        assert_eq!(h.next_event().await.status, ResolutionStatus::RevertPending);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        h.focus_tx.send_replace(focus("game.exe"));
        assert_eq!(h.next_event().await, ResolutionChanged::changed("game.exe", GAME));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.display.applied(), vec![GAME]);
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_revert_command() {
        let mut h = harness(config());

        h.focus_tx.send_replace(focus("game.exe"));
        h.next_event().await;
        h.focus_tx.send_replace(focus("explorer.exe"));
        h.next_event().await;

        let started = tokio::time::Instant::now();
        h.handle.force_revert().await.unwrap();
        assert_eq!(h.next_event().await, ResolutionChanged::reverted(BASE));
        assert!(started.elapsed() < Duration::from_millis(5000));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_reverts_on_next_tick() {
        let mut cfg = config();
        cfg.revert_delay = 0;
        let mut h = harness(cfg);

        h.focus_tx.send_replace(focus("game.exe"));
        h.next_event().await;
        h.focus_tx.send_replace(focus("explorer.exe"));
        assert_eq!(h.next_event().await.status, ResolutionStatus::RevertPending);
        assert_eq!(h.next_event().await, ResolutionChanged::reverted(BASE));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_mode_stays_idle() {
        let mut h = harness(config());
        h.display.reject(GAME);

        h.focus_tx.send_replace(focus("game.exe"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
        assert!(h.display.applied().is_empty());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_switch_still_reverts_previous_mode() {
        let mut h = harness(config());
        h.display.reject(RETRO);

        h.focus_tx.send_replace(focus("game.exe"));
        assert_eq!(
            h.next_event().await,
            ResolutionChanged::changed("game.exe", GAME)
        );

        h.focus_tx.send_replace(focus("retro.exe"));
        assert_eq!(
            h.next_event().await,
            ResolutionChanged::revert_pending("game.exe", Some(BASE))
        );
        assert_eq!(h.next_event().await, ResolutionChanged::reverted(BASE));
        assert_eq!(h.display.applied(), vec![GAME, BASE]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_set_cancels_pending_revert() {
        let mut h = harness(config());

        h.focus_tx.send_replace(focus("game.exe"));
        h.next_event().await;
        h.focus_tx.send_replace(focus("explorer.exe"));
        h.next_event().await;

        h.handle.set_resolution(RETRO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.display.applied(), vec![GAME, RETRO]);
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_set_reports_rejection() {
        let h = harness(config());
        h.display.reject(RETRO);

        let result = h.handle.set_resolution(RETRO).await.unwrap();
        assert!(matches!(result, Err(DisplayError::Rejected { .. })));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_restores_baseline() {
        let mut h = harness(config());

        h.focus_tx.send_replace(focus("game.exe"));
        h.next_event().await;

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.display.applied(), vec![GAME, BASE]);
        assert_eq!(h.display.current_mode(), Ok(BASE));
    }
}
