//! Focus monitor.
//!
//! Polls a [`FocusProbe`] at a fixed interval and publishes the foreground
//! state on a `watch` channel. Only real changes are published: a different
//! process (a focus transition) or the same process with a moved or resized
//! window. Probe failures back off exponentially and are never surfaced; a
//! run of failures degrades the published state to [`FocusState::Unknown`].

use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::domain::FocusState;

/// Errors from a focus probe.
#[derive(Error, Debug, Clone)]
pub enum FocusError {
    #[error("Display connection failed: {0}")]
    Connection(String),

    #[error("Foreground query failed: {0}")]
    Query(String),
}

/// The OS process/window introspection primitive.
pub trait FocusProbe: Send {
    /// Which process owns the focused top-level window, and where it is.
    ///
    /// Returns `FocusState::Unknown` when nothing identifiable has focus.
    fn foreground(&mut self) -> Result<FocusState, FocusError>;
}

/// A published change of the foreground state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusTransition {
    /// A different process (or no process) now has focus.
    Changed(FocusState),
    /// Same process, but its window rectangle changed.
    Moved(FocusState),
}

impl FocusTransition {
    pub fn state(&self) -> &FocusState {
        match self {
            Self::Changed(state) | Self::Moved(state) => state,
        }
    }
}

/// Deduplicates raw foreground observations into transitions.
#[derive(Debug, Default)]
pub struct FocusTracker {
    current: FocusState,
}

impl FocusTracker {
    pub fn current(&self) -> &FocusState {
        &self.current
    }

    /// Record an observation; returns a transition if anything changed.
    pub fn observe(&mut self, next: FocusState) -> Option<FocusTransition> {
        if next == self.current {
            return None;
        }

        let same_process = next.process().is_some() && next.process() == self.current.process();
        self.current = next.clone();

        Some(if same_process {
            FocusTransition::Moved(next)
        } else {
            FocusTransition::Changed(next)
        })
    }
}

/// Polling and backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Delay between polls while the probe is healthy.
    pub interval: Duration,
    /// Upper bound on the delay after repeated failures.
    pub max_backoff: Duration,
    /// Consecutive failures after which focus is reported as unknown.
    pub failures_before_unknown: u32,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            failures_before_unknown: 5,
        }
    }
}

/// Polls a probe and publishes deduplicated focus state.
pub struct FocusMonitor {
    probe: Option<Box<dyn FocusProbe>>,
    options: MonitorOptions,
    tracker: FocusTracker,
    failures: u32,
}

impl FocusMonitor {
    pub fn new(probe: Box<dyn FocusProbe>, options: MonitorOptions) -> Self {
        Self {
            probe: Some(probe),
            options,
            tracker: FocusTracker::default(),
            failures: 0,
        }
    }

    /// Feed one probe result; returns the transition to publish (if any) and
    /// the delay before the next poll.
    pub fn step(
        &mut self,
        result: Result<FocusState, FocusError>,
    ) -> (Option<FocusTransition>, Duration) {
        match result {
            Ok(state) => {
                if self.failures >= self.options.failures_before_unknown {
                    info!("Focus probe recovered after {} failures", self.failures);
                }
                self.failures = 0;
                (self.tracker.observe(state), self.options.interval)
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                let backoff = self
                    .options
                    .interval
                    .saturating_mul(2u32.saturating_pow(self.failures))
                    .min(self.options.max_backoff);

                if self.failures == self.options.failures_before_unknown {
                    warn!(
                        "Focus probe failed {} times in a row ({}); treating focus as unknown",
                        self.failures, e
                    );
                    (self.tracker.observe(FocusState::Unknown), backoff)
                } else {
                    debug!("Focus probe failed ({}), retrying in {:?}", e, backoff);
                    (None, backoff)
                }
            }
        }
    }

    /// Start polling on the runtime.
    ///
    /// The returned receiver always holds the latest state; the task stops
    /// when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> (watch::Receiver<FocusState>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(FocusState::Unknown);
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    async fn run(mut self, tx: watch::Sender<FocusState>, cancel: CancellationToken) {
        info!(
            "Focus monitor started, polling every {:?}",
            self.options.interval
        );

        loop {
            let Some(result) = self.poll_probe().await else {
                error!("Focus probe panicked, stopping focus monitor");
                tx.send_replace(FocusState::Unknown);
                return;
            };

            let (transition, delay) = self.step(result);
            match transition {
                Some(transition) => {
                    if matches!(transition, FocusTransition::Moved(_)) {
                        debug!("Focused window moved: {}", transition.state());
                    } else {
                        info!("Focus changed: {}", transition.state());
                    }
                    tx.send_replace(transition.state().clone());
                }
                None => trace!("Focus unchanged"),
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Focus monitor stopped");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run the blocking probe off the async workers, handing it back after.
    async fn poll_probe(&mut self) -> Option<Result<FocusState, FocusError>> {
        let mut probe = self.probe.take()?;
        let (probe, result) = tokio::task::spawn_blocking(move || {
            let result = probe.foreground();
            (probe, result)
        })
        .await
        .ok()?;
        self.probe = Some(probe);
        Some(result)
    }
}

/// Turn a focus receiver into a stream of process-level transitions.
///
/// Window moves within the same process are skipped. The stream ends when
/// the monitor stops.
pub fn transitions(rx: watch::Receiver<FocusState>) -> impl Stream<Item = FocusState> {
    futures_util::stream::unfold(
        (rx, FocusTracker::default()),
        |(mut rx, mut tracker)| async move {
            loop {
                rx.changed().await.ok()?;
                let state = rx.borrow_and_update().clone();
                if let Some(FocusTransition::Changed(state)) = tracker.observe(state) {
                    return Some((state, (rx, tracker)));
                }
            }
        },
    )
}
