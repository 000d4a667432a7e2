//! Engine wiring and the command surface.
//!
//! [`Engine::start`] spawns the focus monitor and both controllers on the
//! current runtime and returns the handle the presentation layer talks to.
//! Everything the presentation layer can do goes through the methods here.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::Backends;
use crate::config::AppConfig;
use crate::config::ConfigError;
use crate::config::ConfigStore;
use crate::display::DisplayBackend;
use crate::display::DisplayError;
use crate::display::query_current_with_retry;
use crate::domain::ProcessInfo;
use crate::domain::ResolutionMode;
use crate::events::EventBus;
use crate::events::MouseLockChanged;
use crate::events::ResolutionChanged;
use crate::focus::FocusMonitor;
use crate::focus::MonitorOptions;
use crate::mouse_lock::MouseLockController;
use crate::processes::ProcessTable;
use crate::resolution::ControllerStopped;
use crate::resolution::ResolutionController;
use crate::resolution::ResolutionHandle;

/// Errors returned by engine commands.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Display(#[from] DisplayError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine has stopped")]
    Stopped,
}

impl From<ControllerStopped> for EngineError {
    fn from(_: ControllerStopped) -> Self {
        Self::Stopped
    }
}

/// Version of this build.
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// A running engine.
pub struct Engine {
    config: ConfigStore,
    display: Arc<dyn DisplayBackend>,
    processes: Arc<ProcessTable>,
    events: EventBus,
    resolution: ResolutionHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Start focus monitoring and both controllers.
    pub async fn start(
        config: ConfigStore,
        backends: Backends,
        processes: Arc<ProcessTable>,
        options: MonitorOptions,
    ) -> Self {
        let Backends {
            display,
            cursor,
            focus,
        } = backends;
        let events = EventBus::new();
        let cancel = CancellationToken::new();

        let current = run_display(&display, |d| Ok(query_current_with_retry(d)))
            .await
            .ok()
            .flatten();
        match current {
            Some(mode) => info!("Display is at {}", mode),
            None => warn!("Could not determine the current display mode"),
        }

        let (focus_rx, monitor) = FocusMonitor::new(focus, options).spawn(cancel.clone());

        let (controller, resolution) = ResolutionController::new(
            Arc::clone(&display),
            events.clone(),
            focus_rx.clone(),
            config.subscribe(),
            current,
        );
        let resolution_task = controller.spawn(cancel.clone());

        let mouse_lock_task =
            MouseLockController::new(cursor, events.clone(), focus_rx, config.subscribe())
                .spawn(cancel.clone());

        info!("Engine started");
        Self {
            config,
            display,
            processes,
            events,
            resolution,
            cancel,
            tasks: vec![monitor, resolution_task, mouse_lock_task],
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.get()
    }

    /// Replace the config. Both controllers re-evaluate the current focus.
    pub fn save_config(&self, config: AppConfig) -> Result<(), EngineError> {
        self.config.save(config)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        self.config.path()
    }

    /// Running processes, largest memory first. Best-effort, never fails.
    pub async fn fetch_processes(&self) -> Vec<ProcessInfo> {
        let processes = Arc::clone(&self.processes);
        tokio::task::spawn_blocking(move || processes.snapshot())
            .await
            .unwrap_or_default()
    }

    /// Modes the display supports.
    pub async fn get_resolutions(&self) -> Result<Vec<ResolutionMode>, EngineError> {
        Ok(run_display(&self.display, |d| d.supported_modes()).await?)
    }

    /// Current mode, or `None` if the display cannot tell.
    pub async fn get_current_res(&self) -> Option<ResolutionMode> {
        run_display(&self.display, |d| Ok(query_current_with_retry(d)))
            .await
            .ok()
            .flatten()
    }

    /// Apply a mode directly, outside automation.
    pub async fn set_resolution(
        &self,
        width: u32,
        height: u32,
        frequency: u32,
    ) -> Result<(), EngineError> {
        let mode = ResolutionMode::new(width, height, frequency);
        self.resolution.set_resolution(mode).await??;
        Ok(())
    }

    /// Revert now instead of waiting for the revert delay.
    pub async fn force_revert(&self) -> Result<(), EngineError> {
        self.resolution.force_revert().await?;
        Ok(())
    }

    /// Open the config directory in the desktop file manager.
    pub async fn open_config_folder(&self) {
        let Some(dir) = self.config.path().parent() else {
            return;
        };
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Could not create {}: {}", dir.display(), e);
            return;
        }

        debug!("Opening {}", dir.display());
        if let Err(e) = Command::new("xdg-open").arg(dir).spawn() {
            warn!("Could not open {}: {}", dir.display(), e);
        }
    }

    pub fn get_app_version(&self) -> &'static str {
        app_version()
    }

    pub fn subscribe_resolution(&self) -> broadcast::Receiver<ResolutionChanged> {
        self.events.subscribe_resolution()
    }

    pub fn subscribe_mouse_lock(&self) -> broadcast::Receiver<MouseLockChanged> {
        self.events.subscribe_mouse_lock()
    }

    /// Stop every task. The cursor is released and an automated mode is
    /// reverted before this returns.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Engine task failed: {}", e);
            }
        }
        info!("Engine stopped");
    }
}

/// Run a display call on the blocking pool.
async fn run_display<T, F>(display: &Arc<dyn DisplayBackend>, call: F) -> Result<T, DisplayError>
where
    T: Send + 'static,
    F: FnOnce(&dyn DisplayBackend) -> Result<T, DisplayError> + Send + 'static,
{
    let display = Arc::clone(display);
    tokio::task::spawn_blocking(move || call(display.as_ref()))
        .await
        .map_err(|e| DisplayError::Query(format!("display call panicked: {e}")))?
}
