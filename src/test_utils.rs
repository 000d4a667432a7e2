//! In-memory stand-ins for the OS primitives, shared by unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::cursor::CursorConfiner;
use crate::cursor::CursorError;
use crate::display::DisplayBackend;
use crate::display::DisplayError;
use crate::domain::FocusState;
use crate::domain::Rect;
use crate::domain::ResolutionMode;
use crate::focus::FocusError;
use crate::focus::FocusProbe;

#[derive(Debug, Default)]
struct DisplayState {
    current: Option<ResolutionMode>,
    supported: Vec<ResolutionMode>,
    rejected: Vec<ResolutionMode>,
    applied: Vec<ResolutionMode>,
    failing_queries: u32,
    queries: usize,
}

/// Display that records applies and can be told to fail.
#[derive(Debug, Default)]
pub struct FakeDisplay {
    state: Mutex<DisplayState>,
}

impl FakeDisplay {
    pub fn new(current: ResolutionMode) -> Self {
        Self::with_modes(current, vec![current])
    }

    pub fn with_modes(current: ResolutionMode, supported: Vec<ResolutionMode>) -> Self {
        Self {
            state: Mutex::new(DisplayState {
                current: Some(current),
                supported,
                ..DisplayState::default()
            }),
        }
    }

    /// Make the next `n` current-mode queries fail transiently.
    pub fn fail_queries(&self, n: u32) {
        self.state.lock().unwrap().failing_queries = n;
    }

    /// Refuse every future apply of `mode`.
    pub fn reject(&self, mode: ResolutionMode) {
        self.state.lock().unwrap().rejected.push(mode);
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().unwrap().queries
    }

    /// Modes successfully applied, in order.
    pub fn applied(&self) -> Vec<ResolutionMode> {
        self.state.lock().unwrap().applied.clone()
    }
}

impl DisplayBackend for FakeDisplay {
    fn current_mode(&self) -> Result<ResolutionMode, DisplayError> {
        let mut state = self.state.lock().unwrap();
        state.queries += 1;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(DisplayError::Query("fake hiccup".to_string()));
        }
        state
            .current
            .ok_or_else(|| DisplayError::Query("no mode".to_string()))
    }

    fn supported_modes(&self) -> Result<Vec<ResolutionMode>, DisplayError> {
        Ok(self.state.lock().unwrap().supported.clone())
    }

    fn apply_mode(&self, mode: ResolutionMode) -> Result<(), DisplayError> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(&mode) {
            return Err(DisplayError::Rejected {
                mode,
                reason: "fake rejection".to_string(),
            });
        }
        state.current = Some(mode);
        state.applied.push(mode);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorCall {
    Confine(Rect),
    Release,
}

/// Cursor confiner that records calls into a shared log.
#[derive(Debug, Clone, Default)]
pub struct RecordingCursor {
    calls: Arc<Mutex<Vec<CursorCall>>>,
    fail_confine: Arc<Mutex<bool>>,
}

impl RecordingCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<CursorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_fail_confine(&self, fail: bool) {
        *self.fail_confine.lock().unwrap() = fail;
    }
}

impl CursorConfiner for RecordingCursor {
    fn confine(&mut self, rect: Rect) -> Result<(), CursorError> {
        if *self.fail_confine.lock().unwrap() {
            return Err(CursorError::Request("fake failure".to_string()));
        }
        self.calls.lock().unwrap().push(CursorCall::Confine(rect));
        Ok(())
    }

    fn release(&mut self) -> Result<(), CursorError> {
        self.calls.lock().unwrap().push(CursorCall::Release);
        Ok(())
    }
}

/// Probe that replays a script, then repeats its last entry forever.
#[derive(Debug)]
pub struct ScriptedProbe {
    script: VecDeque<Result<FocusState, FocusError>>,
}

impl ScriptedProbe {
    pub fn new(script: Vec<Result<FocusState, FocusError>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl FocusProbe for ScriptedProbe {
    fn foreground(&mut self) -> Result<FocusState, FocusError> {
        if self.script.len() > 1 {
            return self.script.pop_front().unwrap_or(Ok(FocusState::Unknown));
        }
        self.script
            .front()
            .cloned()
            .unwrap_or(Ok(FocusState::Unknown))
    }
}

/// Probe whose answer the test changes at will.
#[derive(Debug, Clone, Default)]
pub struct SharedProbe {
    state: Arc<Mutex<FocusState>>,
}

impl SharedProbe {
    pub fn new(initial: FocusState) -> Self {
        Self {
            state: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn set(&self, state: FocusState) {
        *self.state.lock().unwrap() = state;
    }
}

impl FocusProbe for SharedProbe {
    fn foreground(&mut self) -> Result<FocusState, FocusError> {
        Ok(self.state.lock().unwrap().clone())
    }
}
