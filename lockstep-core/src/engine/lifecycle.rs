//! Engine lifecycle state machine.
//!
//! ```text
//! STOPPED -launch-> LAUNCHED -initialize-> PAUSED -run_loop_step-> RUNNING
//!                                            ^                        |
//!                                            +----wait_for_step-------+
//! any state but STOPPED -shutdown-> STOPPING -> STOPPED
//! ```
//!
//! Servers never pass through LAUNCHED; `initialize` is accepted from
//! STOPPED as well so clients and servers share one table.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{EngineCommand, EngineError};

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Launched,
    Paused,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Launched => "launched",
            EngineState::Paused => "paused",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

impl EngineState {
    /// Whether `command` may be issued in this state.
    pub fn accepts(self, command: EngineCommand) -> bool {
        use EngineCommand as C;
        use EngineState as S;

        match command {
            C::Launch => self == S::Stopped,
            C::Initialize => matches!(self, S::Stopped | S::Launched),
            C::RunLoopStep | C::GetDevices | C::SetDevices => self == S::Paused,
            C::WaitForStep => matches!(self, S::Running | S::Paused),
            C::Shutdown => self != S::Stopped,
        }
    }
}

/// State of one engine plus the name used in rejections.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    engine: String,
    state: EngineState,
}

impl Lifecycle {
    /// Starts in STOPPED.
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            state: EngineState::Stopped,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Rejects `command` unless the current state accepts it.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Command not valid in the current state
    pub fn ensure(&self, command: EngineCommand) -> Result<(), EngineError> {
        if self.state.accepts(command) {
            Ok(())
        } else {
            Err(EngineError::OutOfOrder {
                engine: self.engine.clone(),
                command,
                state: self.state,
            })
        }
    }

    /// Moves to `state` unconditionally, after a command succeeded.
    pub fn enter(&mut self, state: EngineState) {
        tracing::trace!(
            engine = %self.engine,
            from = %self.state,
            to = %state,
            "Lifecycle transition"
        );
        self.state = state;
    }

    /// Checks `command` and moves to `next` in one step.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Command not valid in the current state
    pub fn transition(
        &mut self,
        command: EngineCommand,
        next: EngineState,
    ) -> Result<(), EngineError> {
        self.ensure(command)?;
        self.enter(next);
        Ok(())
    }
}
