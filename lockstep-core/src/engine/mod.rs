//! Transport-agnostic engine contract.
//!
//! A transport implements [`EngineClient`], the raw five-command surface of
//! a remote engine plus process launch. [`EngineHandle`] wraps any client
//! and enforces the lifecycle the scheduler relies on: one outstanding step
//! at a time, device exchange only while paused, monotonic engine time.
//! On the remote side, [`EngineServerCore`] applies the same lifecycle
//! rules in front of an [`EngineBackend`], so every transport rejects
//! out-of-order commands the same way.

pub mod config;
pub mod handle;
pub mod launcher;
pub mod lifecycle;
pub mod server;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use config::EngineConfig;
pub use handle::EngineHandle;
pub use launcher::{
    BasicLauncher, InProcessLauncher, ProcessHandle, ProcessLauncher, engine_process_args,
};
pub use lifecycle::{EngineState, Lifecycle};
pub use server::{EngineBackend, EngineServerCore};

use crate::device::{Device, DeviceError, DeviceIdentifier};
use crate::time::SimulationTime;

/// Client side of one engine, as spoken by a particular transport.
///
/// Methods take `&self` so a step can run on its own task while the handle
/// keeps the client. Implementations serialize their own wire access.
#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    /// Short transport label used in logs.
    fn transport(&self) -> &'static str;

    /// Starts the engine process and establishes the connection.
    ///
    /// # Errors
    ///
    /// - `EngineError::LaunchFailed` - Process could not be spawned or never became reachable
    async fn launch(&self, config: &EngineConfig) -> Result<ProcessHandle, EngineError>;

    /// Sends one-time setup data.
    ///
    /// # Errors
    ///
    /// - `EngineError::Remote` - Engine rejected the command
    /// - `EngineError::Transport` - Connection failed or reply was malformed
    async fn initialize(
        &self,
        init_data: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError>;

    /// Advances the engine by `timestep` and returns its new time.
    ///
    /// # Errors
    ///
    /// - `EngineError::Remote` - Engine rejected or failed the step
    /// - `EngineError::Transport` - Connection failed or reply was malformed
    async fn run_loop_step(&self, timestep: SimulationTime)
    -> Result<SimulationTime, EngineError>;

    /// Fetches the listed devices. Devices the engine does not know are omitted.
    ///
    /// # Errors
    ///
    /// - `EngineError::Device` - A returned device could not be decoded
    /// - `EngineError::Remote` - Engine rejected the command
    /// - `EngineError::Transport` - Connection failed or reply was malformed
    async fn get_devices(&self, ids: &[DeviceIdentifier]) -> Result<Vec<Device>, EngineError>;

    /// Delivers input devices. Called even with an empty slice.
    ///
    /// # Errors
    ///
    /// - `EngineError::Device` - A device could not be encoded
    /// - `EngineError::Remote` - Engine rejected the command
    /// - `EngineError::Transport` - Connection failed or reply was malformed
    async fn set_devices(&self, devices: &[Device]) -> Result<(), EngineError>;

    /// Asks the engine to shut down.
    ///
    /// # Errors
    ///
    /// - `EngineError::Remote` - Engine rejected the command
    /// - `EngineError::Transport` - Connection failed or reply was malformed
    async fn shutdown(&self, shutdown_data: &serde_json::Value) -> Result<(), EngineError>;
}

/// The commands of the engine surface, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    Launch,
    Initialize,
    RunLoopStep,
    WaitForStep,
    GetDevices,
    SetDevices,
    Shutdown,
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineCommand::Launch => "launch",
            EngineCommand::Initialize => "initialize",
            EngineCommand::RunLoopStep => "run_loop_step",
            EngineCommand::WaitForStep => "wait_for_step_completion",
            EngineCommand::GetDevices => "get_devices",
            EngineCommand::SetDevices => "set_devices",
            EngineCommand::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Error code carried over the wire by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    OutOfOrder = 1,
    InvalidArgument = 2,
    NoAdapter = 3,
    Backend = 4,
    Timeout = 5,
    Internal = 6,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte. Unknown codes collapse to `Internal`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ErrorCode::OutOfOrder,
            2 => ErrorCode::InvalidArgument,
            3 => ErrorCode::NoAdapter,
            4 => ErrorCode::Backend,
            5 => ErrorCode::Timeout,
            _ => ErrorCode::Internal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::OutOfOrder => "out_of_order",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NoAdapter => "no_adapter",
            ErrorCode::Backend => "backend",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "out_of_order" => Ok(ErrorCode::OutOfOrder),
            "invalid_argument" => Ok(ErrorCode::InvalidArgument),
            "no_adapter" => Ok(ErrorCode::NoAdapter),
            "backend" => Ok(ErrorCode::Backend),
            "timeout" => Ok(ErrorCode::Timeout),
            "internal" => Ok(ErrorCode::Internal),
            _ => Err(format!("Unknown error code: {s}")),
        }
    }
}

/// Failure classes that decide how a run is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Launch,
    ProtocolViolation,
    StepTimeout,
    RoutingFunction,
}

/// Errors from engine clients, handles and servers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to launch engine '{engine}': {reason}")]
    LaunchFailed { engine: String, reason: String },

    #[error("Engine '{engine}' cannot {command} while {state}")]
    OutOfOrder {
        engine: String,
        command: EngineCommand,
        state: EngineState,
    },

    #[error("Engine '{engine}' was asked to advance by invalid timestep {timestep}")]
    InvalidTimestep {
        engine: String,
        timestep: SimulationTime,
    },

    #[error("Engine '{engine}' did not complete its step within {timeout:?}")]
    StepTimeout { engine: String, timeout: Duration },

    #[error("Engine '{engine}' time regressed from {previous} to {reported}")]
    TimeRegression {
        engine: String,
        previous: SimulationTime,
        reported: SimulationTime,
    },

    #[error("Engine '{engine}' reported negative time {reported}")]
    NegativeEngineTime {
        engine: String,
        reported: SimulationTime,
    },

    #[error("Step task of engine '{engine}' failed: {reason}")]
    StepFailed { engine: String, reason: String },

    #[error("Transport failure talking to engine '{engine}': {reason}")]
    Transport { engine: String, reason: String },

    #[error("Engine '{engine}' returned error {code}: {message}")]
    Remote {
        engine: String,
        code: ErrorCode,
        message: String,
    },

    #[error("Device error on engine '{engine}': {source}")]
    Device {
        engine: String,
        #[source]
        source: DeviceError,
    },

    #[error("Engine '{engine}' failed: {reason}")]
    Backend { engine: String, reason: String },

    #[error("Engine '{engine}' device registry stayed locked for {timeout:?}")]
    LockTimeout { engine: String, timeout: Duration },
}

impl EngineError {
    /// Builds the client-side error for a code received over the wire.
    pub fn remote(engine: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        EngineError::Remote {
            engine: engine.into(),
            code,
            message: message.into(),
        }
    }

    pub fn transport(engine: impl Into<String>, reason: impl fmt::Display) -> Self {
        EngineError::Transport {
            engine: engine.into(),
            reason: reason.to_string(),
        }
    }

    pub fn device(engine: impl Into<String>, source: DeviceError) -> Self {
        EngineError::Device {
            engine: engine.into(),
            source,
        }
    }

    /// Wire code a server reports for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::OutOfOrder { .. } => ErrorCode::OutOfOrder,
            EngineError::InvalidTimestep { .. } => ErrorCode::InvalidArgument,
            EngineError::Device {
                source: DeviceError::NoAdapter { .. },
                ..
            } => ErrorCode::NoAdapter,
            EngineError::Device { .. } => ErrorCode::InvalidArgument,
            EngineError::Backend { .. } => ErrorCode::Backend,
            EngineError::StepTimeout { .. } | EngineError::LockTimeout { .. } => {
                ErrorCode::Timeout
            }
            EngineError::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Failure class of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::LaunchFailed { .. } => ErrorCategory::Launch,
            EngineError::StepTimeout { .. } => ErrorCategory::StepTimeout,
            _ => ErrorCategory::ProtocolViolation,
        }
    }

    /// Name of the engine the error concerns.
    pub fn engine(&self) -> &str {
        match self {
            EngineError::LaunchFailed { engine, .. }
            | EngineError::OutOfOrder { engine, .. }
            | EngineError::InvalidTimestep { engine, .. }
            | EngineError::StepTimeout { engine, .. }
            | EngineError::TimeRegression { engine, .. }
            | EngineError::NegativeEngineTime { engine, .. }
            | EngineError::StepFailed { engine, .. }
            | EngineError::Transport { engine, .. }
            | EngineError::Remote { engine, .. }
            | EngineError::Device { engine, .. }
            | EngineError::Backend { engine, .. }
            | EngineError::LockTimeout { engine, .. } => engine,
        }
    }

    /// Message sent to clients; the engine name is already known to them.
    pub fn wire_message(&self) -> String {
        match self {
            EngineError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
