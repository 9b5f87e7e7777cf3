//! Lockstep Core - multi-rate co-simulation orchestration
//!
//! Drives independently implemented simulation engines in lock-step: the
//! time-ordered scheduler, the transport-agnostic engine contract and its
//! lifecycle, the device model with pluggable wire converters, and the
//! routing functions that move devices between engines after each step.

pub mod config;
pub mod device;
pub mod engine;
pub mod routing;
pub mod scheduler;
pub mod time;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{LockstepConfig, SchedulerConfig, TransportConfig};
pub use device::{Device, DeviceData, DeviceError, DeviceIdentifier, DeviceIdentifiers};
pub use engine::{
    EngineBackend, EngineClient, EngineConfig, EngineError, EngineHandle, EngineServerCore,
    EngineState, ErrorCategory, ErrorCode,
};
pub use routing::{RequestChain, RoutingBinding, RoutingError, RoutingRegistry, ScriptRuntime};
pub use scheduler::{RunOutcome, SimulationLoop, SimulationManager, StopHandle};
pub use time::SimulationTime;

/// Errors that abort a simulation run.
///
/// Every failure reaching the scheduler's caller is one of these, with the
/// offending engine, device or routing function named in the cause chain.
#[derive(Debug, thiserror::Error)]
pub enum LockstepError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Failed to initialize engine \"{engine}\": {source}")]
    Initialization {
        engine: String,
        #[source]
        source: EngineError,
    },

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Engine '{engine}' is {drift} ahead of the simulation, limit is {limit}")]
    DriftExceeded {
        engine: String,
        drift: SimulationTime,
        limit: SimulationTime,
    },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockstepError {
    /// Failure class of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            LockstepError::Engine(e) | LockstepError::Initialization { source: e, .. } => {
                e.category()
            }
            LockstepError::Routing(_) => ErrorCategory::RoutingFunction,
            LockstepError::Device(_) | LockstepError::DriftExceeded { .. } => {
                ErrorCategory::ProtocolViolation
            }
            LockstepError::Configuration { .. } | LockstepError::Io(_) => ErrorCategory::Launch,
        }
    }

    /// Name of the engine involved, when there is one.
    pub fn engine(&self) -> Option<&str> {
        match self {
            LockstepError::Engine(e) => Some(e.engine()),
            LockstepError::Initialization { engine, .. }
            | LockstepError::DriftExceeded { engine, .. } => Some(engine),
            _ => None,
        }
    }

    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            LockstepError::Engine(e) => match e {
                EngineError::LaunchFailed { engine, .. } => {
                    format!("Could not start engine {engine}")
                }
                EngineError::StepTimeout { engine, timeout } => {
                    format!("Engine {engine} did not finish its step within {timeout:?}")
                }
                EngineError::Transport { engine, .. } => {
                    format!("Lost connection to engine {engine}")
                }
                _ => format!("Engine {} failed", e.engine()),
            },
            LockstepError::Initialization { engine, .. } => {
                format!("Engine {engine} rejected its initialization")
            }
            LockstepError::Routing(e) => {
                format!("Routing function {} failed", e.function_name())
            }
            LockstepError::Device(_) => "Device conversion error occurred".to_string(),
            LockstepError::DriftExceeded { engine, .. } => {
                format!("Engine {engine} drifted too far ahead of the simulation")
            }
            LockstepError::Configuration { .. } => "Configuration error occurred".to_string(),
            LockstepError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            LockstepError::Configuration { .. }
                | LockstepError::Routing(RoutingError::DuplicateName { .. })
                | LockstepError::Routing(RoutingError::UnknownFunction { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, LockstepError>;
