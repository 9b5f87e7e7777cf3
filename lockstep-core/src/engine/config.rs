//! Static per-engine configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::EngineError;
use crate::time::SimulationTime;

/// Per-engine settings, fixed once the engine handle is built.
///
/// Produced by whatever loads the simulation description. A zero
/// `step_timeout` waits for steps indefinitely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Display name, also the owner name of the engine's devices
    pub name: String,
    /// Executable started by [`BasicLauncher`](super::BasicLauncher)
    #[serde(default)]
    pub launch_command: Option<String>,
    /// Extra arguments placed before the transport arguments
    #[serde(default)]
    pub launch_args: Vec<String>,
    /// Advance per scheduler step
    pub timestep: SimulationTime,
    /// Limit for waiting on one step
    #[serde(default)]
    pub step_timeout: Duration,
    /// Environment overrides for the launched process
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Payload of the one-time initialize command
    #[serde(default)]
    pub init_data: serde_json::Value,
    /// Payload of the shutdown command
    #[serde(default)]
    pub shutdown_data: serde_json::Value,
    /// Address the engine server should listen on
    #[serde(default)]
    pub server_address: Option<String>,
    /// Address the engine reports its bound address to
    #[serde(default)]
    pub registration_address: Option<String>,
}

impl EngineConfig {
    /// Minimal config with the given name and timestep.
    pub fn new(name: impl Into<String>, timestep: SimulationTime) -> Self {
        Self {
            name: name.into(),
            launch_command: None,
            launch_args: Vec::new(),
            timestep,
            step_timeout: Duration::ZERO,
            environment: BTreeMap::new(),
            init_data: serde_json::Value::Null,
            shutdown_data: serde_json::Value::Null,
            server_address: None,
            registration_address: None,
        }
    }

    /// Rejects settings the scheduler cannot make progress with.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidTimestep` - Timestep is zero or negative
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.timestep <= SimulationTime::zero() {
            return Err(EngineError::InvalidTimestep {
                engine: self.name.clone(),
                timestep: self.timestep,
            });
        }
        Ok(())
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_launch_command(
        mut self,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.launch_command = Some(command.into());
        self.launch_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_init_data(mut self, init_data: serde_json::Value) -> Self {
        self.init_data = init_data;
        self
    }

    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = Some(address.into());
        self
    }

    pub fn with_registration_address(mut self, address: impl Into<String>) -> Self {
        self.registration_address = Some(address.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "name": "nest",
            "timestep": 20_000_000,
        }))
        .unwrap();

        assert_eq!(config, EngineConfig::new("nest", SimulationTime::from_millis(20)));
        assert!(config.step_timeout.is_zero());
        assert!(config.launch_command.is_none());
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new("gazebo", SimulationTime::from_millis(1))
            .with_launch_command("gzserver", ["--verbose"])
            .with_env("GAZEBO_MODEL_PATH", "/models")
            .with_step_timeout(Duration::from_secs(2))
            .with_server_address("localhost:9010");

        assert_eq!(config.launch_command.as_deref(), Some("gzserver"));
        assert_eq!(config.launch_args, vec!["--verbose".to_string()]);
        assert_eq!(config.environment["GAZEBO_MODEL_PATH"], "/models");
        assert_eq!(config.server_address.as_deref(), Some("localhost:9010"));
    }

    #[test]
    fn test_validate_requires_positive_timestep() {
        assert!(EngineConfig::new("ok", SimulationTime::from_nanos(1)).validate().is_ok());

        for timestep in [SimulationTime::zero(), SimulationTime::from_millis(-5)] {
            let err = EngineConfig::new("brain", timestep).validate().unwrap_err();
            assert!(matches!(
                err,
                EngineError::InvalidTimestep { ref engine, timestep: t }
                    if engine == "brain" && t == timestep
            ));
        }
    }
}
