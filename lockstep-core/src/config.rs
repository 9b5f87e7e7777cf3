//! Centralized configuration for Lockstep.
//!
//! Scheduler tuning and transport defaults live here. Per-engine settings
//! are in [`EngineConfig`](crate::engine::EngineConfig).

use std::time::Duration;

use crate::time::SimulationTime;
use crate::{LockstepError, Result};

/// Central configuration for the orchestrator and its transports.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct LockstepConfig {
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
}

/// Scheduler behaviour.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Engines completing within this range of the earliest one join its batch
    pub approximate_time_range: SimulationTime,
    /// Abort when an engine runs ahead of the scheduler by more than this
    pub max_drift: Option<SimulationTime>,
    /// Increment used by the simulation manager for each loop call
    pub server_timestep: SimulationTime,
    /// Total simulated time after which the manager stops (None = unbounded)
    pub simulation_timeout: Option<SimulationTime>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            approximate_time_range: SimulationTime::zero(),
            max_drift: None,
            server_timestep: SimulationTime::from_millis(10),
            simulation_timeout: None,
        }
    }
}

impl SchedulerConfig {
    /// Checks that the loop can advance with these settings.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Configuration` - Non-positive server timestep, or
    ///   negative batching range or drift limit
    pub fn validate(&self) -> Result<()> {
        if self.server_timestep <= SimulationTime::zero() {
            return Err(LockstepError::Configuration {
                reason: format!(
                    "server timestep must be positive, got {}",
                    self.server_timestep
                ),
            });
        }
        if self.approximate_time_range.is_negative() {
            return Err(LockstepError::Configuration {
                reason: format!(
                    "batching time range must not be negative, got {}",
                    self.approximate_time_range
                ),
            });
        }
        if let Some(limit) = self.max_drift.filter(|limit| limit.is_negative()) {
            return Err(LockstepError::Configuration {
                reason: format!("drift limit must not be negative, got {limit}"),
            });
        }
        Ok(())
    }
}

/// Addresses, retries and deadlines shared by the transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address engine servers bind when none is configured per engine
    pub server_address: String,
    /// Address of the orchestrator's registration listener
    pub registration_address: String,
    /// Consecutive ports tried when the requested one is taken
    pub bind_retries: u16,
    /// Polls for an engine's registration before giving up
    pub registration_retries: u32,
    /// Pause between registration polls
    pub registration_interval: Duration,
    /// Wait for the engine-side device registry lock
    pub registry_lock_timeout: Duration,
    /// Per-call deadline of the typed RPC client (zero = none)
    pub rpc_deadline: Duration,
    /// Timeout of every HTTP request made by the JSON client
    pub http_timeout: Duration,
    /// Wait for the PID handshake of a message-channel engine
    pub channel_handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:9002".to_string(),
            registration_address: "localhost:9001".to_string(),
            bind_retries: 1024,
            registration_retries: 20,
            registration_interval: Duration::from_secs(1),
            registry_lock_timeout: Duration::from_secs(30),
            rpc_deadline: Duration::ZERO,
            http_timeout: Duration::from_secs(300),
            channel_handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl LockstepConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparsable values are ignored.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Configuration` - Overrides leave the scheduler unable to advance
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = lookup("LOCKSTEP_SERVER_ADDRESS") {
            config.transport.server_address = address;
        }

        if let Some(address) = lookup("LOCKSTEP_REGISTRATION_ADDRESS") {
            config.transport.registration_address = address;
        }

        if let Some(millis) = parsed::<u64>(&lookup, "LOCKSTEP_RPC_DEADLINE_MS") {
            config.transport.rpc_deadline = Duration::from_millis(millis);
        }

        if let Some(count) = parsed::<u32>(&lookup, "LOCKSTEP_REGISTRATION_RETRIES") {
            config.transport.registration_retries = count;
        }

        if let Some(nanos) = parsed::<i64>(&lookup, "LOCKSTEP_TIME_RANGE_NS") {
            config.scheduler.approximate_time_range = SimulationTime::from_nanos(nanos);
        }

        if let Some(millis) = parsed::<i64>(&lookup, "LOCKSTEP_MAX_DRIFT_MS") {
            config.scheduler.max_drift = Some(SimulationTime::from_millis(millis));
        }

        if let Some(millis) = parsed::<i64>(&lookup, "LOCKSTEP_SERVER_TIMESTEP_MS") {
            config.scheduler.server_timestep = SimulationTime::from_millis(millis);
        }

        if let Some(secs) = parsed::<i64>(&lookup, "LOCKSTEP_SIMULATION_TIMEOUT_S") {
            config.scheduler.simulation_timeout = Some(SimulationTime::from_secs(secs));
        }

        config.scheduler.validate()?;
        Ok(config)
    }

    /// Creates a configuration for fast local tests.
    ///
    /// Binds ephemeral loopback ports and polls registrations quickly.
    pub fn for_testing() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            transport: TransportConfig {
                server_address: "127.0.0.1:0".to_string(),
                registration_address: "127.0.0.1:0".to_string(),
                bind_retries: 16,
                registration_retries: 50,
                registration_interval: Duration::from_millis(20),
                registry_lock_timeout: Duration::from_secs(2),
                rpc_deadline: Duration::from_secs(5),
                http_timeout: Duration::from_secs(5),
                channel_handshake_timeout: Duration::from_secs(2),
            },
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.parse().ok())
}
