//! Whole-run driver around a [`SimulationLoop`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::SimulationLoop;
use crate::config::SchedulerConfig;
use crate::engine::EngineHandle;
use crate::routing::{RoutingRegistry, ScriptRuntime};
use crate::time::SimulationTime;
use crate::Result;

/// Cloneable flag asking a running manager to stop after its current step.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// How a managed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The configured simulation timeout was reached
    TimedOut,
    /// A [`StopHandle`] was triggered
    Stopped,
}

/// Launches, initializes, runs and shuts down one simulation.
///
/// Runs the loop in increments of `server_timestep` until the simulation
/// timeout is reached or a [`StopHandle`] fires.
pub struct SimulationManager {
    config: SchedulerConfig,
    simulation: SimulationLoop,
    stop: StopHandle,
}

impl SimulationManager {
    /// # Errors
    ///
    /// - `LockstepError::Configuration` - Invalid engine set or a
    ///   non-positive server timestep
    pub fn new(
        config: SchedulerConfig,
        engines: Vec<EngineHandle>,
        registry: RoutingRegistry,
        runtime: Box<dyn ScriptRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        let simulation = SimulationLoop::new(config.clone(), engines, registry, runtime)?;
        Ok(Self {
            config,
            simulation,
            stop: StopHandle::default(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn simulation_loop(&self) -> &SimulationLoop {
        &self.simulation
    }

    pub fn simulation_loop_mut(&mut self) -> &mut SimulationLoop {
        &mut self.simulation
    }

    /// Launches and initializes every engine.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Engine` - An engine failed to launch
    /// - `LockstepError::Initialization` - An engine rejected its init data
    pub async fn init_simulation(&mut self) -> Result<()> {
        info!("Initializing simulation");
        self.simulation.launch_engines().await?;
        self.simulation.init_loop().await
    }

    /// Steps until the timeout or a stop request.
    ///
    /// # Errors
    ///
    /// Any error from [`SimulationLoop::run_loop`].
    pub async fn run_until_timeout(&mut self) -> Result<RunOutcome> {
        loop {
            if self.stop.is_stopped() {
                info!(time = %self.simulation.sim_time(), "Simulation stopped");
                return Ok(RunOutcome::Stopped);
            }
            if self.has_timed_out(self.simulation.sim_time()) {
                info!(time = %self.simulation.sim_time(), "Simulation timeout reached");
                return Ok(RunOutcome::TimedOut);
            }
            self.simulation.run_loop(self.config.server_timestep).await?;
        }
    }

    fn has_timed_out(&self, time: SimulationTime) -> bool {
        self.config
            .simulation_timeout
            .is_some_and(|timeout| time >= timeout)
    }

    /// Initializes, runs and always shuts down, reporting the first failure.
    ///
    /// # Errors
    ///
    /// The first error raised by initialization, the run, or shutdown.
    pub async fn run_to_completion(&mut self) -> Result<RunOutcome> {
        let outcome = match self.init_simulation().await {
            Ok(()) => self.run_until_timeout().await,
            Err(e) => Err(e),
        };

        let shutdown = self.simulation.shutdown().await;
        if let (Err(run_error), Err(shutdown_error)) = (&outcome, &shutdown) {
            warn!(%run_error, %shutdown_error, "Shutdown failed after aborted run");
        }

        let outcome = outcome?;
        shutdown?;
        Ok(outcome)
    }
}
