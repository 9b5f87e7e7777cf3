//! Lifecycle-checked runtime state of one engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    EngineClient, EngineCommand, EngineConfig, EngineError, EngineState, Lifecycle, ProcessHandle,
};
use crate::device::{Device, DeviceCache, DeviceIdentifier, DeviceIdentifiers};
use crate::time::SimulationTime;

type StepTask = JoinHandle<Result<SimulationTime, EngineError>>;

/// How long shutdown lets an outstanding step finish.
const SHUTDOWN_STEP_GRACE: Duration = Duration::from_millis(500);

/// One engine as seen by the scheduler.
///
/// Wraps a transport client with the engine's config, process token,
/// sorted output cache, last reported time and lifecycle state. All
/// contract rules live here, so transports only implement raw commands.
pub struct EngineHandle {
    config: EngineConfig,
    client: Arc<dyn EngineClient>,
    process: Option<ProcessHandle>,
    cache: DeviceCache,
    engine_time: SimulationTime,
    lifecycle: Lifecycle,
    pending_step: Option<StepTask>,
}

impl EngineHandle {
    /// Creates a handle in STOPPED state.
    pub fn new(config: EngineConfig, client: impl EngineClient) -> Self {
        Self::from_arc(config, Arc::new(client))
    }

    /// Creates a handle around a shared client.
    pub fn from_arc(config: EngineConfig, client: Arc<dyn EngineClient>) -> Self {
        let lifecycle = Lifecycle::new(config.name.clone());
        Self {
            config,
            client,
            process: None,
            cache: DeviceCache::new(),
            engine_time: SimulationTime::zero(),
            lifecycle,
            pending_step: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn timestep(&self) -> SimulationTime {
        self.config.timestep
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    /// Last time reported by the engine.
    pub fn engine_time(&self) -> SimulationTime {
        self.engine_time
    }

    /// Output devices fetched so far, sorted by name.
    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub fn transport(&self) -> &'static str {
        self.client.transport()
    }

    /// Starts the engine process and returns its PID.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Engine is not STOPPED
    /// - `EngineError::InvalidTimestep` - Configured timestep is not positive
    /// - `EngineError::LaunchFailed` - Transport could not start the engine
    pub async fn launch(&mut self) -> Result<u32, EngineError> {
        self.lifecycle.ensure(EngineCommand::Launch)?;
        self.config.validate()?;

        let process = self.client.launch(&self.config).await?;
        let pid = process.pid();
        self.process = Some(process);
        self.lifecycle.enter(EngineState::Launched);

        info!(engine = %self.name(), transport = self.transport(), pid, "Engine launched");
        Ok(pid)
    }

    /// Sends the configured init data.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Engine already initialized
    /// - `EngineError::Remote` - Engine rejected the init data
    /// - `EngineError::Transport` - Connection failed
    pub async fn initialize(&mut self) -> Result<serde_json::Value, EngineError> {
        self.lifecycle.ensure(EngineCommand::Initialize)?;

        let reply = self.client.initialize(&self.config.init_data).await?;
        self.engine_time = SimulationTime::zero();
        self.lifecycle.enter(EngineState::Paused);

        debug!(engine = %self.name(), "Engine initialized");
        Ok(reply)
    }

    /// Starts advancing the engine by `timestep` and returns immediately.
    ///
    /// The step runs on its own task; collect it with
    /// [`wait_for_step_completion`](Self::wait_for_step_completion).
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - A step is already outstanding or engine not PAUSED
    /// - `EngineError::InvalidTimestep` - `timestep` is negative
    pub fn run_loop_step(&mut self, timestep: SimulationTime) -> Result<(), EngineError> {
        self.lifecycle.ensure(EngineCommand::RunLoopStep)?;
        if timestep.is_negative() {
            return Err(EngineError::InvalidTimestep {
                engine: self.name().to_string(),
                timestep,
            });
        }

        let client = Arc::clone(&self.client);
        self.pending_step = Some(tokio::spawn(
            async move { client.run_loop_step(timestep).await },
        ));
        self.lifecycle.enter(EngineState::Running);

        debug!(engine = %self.name(), %timestep, "Step started");
        Ok(())
    }

    /// Waits for the outstanding step under the configured timeout.
    ///
    /// Returns at once when no step is outstanding.
    ///
    /// # Errors
    ///
    /// - `EngineError::StepTimeout` - Step did not finish in time
    /// - `EngineError::TimeRegression` - Reported time went backwards
    /// - `EngineError::NegativeEngineTime` - Reported time below zero
    /// - `EngineError::StepFailed` - Step task panicked
    /// - Any error returned by the transport for the step
    pub async fn wait_for_step_completion(&mut self) -> Result<(), EngineError> {
        self.wait_for_step_completion_within(self.config.step_timeout)
            .await
    }

    /// Same as [`wait_for_step_completion`](Self::wait_for_step_completion)
    /// with an explicit timeout. Zero waits indefinitely.
    ///
    /// # Errors
    ///
    /// See [`wait_for_step_completion`](Self::wait_for_step_completion).
    pub async fn wait_for_step_completion_within(
        &mut self,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.lifecycle.ensure(EngineCommand::WaitForStep)?;
        let Some(mut task) = self.pending_step.take() else {
            return Ok(());
        };

        let joined = if timeout.is_zero() {
            (&mut task).await
        } else {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    warn!(engine = %self.name(), ?timeout, "Step timed out");
                    return Err(EngineError::StepTimeout {
                        engine: self.name().to_string(),
                        timeout,
                    });
                }
            }
        };

        let reported = joined.map_err(|e| EngineError::StepFailed {
            engine: self.name().to_string(),
            reason: e.to_string(),
        })??;
        self.accept_engine_time(reported)?;
        self.lifecycle.enter(EngineState::Paused);
        Ok(())
    }

    fn accept_engine_time(&mut self, reported: SimulationTime) -> Result<(), EngineError> {
        if reported.is_negative() {
            return Err(EngineError::NegativeEngineTime {
                engine: self.name().to_string(),
                reported,
            });
        }
        if reported < self.engine_time {
            return Err(EngineError::TimeRegression {
                engine: self.name().to_string(),
                previous: self.engine_time,
                reported,
            });
        }

        debug!(engine = %self.name(), time = %reported, "Step completed");
        self.engine_time = reported;
        Ok(())
    }

    /// Fetches the requested devices this engine owns into the cache.
    ///
    /// Identifiers owned by other engines are ignored. Returns the cache.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Engine not PAUSED
    /// - Any error returned by the transport
    pub async fn request_output_devices(
        &mut self,
        ids: &DeviceIdentifiers,
    ) -> Result<&DeviceCache, EngineError> {
        self.lifecycle.ensure(EngineCommand::GetDevices)?;

        let owned: Vec<DeviceIdentifier> = ids
            .iter()
            .filter(|id| id.engine_name == self.config.name)
            .cloned()
            .collect();
        if owned.is_empty() {
            return Ok(&self.cache);
        }

        let devices = self.client.get_devices(&owned).await?;
        debug!(
            engine = %self.name(),
            requested = owned.len(),
            received = devices.len(),
            "Fetched output devices"
        );
        self.cache.merge(devices);
        Ok(&self.cache)
    }

    /// Delivers devices addressed to this engine. Always reaches the transport.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Engine not PAUSED
    /// - Any error returned by the transport
    pub async fn handle_input_devices(&mut self, devices: Vec<Device>) -> Result<(), EngineError> {
        self.lifecycle.ensure(EngineCommand::SetDevices)?;

        let (own, foreign): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|d| d.engine_name() == self.config.name);
        for device in &foreign {
            warn!(
                engine = %self.name(),
                device = %device.id(),
                "Dropping input device addressed to another engine"
            );
        }

        self.client.set_devices(&own).await
    }

    /// Shuts the engine down and tears down its process.
    ///
    /// An outstanding step gets a short grace period, then is abandoned.
    /// The handle ends in STOPPED even when the engine reports an error.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Engine already STOPPED
    /// - Any error returned by the transport
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.lifecycle.ensure(EngineCommand::Shutdown)?;

        if let Some(mut task) = self.pending_step.take() {
            if tokio::time::timeout(SHUTDOWN_STEP_GRACE, &mut task)
                .await
                .is_err()
            {
                debug!(engine = %self.name(), "Abandoning outstanding step");
                task.abort();
            }
        }
        let needs_command = self.state() != EngineState::Launched;
        self.lifecycle.enter(EngineState::Stopping);

        let result = if needs_command {
            self.client.shutdown(&self.config.shutdown_data).await
        } else {
            Ok(())
        };

        if let Some(process) = self.process.as_mut() {
            if let Err(e) = process.terminate().await {
                warn!(engine = %self.name(), error = %e, "Failed to terminate engine process");
            }
        }
        self.process = None;
        self.lifecycle.enter(EngineState::Stopped);

        info!(engine = %self.name(), "Engine shut down");
        result
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("name", &self.config.name)
            .field("transport", &self.client.transport())
            .field("state", &self.state())
            .field("engine_time", &self.engine_time)
            .field("cached_devices", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::JointState;
    use crate::engine::test_mocks::{MockCall, MockEngineClient};

    fn config(name: &str) -> EngineConfig {
        EngineConfig::new(name, SimulationTime::from_millis(10))
    }

    async fn paused_handle(client: MockEngineClient) -> EngineHandle {
        let mut handle = EngineHandle::new(config("physics"), client);
        handle.launch().await.unwrap();
        handle.initialize().await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_step_cycle_updates_time() {
        let client = MockEngineClient::new("physics");
        let mut handle = paused_handle(client.clone()).await;

        handle.run_loop_step(SimulationTime::from_millis(10)).unwrap();
        assert_eq!(handle.state(), EngineState::Running);
        handle.wait_for_step_completion().await.unwrap();

        assert_eq!(handle.state(), EngineState::Paused);
        assert_eq!(handle.engine_time(), SimulationTime::from_millis(10));
        assert_eq!(
            client.steps(),
            vec![SimulationTime::from_millis(10)]
        );
    }

    #[tokio::test]
    async fn test_second_outstanding_step_fails_fast() {
        let client = MockEngineClient::new("physics");
        let mut handle = paused_handle(client).await;

        handle.run_loop_step(SimulationTime::from_millis(10)).unwrap();
        let err = handle
            .run_loop_step(SimulationTime::from_millis(10))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::OutOfOrder {
                command: EngineCommand::RunLoopStep,
                state: EngineState::Running,
                ..
            }
        ));

        let err = handle
            .request_output_devices(&DeviceIdentifiers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OutOfOrder { .. }));
    }

    #[tokio::test]
    async fn test_wait_without_step_is_noop() {
        let client = MockEngineClient::new("physics");
        let mut handle = paused_handle(client.clone()).await;

        handle.wait_for_step_completion().await.unwrap();
        assert_eq!(handle.state(), EngineState::Paused);
        assert!(client.steps().is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout_names_engine() {
        let client = MockEngineClient::new("physics").with_step_delay(Duration::from_secs(5));
        let mut handle = paused_handle(client).await;

        handle.run_loop_step(SimulationTime::from_millis(10)).unwrap();
        let err = handle
            .wait_for_step_completion_within(Duration::from_millis(20))
            .await
            .unwrap_err();

        match err {
            EngineError::StepTimeout { engine, timeout } => {
                assert_eq!(engine, "physics");
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_time_regression_is_rejected() {
        let client = MockEngineClient::new("physics");
        let mut handle = paused_handle(client.clone()).await;

        handle.run_loop_step(SimulationTime::from_millis(10)).unwrap();
        handle.wait_for_step_completion().await.unwrap();

        client.set_next_reported_time(SimulationTime::from_millis(5));
        handle.run_loop_step(SimulationTime::from_millis(10)).unwrap();
        let err = handle.wait_for_step_completion().await.unwrap_err();
        assert!(matches!(err, EngineError::TimeRegression { .. }));
    }

    #[tokio::test]
    async fn test_negative_timestep_rejected() {
        let client = MockEngineClient::new("physics");
        let mut handle = paused_handle(client.clone()).await;

        let err = handle
            .run_loop_step(SimulationTime::from_millis(-1))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTimestep { .. }));
        assert_eq!(handle.state(), EngineState::Paused);
    }

    #[tokio::test]
    async fn test_launch_refuses_non_positive_timestep() {
        let client = MockEngineClient::new("physics");
        let mut handle =
            EngineHandle::new(EngineConfig::new("physics", SimulationTime::zero()), client.clone());

        let err = handle.launch().await.unwrap_err();

        assert!(matches!(err, EngineError::InvalidTimestep { .. }));
        assert_eq!(handle.state(), EngineState::Stopped);
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_device_exchange_filters_by_owner() {
        let client = MockEngineClient::new("physics")
            .with_device(Device::new("elbow", "physics", JointState::default()));
        let mut handle = paused_handle(client.clone()).await;

        let ids: DeviceIdentifiers = [
            DeviceIdentifier::new("elbow", "physics", "physics_joint"),
            DeviceIdentifier::new("voltmeter", "brain", "nest_device"),
        ]
        .into_iter()
        .collect();
        let cache = handle.request_output_devices(&ids).await.unwrap();
        assert_eq!(cache.len(), 1);

        handle
            .handle_input_devices(vec![
                Device::new("shoulder", "physics", JointState::default()),
                Device::new("neuron", "brain", JointState::default()),
            ])
            .await
            .unwrap();

        let delivered = client.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0][0].name(), "shoulder");
        assert!(client.calls().contains(&MockCall::GetDevices(vec!["elbow".to_string()])));
    }

    #[tokio::test]
    async fn test_shutdown_from_running_and_twice() {
        let client = MockEngineClient::new("physics").with_step_delay(Duration::from_secs(5));
        let mut handle = paused_handle(client.clone()).await;
        handle.run_loop_step(SimulationTime::from_millis(10)).unwrap();

        handle.shutdown().await.unwrap();
        assert_eq!(handle.state(), EngineState::Stopped);
        assert!(client.calls().contains(&MockCall::Shutdown));

        let err = handle.shutdown().await.unwrap_err();
        assert!(matches!(err, EngineError::OutOfOrder { .. }));
    }
}
