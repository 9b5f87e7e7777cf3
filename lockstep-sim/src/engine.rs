//! Co-located simulated engines with injectable faults.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lockstep_core::engine::{InProcessLauncher, ProcessHandle, ProcessLauncher};
use lockstep_core::{
    Device, DeviceIdentifier, EngineClient, EngineConfig, EngineError, EngineHandle,
    EngineServerCore, SimulationTime,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{EngineKind, SimulatedBackend};
use crate::rng::DeterministicRng;

type SimulatedCore = EngineServerCore<SimulatedBackend>;

/// A simulated engine: its configuration, its server-side core, and the
/// faults injected into clients built from it.
///
/// The core can be put behind any transport server. [`client`](Self::client)
/// drives it in-process instead.
pub struct SimulatedEngine {
    config: EngineConfig,
    core: Arc<SimulatedCore>,
    latency: Range<u64>,
    hang_at_step: Option<u64>,
    seed: u64,
}

impl SimulatedEngine {
    pub fn builder(name: impl Into<String>, timestep: SimulationTime) -> SimulatedEngineBuilder {
        SimulatedEngineBuilder::new(name, timestep)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Server-side core, shared with every client and server built from it.
    pub fn core(&self) -> &Arc<SimulatedCore> {
        &self.core
    }

    /// Reads backend state, e.g. step counts, after or between runs.
    ///
    /// # Errors
    ///
    /// - `EngineError::LockTimeout` - Backend busy with a step
    pub fn inspect<T>(&self, f: impl FnOnce(&SimulatedBackend) -> T) -> Result<T, EngineError> {
        self.core.with_backend(|backend| f(backend))
    }

    /// In-process client carrying the configured latency and hang.
    pub fn client(&self) -> SimulatedEngineClient {
        SimulatedEngineClient {
            name: self.config.name.clone(),
            core: Arc::clone(&self.core),
            latency: self.latency.clone(),
            rng: Mutex::new(DeterministicRng::from_seed(self.seed)),
            hang_at_step: self.hang_at_step,
            steps: AtomicU64::new(0),
        }
    }

    /// Engine handle over an in-process client.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.config.clone(), self.client())
    }
}

impl std::fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedEngine")
            .field("name", &self.config.name)
            .field("timestep", &self.config.timestep)
            .field("state", &self.core.state())
            .field("latency_ms", &self.latency)
            .field("hang_at_step", &self.hang_at_step)
            .finish()
    }
}

/// Builder for [`SimulatedEngine`].
///
/// Defaults to a physics engine without latency, drift or faults.
pub struct SimulatedEngineBuilder {
    config: EngineConfig,
    kind: EngineKind,
    seed: u64,
    latency: Range<u64>,
    drift: SimulationTime,
    step_cost: Duration,
    fail_at_step: Option<u64>,
    hang_at_step: Option<u64>,
    lock_timeout: Option<Duration>,
    devices: Vec<Device>,
}

impl SimulatedEngineBuilder {
    fn new(name: impl Into<String>, timestep: SimulationTime) -> Self {
        Self {
            config: EngineConfig::new(name, timestep),
            kind: EngineKind::Physics,
            seed: 0,
            latency: 0..0,
            drift: SimulationTime::zero(),
            step_cost: Duration::ZERO,
            fail_at_step: None,
            hang_at_step: None,
            lock_timeout: None,
            devices: Vec::new(),
        }
    }

    pub fn physics(mut self) -> Self {
        self.kind = EngineKind::Physics;
        self
    }

    pub fn neuro(mut self) -> Self {
        self.kind = EngineKind::Neuro;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the per-command latency range in milliseconds.
    pub fn latency(mut self, range: Range<u64>) -> Self {
        self.latency = range;
        self
    }

    /// Every step overshoots by `drift`.
    pub fn drift(mut self, drift: SimulationTime) -> Self {
        self.drift = drift;
        self
    }

    /// Wall-clock time each step spends in the backend.
    pub fn step_cost(mut self, cost: Duration) -> Self {
        self.step_cost = cost;
        self
    }

    pub fn fail_at_step(mut self, step: u64) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// The in-process client never answers the `step`-th step (1-based).
    pub fn hang_at_step(mut self, step: u64) -> Self {
        self.hang_at_step = Some(step);
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_step_timeout(timeout);
        self
    }

    pub fn init_data(mut self, init_data: Value) -> Self {
        self.config = self.config.with_init_data(init_data);
        self
    }

    /// Backend lock wait of the server core.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Adds a static output device.
    pub fn device(mut self, device: Device) -> Self {
        self.devices.push(device);
        self
    }

    pub fn build(self) -> SimulatedEngine {
        let mut backend = SimulatedBackend::new(self.config.name.clone(), self.kind, self.seed)
            .with_step_drift(self.drift)
            .with_step_cost(self.step_cost);
        if let Some(step) = self.fail_at_step {
            backend = backend.failing_at_step(step);
        }
        for device in self.devices {
            backend = backend.with_device(device);
        }

        let mut core = EngineServerCore::new(self.config.name.clone(), backend);
        if let Some(timeout) = self.lock_timeout {
            core = core.with_lock_timeout(timeout);
        }

        SimulatedEngine {
            config: self.config,
            core: Arc::new(core),
            latency: self.latency,
            hang_at_step: self.hang_at_step,
            seed: self.seed,
        }
    }
}

/// Engine client calling a simulated core directly.
///
/// Every command first waits a random latency drawn from the configured
/// range, then runs on the blocking pool like a network server would.
pub struct SimulatedEngineClient {
    name: String,
    core: Arc<SimulatedCore>,
    latency: Range<u64>,
    rng: Mutex<DeterministicRng>,
    hang_at_step: Option<u64>,
    steps: AtomicU64,
}

impl SimulatedEngineClient {
    async fn delay(&self) {
        if self.latency.end == 0 {
            return;
        }
        let millis = self
            .rng
            .lock()
            .random_range(self.latency.start, self.latency.end);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    async fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&SimulatedCore) -> Result<T, EngineError> + Send + 'static,
    ) -> Result<T, EngineError> {
        self.delay().await;
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || f(&core))
            .await
            .map_err(|e| EngineError::Backend {
                engine: self.name.clone(),
                reason: format!("command task failed: {e}"),
            })?
    }

    /// Steps requested so far, answered or not.
    pub fn steps_requested(&self) -> u64 {
        self.steps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineClient for SimulatedEngineClient {
    fn transport(&self) -> &'static str {
        "in-process"
    }

    async fn launch(&self, config: &EngineConfig) -> Result<ProcessHandle, EngineError> {
        InProcessLauncher.launch(config, Vec::new()).await
    }

    async fn initialize(&self, init_data: &Value) -> Result<Value, EngineError> {
        let init_data = init_data.clone();
        self.call(move |core| core.initialize(&init_data)).await
    }

    async fn run_loop_step(&self, timestep: SimulationTime) -> Result<SimulationTime, EngineError> {
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang_at_step == Some(step) {
            warn!(engine = %self.name, step, "Simulated engine hangs");
            return std::future::pending().await;
        }
        self.call(move |core| core.run_loop_step(timestep)).await
    }

    async fn get_devices(&self, ids: &[DeviceIdentifier]) -> Result<Vec<Device>, EngineError> {
        let ids = ids.to_vec();
        let replies = self.call(move |core| core.get_devices(&ids)).await?;
        let requested = replies.len();
        let devices: Vec<Device> = replies.into_iter().flatten().collect();
        if devices.len() < requested {
            debug!(
                engine = %self.name,
                absent = requested - devices.len(),
                "Engine does not know some requested devices"
            );
        }
        Ok(devices)
    }

    async fn set_devices(&self, devices: &[Device]) -> Result<(), EngineError> {
        let devices = devices.to_vec();
        self.call(move |core| core.set_devices(devices)).await
    }

    async fn shutdown(&self, shutdown_data: &Value) -> Result<(), EngineError> {
        let shutdown_data = shutdown_data.clone();
        self.call(move |core| core.shutdown(&shutdown_data)).await
    }
}

impl std::fmt::Debug for SimulatedEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedEngineClient")
            .field("name", &self.name)
            .field("latency_ms", &self.latency)
            .field("hang_at_step", &self.hang_at_step)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use lockstep_core::{DeviceIdentifiers, EngineState, ErrorCategory};

    use super::*;
    use crate::backend::{clock_id, voltmeter_id};

    fn ms(value: i64) -> SimulationTime {
        SimulationTime::from_millis(value)
    }

    #[tokio::test]
    async fn test_handle_drives_simulated_engine() {
        let engine = SimulatedEngine::builder("body", ms(10)).seed(3).build();
        let mut handle = engine.handle();

        assert_eq!(handle.launch().await.unwrap(), std::process::id());
        let reply = handle.initialize().await.unwrap();
        assert_eq!(reply["kind"], "physics");

        handle.run_loop_step(ms(10)).unwrap();
        handle.wait_for_step_completion().await.unwrap();
        assert_eq!(handle.engine_time(), ms(10));

        let ids: DeviceIdentifiers = [clock_id("body"), voltmeter_id("body")].into_iter().collect();
        let cache = handle.request_output_devices(&ids).await.unwrap();
        assert_eq!(cache.len(), 1);

        handle.shutdown().await.unwrap();
        assert_eq!(engine.core().state(), EngineState::Stopped);
        assert_eq!(engine.inspect(SimulatedBackend::steps).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_latency_is_applied() {
        let engine = SimulatedEngine::builder("brain", ms(1))
            .neuro()
            .latency(20..21)
            .build();
        let client = engine.client();

        let started = std::time::Instant::now();
        client.initialize(&Value::Null).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_hang_trips_step_timeout() {
        let engine = SimulatedEngine::builder("stuck", ms(10))
            .hang_at_step(2)
            .step_timeout(Duration::from_millis(50))
            .build();
        let mut handle = engine.handle();
        handle.launch().await.unwrap();
        handle.initialize().await.unwrap();

        handle.run_loop_step(ms(10)).unwrap();
        handle.wait_for_step_completion().await.unwrap();

        handle.run_loop_step(ms(10)).unwrap();
        let err = handle.wait_for_step_completion().await.unwrap_err();
        assert!(matches!(err, EngineError::StepTimeout { .. }));
        assert_eq!(err.category(), ErrorCategory::StepTimeout);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces() {
        let engine = SimulatedEngine::builder("flaky", ms(10)).fail_at_step(1).build();
        let mut handle = engine.handle();
        handle.launch().await.unwrap();
        handle.initialize().await.unwrap();

        handle.run_loop_step(ms(10)).unwrap();
        let err = handle.wait_for_step_completion().await.unwrap_err();
        assert!(matches!(err, EngineError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_client_rejects_out_of_order_commands() {
        let engine = SimulatedEngine::builder("body", ms(10)).build();
        let client = engine.client();

        let err = client.run_loop_step(ms(10)).await.unwrap_err();
        assert!(matches!(err, EngineError::OutOfOrder { .. }));
        assert_eq!(client.steps_requested(), 1);
    }
}
