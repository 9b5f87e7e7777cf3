//! Multi-rate co-simulation scheduler.
//!
//! [`SimulationLoop`] owns the engines, the routing registry and a queue of
//! engines keyed by their next expected completion time. Each iteration
//! pops the earliest batch, collects the batch's steps, fetches the devices
//! routing functions asked for, runs the functions bound to the batch,
//! delivers their output and starts the next step of every batch engine.

pub mod manager;
pub mod queue;

use tracing::{debug, info, warn};

pub use manager::{RunOutcome, SimulationManager, StopHandle};
pub use queue::EngineQueue;

use crate::config::SchedulerConfig;
use crate::engine::{EngineError, EngineHandle, EngineState};
use crate::routing::{RoutingRegistry, ScriptRuntime, SortedResults};
use crate::time::SimulationTime;
use crate::{LockstepError, Result};

/// The orchestrator driving every engine.
///
/// Engines enter the queue at time zero, so the first batch holds every
/// engine: it only fetches devices and runs routing functions before the
/// first steps are issued.
pub struct SimulationLoop {
    config: SchedulerConfig,
    engines: Vec<EngineHandle>,
    queue: EngineQueue,
    registry: RoutingRegistry,
    runtime: Box<dyn ScriptRuntime>,
    sim_time: SimulationTime,
}

impl SimulationLoop {
    /// Builds a loop over `engines`.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Configuration` - Two engines share a name, an
    ///   engine timestep is not positive, or the scheduler config is invalid
    pub fn new(
        config: SchedulerConfig,
        engines: Vec<EngineHandle>,
        registry: RoutingRegistry,
        runtime: Box<dyn ScriptRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        for (index, engine) in engines.iter().enumerate() {
            if engines[..index].iter().any(|e| e.name() == engine.name()) {
                return Err(LockstepError::Configuration {
                    reason: format!("duplicate engine name '{}'", engine.name()),
                });
            }
            if engine.timestep() <= SimulationTime::zero() {
                return Err(LockstepError::Configuration {
                    reason: format!(
                        "engine '{}' needs a positive timestep, got {}",
                        engine.name(),
                        engine.timestep()
                    ),
                });
            }
        }

        let queue = EngineQueue::with_all_at_zero(engines.len());
        Ok(Self {
            config,
            engines,
            queue,
            registry,
            runtime,
            sim_time: SimulationTime::zero(),
        })
    }

    /// Current scheduler time.
    pub fn sim_time(&self) -> SimulationTime {
        self.sim_time
    }

    pub fn engines(&self) -> &[EngineHandle] {
        &self.engines
    }

    pub fn engine(&self, name: &str) -> Option<&EngineHandle> {
        self.engines.iter().find(|e| e.name() == name)
    }

    pub fn registry(&self) -> &RoutingRegistry {
        &self.registry
    }

    /// Mutable registry access between runs, e.g. to toggle activation.
    pub fn registry_mut(&mut self) -> &mut RoutingRegistry {
        &mut self.registry
    }

    pub fn queue(&self) -> &EngineQueue {
        &self.queue
    }

    /// Launches every engine process.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Engine` - An engine failed to launch
    pub async fn launch_engines(&mut self) -> Result<()> {
        for engine in &mut self.engines {
            engine.launch().await?;
        }
        Ok(())
    }

    /// Initializes every engine and computes the initial device requests.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Initialization` - An engine rejected its init data
    pub async fn init_loop(&mut self) -> Result<()> {
        info!(engines = self.engines.len(), "Initializing simulation loop");
        for engine in &mut self.engines {
            engine
                .initialize()
                .await
                .map_err(|source| LockstepError::Initialization {
                    engine: engine.name().to_string(),
                    source,
                })?;
        }
        self.registry.update_requested_device_ids();
        Ok(())
    }

    /// Advances the simulation by `delta`.
    ///
    /// Any failure aborts the call immediately; no further command is sent
    /// to any engine.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Engine` - Step timeout, protocol violation or transport failure
    /// - `LockstepError::Routing` - A routing function failed
    /// - `LockstepError::DriftExceeded` - An engine ran too far ahead
    pub async fn run_loop(&mut self, delta: SimulationTime) -> Result<()> {
        let stop_time = self.sim_time + delta;
        debug!(from = %self.sim_time, to = %stop_time, "Running loop");

        while let Some(next) = self.queue.peek_time() {
            if next >= stop_time {
                break;
            }
            let Some((batch_time, batch)) = self
                .queue
                .pop_batch(self.config.approximate_time_range)
            else {
                break;
            };

            self.sim_time = batch_time;
            self.process_batch(&batch).await?;
        }

        self.sim_time = stop_time;
        Ok(())
    }

    async fn process_batch(&mut self, batch: &[usize]) -> Result<()> {
        debug!(time = %self.sim_time, engines = batch.len(), "Processing batch");

        for &index in batch {
            self.engines[index].wait_for_step_completion().await?;
        }

        let requested = self.registry.update_requested_device_ids().clone();
        for &index in batch {
            let engine = &mut self.engines[index];
            engine.request_output_devices(&requested).await?;
            self.registry.set_engine_output(engine.name(), engine.cache());
        }

        let mut results = SortedResults::new();
        for &index in batch {
            let produced = self
                .registry
                .execute_active_linked(self.engines[index].name(), self.runtime.as_mut())?;
            results.extend(produced);
        }

        let batch_names: Vec<&str> = batch.iter().map(|&i| self.engines[i].name()).collect();
        for engine in results.unknown_engines(&batch_names) {
            debug!(engine, "Routing output for engine outside the batch dropped");
        }

        for &index in batch {
            let engine = &mut self.engines[index];
            let devices = results.take(engine.name());
            engine.handle_input_devices(devices).await?;
        }

        for &index in batch {
            self.schedule_next_step(index)?;
        }
        Ok(())
    }

    fn schedule_next_step(&mut self, index: usize) -> Result<()> {
        let engine = &mut self.engines[index];
        let run_time = self.sim_time - engine.engine_time() + engine.timestep();

        if run_time.is_negative() {
            let drift = engine.engine_time() - self.sim_time;
            if let Some(limit) = self.config.max_drift {
                if drift > limit {
                    return Err(LockstepError::DriftExceeded {
                        engine: engine.name().to_string(),
                        drift,
                        limit,
                    });
                }
            }
            warn!(
                engine = %engine.name(),
                sim_time = %self.sim_time,
                engine_time = %engine.engine_time(),
                %drift,
                "Engine is ahead of the simulation, skipping its step"
            );
            self.queue.insert(engine.engine_time(), index);
        } else {
            engine.run_loop_step(run_time)?;
            self.queue.insert(self.sim_time + engine.timestep(), index);
        }
        Ok(())
    }

    /// Shuts every engine down, continuing past failures.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Engine` - First shutdown failure encountered
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_error: Option<EngineError> = None;
        for engine in &mut self.engines {
            if engine.state() == EngineState::Stopped {
                continue;
            }
            if let Err(e) = engine.shutdown().await {
                warn!(engine = %engine.name(), error = %e, "Engine shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        self.queue.clear();

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SimulationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationLoop")
            .field("sim_time", &self.sim_time)
            .field("engines", &self.engines)
            .field("queue", &self.queue)
            .field("routing_functions", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::{Device, DeviceIdentifier, JointState};
    use crate::engine::test_mocks::{CallJournal, MockCall, MockEngineClient};
    use crate::engine::EngineConfig;
    use crate::routing::{NativeScriptRuntime, RequestChain, RoutingBinding, RoutingError};
    use crate::ErrorCategory;

    fn ms(value: i64) -> SimulationTime {
        SimulationTime::from_millis(value)
    }

    fn clock_id(engine: &str) -> DeviceIdentifier {
        DeviceIdentifier::new(format!("{engine}_clock"), engine, "physics_joint")
    }

    fn engine(name: &str, timestep_ms: i64, client: MockEngineClient) -> EngineHandle {
        EngineHandle::new(EngineConfig::new(name, ms(timestep_ms)), client)
    }

    async fn started(
        engines: Vec<EngineHandle>,
        registry: RoutingRegistry,
        runtime: NativeScriptRuntime,
    ) -> SimulationLoop {
        let mut sim = SimulationLoop::new(
            SchedulerConfig::default(),
            engines,
            registry,
            Box::new(runtime),
        )
        .unwrap();
        sim.launch_engines().await.unwrap();
        sim.init_loop().await.unwrap();
        sim
    }

    #[tokio::test]
    async fn test_two_rates_step_counts() {
        let a = MockEngineClient::new("a");
        let b = MockEngineClient::new("b");
        let mut sim = started(
            vec![engine("a", 10, a.clone()), engine("b", 25, b.clone())],
            RoutingRegistry::new(),
            NativeScriptRuntime::new(),
        )
        .await;

        sim.run_loop(ms(100)).await.unwrap();
        sim.shutdown().await.unwrap();

        assert_eq!(a.steps().len(), 10);
        assert_eq!(b.steps().len(), 4);
        assert!(a.steps().iter().all(|s| *s == ms(10)));
        assert!(b.steps().iter().all(|s| *s == ms(25)));
        assert_eq!(sim.sim_time(), ms(100));
    }

    #[tokio::test]
    async fn test_first_joint_batch_after_start_is_at_fifty() {
        let journal = CallJournal::new();
        let a = MockEngineClient::new("a")
            .with_journal(journal.clone())
            .with_clock_device("a_clock");
        let b = MockEngineClient::new("b")
            .with_journal(journal.clone())
            .with_clock_device("b_clock");

        let mut registry = RoutingRegistry::new();
        for (name, trigger) in [("watch_a", "a"), ("watch_b", "b")] {
            registry
                .load(RoutingBinding::new(
                    name,
                    trigger,
                    RequestChain::function("observe")
                        .with_device("a", clock_id("a"))
                        .with_device("b", clock_id("b")),
                ))
                .unwrap();
        }

        let observed = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&observed);
        let runtime = NativeScriptRuntime::new().with("observe", move |args| {
            let read = |key: &str| {
                args.get(key)
                    .and_then(|d| d.payload::<JointState>())
                    .map(|j| j.position as i64)
                    .unwrap_or(-1)
            };
            sink.lock().push((read("a"), read("b")));
            Ok(Vec::new())
        });

        let mut sim = started(
            vec![engine("a", 10, a), engine("b", 25, b)],
            registry,
            runtime,
        )
        .await;
        sim.run_loop(ms(100)).await.unwrap();

        // Batches where both engines reported the same time: both routing
        // functions run and see both clocks advanced.
        let joint: Vec<i64> = observed
            .lock()
            .windows(2)
            .filter(|w| w[0] == w[1] && w[0].0 == w[0].1)
            .map(|w| w[0].0)
            .collect();
        assert_eq!(joint, vec![0, 50]);

        let deliveries = journal
            .entries()
            .into_iter()
            .filter(|(_, call)| matches!(call, MockCall::SetDevices(_)))
            .count();
        assert_eq!(deliveries, 10 + 4);
    }

    #[tokio::test]
    async fn test_routing_sees_foreign_device_on_first_completion() {
        let a = MockEngineClient::new("a");
        let b = MockEngineClient::new("b").with_device(Device::new(
            "sensor",
            "b",
            JointState {
                position: 7.0,
                ..JointState::default()
            },
        ));

        let mut registry = RoutingRegistry::new();
        registry
            .load(RoutingBinding::new(
                "relay",
                "a",
                RequestChain::function("relay")
                    .with_device("sensor", DeviceIdentifier::new("sensor", "b", "physics_joint")),
            ))
            .unwrap();

        let runtime = NativeScriptRuntime::new().with("relay", |args| {
            let sensor = args.get("sensor").ok_or("sensor missing")?;
            let joint = sensor.payload::<JointState>().copied().unwrap_or_default();
            Ok(vec![Device::new("command", "a", joint)])
        });

        let mut sim = started(
            vec![engine("a", 10, a.clone()), engine("b", 10, b.clone())],
            registry,
            runtime,
        )
        .await;
        assert!(
            sim.registry()
                .requested_device_ids()
                .contains(&DeviceIdentifier::new("sensor", "b", "physics_joint"))
        );

        sim.run_loop(ms(10)).await.unwrap();

        assert_eq!(b.calls().iter().filter(|c| matches!(c, MockCall::GetDevices(_))).count(), 1);
        let first_delivery = &a.delivered()[0];
        assert_eq!(first_delivery.len(), 1);
        assert_eq!(
            first_delivery[0].payload::<JointState>().map(|j| j.position),
            Some(7.0)
        );
        assert!(b.delivered()[0].is_empty());
    }

    #[tokio::test]
    async fn test_engine_ahead_is_requeued_without_negative_step() {
        let fast = MockEngineClient::new("fast").with_drift(ms(15));
        let slow = MockEngineClient::new("slow");
        let mut sim = started(
            vec![engine("fast", 10, fast.clone()), engine("slow", 10, slow.clone())],
            RoutingRegistry::new(),
            NativeScriptRuntime::new(),
        )
        .await;

        sim.run_loop(ms(200)).await.unwrap();
        sim.shutdown().await.unwrap();

        assert!(fast.steps().iter().all(|s| !s.is_negative()));
        assert!(fast.steps().len() < slow.steps().len());
        assert_eq!(slow.steps().len(), 20);
        let fast_time = sim.engine("fast").map(EngineHandle::engine_time).unwrap();
        assert!(fast_time >= ms(200));
    }

    #[tokio::test]
    async fn test_drift_limit_aborts() {
        let fast = MockEngineClient::new("fast").with_drift(ms(30));
        let mut sim = SimulationLoop::new(
            SchedulerConfig {
                max_drift: Some(ms(20)),
                ..SchedulerConfig::default()
            },
            vec![engine("fast", 10, fast)],
            RoutingRegistry::new(),
            Box::new(NativeScriptRuntime::new()),
        )
        .unwrap();
        sim.launch_engines().await.unwrap();
        sim.init_loop().await.unwrap();

        let err = sim.run_loop(ms(100)).await.unwrap_err();
        assert!(matches!(err, LockstepError::DriftExceeded { ref engine, .. } if engine == "fast"));
    }

    #[tokio::test]
    async fn test_step_timeout_stops_everything() {
        let journal = CallJournal::new();
        let hung = MockEngineClient::new("hung")
            .with_journal(journal.clone())
            .with_step_delay(Duration::from_secs(30));
        let fine = MockEngineClient::new("fine").with_journal(journal.clone());

        let hung_config =
            EngineConfig::new("hung", ms(10)).with_step_timeout(Duration::from_millis(50));
        let mut sim = started(
            vec![
                EngineHandle::new(hung_config, hung),
                engine("fine", 10, fine),
            ],
            RoutingRegistry::new(),
            NativeScriptRuntime::new(),
        )
        .await;

        let err = sim.run_loop(ms(100)).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::StepTimeout);
        assert_eq!(err.engine(), Some("hung"));

        let calls_at_failure = journal.len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(journal.len(), calls_at_failure);
        let last = journal.entries().last().cloned();
        assert!(matches!(last, Some((_, MockCall::RunLoopStep(_)))));
    }

    #[tokio::test]
    async fn test_routing_failure_is_fatal_and_named() {
        let mut registry = RoutingRegistry::new();
        registry
            .load(RoutingBinding::new("explode", "a", RequestChain::function("boom")))
            .unwrap();
        let runtime = NativeScriptRuntime::new().with("boom", |_args| Err("bad".to_string()));

        let mut sim = started(
            vec![engine("a", 10, MockEngineClient::new("a"))],
            registry,
            runtime,
        )
        .await;

        let err = sim.run_loop(ms(10)).await.unwrap_err();
        assert!(matches!(
            err,
            LockstepError::Routing(RoutingError::FunctionFailed { ref name, .. })
                if name == "explode"
        ));
    }

    #[test]
    fn test_rejects_non_positive_timestep() {
        for timestep_ms in [0, -5] {
            let err = SimulationLoop::new(
                SchedulerConfig::default(),
                vec![
                    engine("ok", 10, MockEngineClient::new("ok")),
                    engine("stuck", timestep_ms, MockEngineClient::new("stuck")),
                ],
                RoutingRegistry::new(),
                Box::new(NativeScriptRuntime::new()),
            )
            .unwrap_err();

            match err {
                LockstepError::Configuration { reason } => {
                    assert!(reason.contains("stuck"), "{reason}");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_rejects_invalid_scheduler_config() {
        let config = SchedulerConfig {
            approximate_time_range: ms(-1),
            ..SchedulerConfig::default()
        };
        let err = SimulationLoop::new(
            config,
            vec![engine("a", 10, MockEngineClient::new("a"))],
            RoutingRegistry::new(),
            Box::new(NativeScriptRuntime::new()),
        )
        .unwrap_err();
        assert!(matches!(err, LockstepError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_empty_simulation_reaches_target() {
        let mut sim = SimulationLoop::new(
            SchedulerConfig::default(),
            Vec::new(),
            RoutingRegistry::new(),
            Box::new(NativeScriptRuntime::new()),
        )
        .unwrap();

        sim.run_loop(ms(40)).await.unwrap();
        sim.run_loop(ms(2)).await.unwrap();
        assert_eq!(sim.sim_time(), ms(42));
    }

    #[tokio::test]
    async fn test_init_failure_names_engine() {
        let mut sim = SimulationLoop::new(
            SchedulerConfig::default(),
            vec![engine("a", 10, MockEngineClient::new("a").failing_initialize())],
            RoutingRegistry::new(),
            Box::new(NativeScriptRuntime::new()),
        )
        .unwrap();
        sim.launch_engines().await.unwrap();

        let err = sim.init_loop().await.unwrap_err();
        assert!(err.to_string().contains("Failed to initialize engine \"a\""));
    }

    #[tokio::test]
    async fn test_duplicate_engine_names_rejected() {
        let result = SimulationLoop::new(
            SchedulerConfig::default(),
            vec![
                engine("a", 10, MockEngineClient::new("a")),
                engine("a", 20, MockEngineClient::new("a")),
            ],
            RoutingRegistry::new(),
            Box::new(NativeScriptRuntime::new()),
        );
        assert!(matches!(result, Err(LockstepError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_every_engine() {
        let a = MockEngineClient::new("a");
        let b = MockEngineClient::new("b");
        let mut sim = started(
            vec![engine("a", 10, a.clone()), engine("b", 10, b.clone())],
            RoutingRegistry::new(),
            NativeScriptRuntime::new(),
        )
        .await;
        sim.run_loop(ms(30)).await.unwrap();
        sim.shutdown().await.unwrap();

        assert!(a.calls().contains(&MockCall::Shutdown));
        assert!(b.calls().contains(&MockCall::Shutdown));
        assert!(sim.engines().iter().all(|e| e.state() == EngineState::Stopped));
    }
}
