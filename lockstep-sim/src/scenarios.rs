//! Pre-built co-simulation scenarios.
//!
//! A [`Scenario`] bundles simulated engines with the routing functions that
//! connect them. It is transport-agnostic: [`Scenario::in_process`] drives
//! the engines directly, while [`Scenario::with_handles`] accepts handles
//! built over any transport, typically around servers fronting each
//! engine's [`core`](SimulatedEngine::core).

use std::collections::BTreeMap;
use std::time::Duration;

use lockstep_core::routing::NativeScriptRuntime;
use lockstep_core::{
    DeviceIdentifier, EngineHandle, RequestChain, RoutingBinding, RoutingRegistry,
    SchedulerConfig, SimulationLoop, SimulationManager, SimulationTime,
};

use crate::backend::{clock_id, voltmeter_id};
use crate::engine::SimulatedEngine;
use crate::probe::RecordingProbe;

fn ms(value: i64) -> SimulationTime {
    SimulationTime::from_millis(value)
}

/// Engines plus routing, ready to be turned into a simulation loop.
#[derive(Debug)]
pub struct Scenario {
    pub engines: Vec<SimulatedEngine>,
    pub registry: RoutingRegistry,
    pub runtime: NativeScriptRuntime,
    pub probe: RecordingProbe,
}

/// A scenario whose engines are owned by a scheduler.
#[derive(Debug)]
pub struct ScenarioRun<S> {
    pub simulation: S,
    pub engines: Vec<SimulatedEngine>,
    pub probe: RecordingProbe,
}

impl<S> ScenarioRun<S> {
    pub fn engine(&self, name: &str) -> Option<&SimulatedEngine> {
        self.engines.iter().find(|e| e.name() == name)
    }

    /// Steps each engine's backend has completed, by engine name.
    ///
    /// Engines whose backend is busy are left out.
    pub fn step_counts(&self) -> BTreeMap<String, u64> {
        self.engines
            .iter()
            .filter_map(|e| {
                e.inspect(|b| b.steps())
                    .ok()
                    .map(|steps| (e.name().to_string(), steps))
            })
            .collect()
    }
}

impl Scenario {
    fn new(engines: Vec<SimulatedEngine>) -> Self {
        Self {
            engines,
            registry: RoutingRegistry::new(),
            runtime: NativeScriptRuntime::new(),
            probe: RecordingProbe::new(),
        }
    }

    pub fn engine(&self, name: &str) -> Option<&SimulatedEngine> {
        self.engines.iter().find(|e| e.name() == name)
    }

    /// Binds an observer function to `trigger`, reading `devices` by keyword.
    fn observe(
        mut self,
        binding: &str,
        trigger: &str,
        devices: &[(&str, DeviceIdentifier)],
    ) -> lockstep_core::Result<Self> {
        let function = format!("{binding}_fn");
        let keywords: Vec<&str> = devices.iter().map(|(k, _)| *k).collect();
        let mut chain = RequestChain::function(&function);
        for (keyword, id) in devices {
            chain = chain.with_device(*keyword, id.clone());
        }
        self.registry.load(RoutingBinding::new(binding, trigger, chain))?;
        let body = self.probe.observer(&function, &keywords);
        self.runtime.register(function, body);
        Ok(self)
    }

    /// Binds a function to `trigger` that forwards `source` to `target`.
    fn forward(
        mut self,
        binding: &str,
        trigger: &str,
        source: DeviceIdentifier,
        target: DeviceIdentifier,
    ) -> lockstep_core::Result<Self> {
        let function = format!("{binding}_fn");
        let chain = RequestChain::function(&function).with_device("source", source);
        self.registry.load(RoutingBinding::new(binding, trigger, chain))?;
        let body = self.probe.forwarder(&function, "source", target);
        self.runtime.register(function, body);
        Ok(self)
    }

    /// Handles over in-process clients.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Configuration` - Two engines share a name
    pub fn in_process(
        self,
        config: SchedulerConfig,
    ) -> lockstep_core::Result<ScenarioRun<SimulationLoop>> {
        let handles = self.engines.iter().map(SimulatedEngine::handle).collect();
        self.with_handles(config, handles)
    }

    /// Builds the loop over caller-provided handles, one per engine.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Configuration` - Two engines share a name
    pub fn with_handles(
        self,
        config: SchedulerConfig,
        handles: Vec<EngineHandle>,
    ) -> lockstep_core::Result<ScenarioRun<SimulationLoop>> {
        let simulation =
            SimulationLoop::new(config, handles, self.registry, Box::new(self.runtime))?;
        Ok(ScenarioRun {
            simulation,
            engines: self.engines,
            probe: self.probe,
        })
    }

    /// Like [`with_handles`](Self::with_handles), under a manager.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Configuration` - Two engines share a name
    pub fn managed(
        self,
        config: SchedulerConfig,
        handles: Vec<EngineHandle>,
    ) -> lockstep_core::Result<ScenarioRun<SimulationManager>> {
        let simulation =
            SimulationManager::new(config, handles, self.registry, Box::new(self.runtime))?;
        Ok(ScenarioRun {
            simulation,
            engines: self.engines,
            probe: self.probe,
        })
    }
}

/// Catalogue of scenarios used by the integration tests and the demo.
pub struct Scenarios;

impl Scenarios {
    /// Two physics engines stepping at 10 ms and 25 ms.
    ///
    /// `watch_a` fires on `a`, `watch_b` on `b`; both record the clocks of
    /// both engines under the keywords `a` and `b`. A batch holding both
    /// engines is visible as a pair of consecutive records with equal clocks.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Routing` - Never for this fixed set of bindings
    pub fn two_rates(seed: u64) -> lockstep_core::Result<Scenario> {
        let engines = vec![
            SimulatedEngine::builder("a", ms(10)).seed(seed).build(),
            SimulatedEngine::builder("b", ms(25)).seed(seed + 1).build(),
        ];
        let clocks = [("a", clock_id("a")), ("b", clock_id("b"))];
        Scenario::new(engines)
            .observe("watch_a", "a", &clocks)?
            .observe("watch_b", "b", &clocks)
    }

    /// A routing function on `a` reads the voltmeter of neural engine `b`,
    /// which nothing else has asked for, and forwards it to `a` as
    /// `stimulus`.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Routing` - Never for this fixed set of bindings
    pub fn foreign_device(seed: u64) -> lockstep_core::Result<Scenario> {
        let engines = vec![
            SimulatedEngine::builder("a", ms(10)).seed(seed).build(),
            SimulatedEngine::builder("b", ms(10)).neuro().seed(seed + 1).build(),
        ];
        Scenario::new(engines).forward(
            "relay",
            "a",
            voltmeter_id("b"),
            DeviceIdentifier::new("stimulus", "a", "nest_device"),
        )
    }

    /// Closed loop between a neural `brain` and a physics `body`.
    ///
    /// The body receives the brain's voltmeter as `stimulus`; the brain
    /// receives the body's clock joint as `command`.
    ///
    /// # Errors
    ///
    /// - `LockstepError::Routing` - Never for this fixed set of bindings
    pub fn brain_body(
        seed: u64,
        brain_step: SimulationTime,
        body_step: SimulationTime,
    ) -> lockstep_core::Result<Scenario> {
        let engines = vec![
            SimulatedEngine::builder("brain", brain_step)
                .neuro()
                .seed(seed)
                .init_data(serde_json::json!({ "seed": seed }))
                .build(),
            SimulatedEngine::builder("body", body_step)
                .seed(seed + 1)
                .init_data(serde_json::json!({ "seed": seed + 1 }))
                .build(),
        ];
        Scenario::new(engines)
            .forward(
                "brain_to_body",
                "body",
                voltmeter_id("brain"),
                DeviceIdentifier::new("stimulus", "body", "nest_device"),
            )?
            .forward(
                "body_to_brain",
                "brain",
                clock_id("body"),
                DeviceIdentifier::new("command", "brain", "physics_joint"),
            )
    }

    /// `fast` overshoots every 10 ms step by `drift`; `slow` does not.
    pub fn drifting(seed: u64, drift: SimulationTime) -> Scenario {
        Scenario::new(vec![
            SimulatedEngine::builder("fast", ms(10))
                .seed(seed)
                .drift(drift)
                .build(),
            SimulatedEngine::builder("slow", ms(10)).seed(seed + 1).build(),
        ])
    }

    /// `stuck` never answers its `step`-th step; its step timeout is
    /// `timeout`. `steady` behaves.
    pub fn hanging(step: u64, timeout: Duration) -> Scenario {
        Scenario::new(vec![
            SimulatedEngine::builder("steady", ms(10)).build(),
            SimulatedEngine::builder("stuck", ms(10))
                .hang_at_step(step)
                .step_timeout(timeout)
                .build(),
        ])
    }

    /// The identifier every transport must carry through unchanged.
    pub fn voltmeter_identifier() -> DeviceIdentifier {
        DeviceIdentifier::new("voltmeter", "engine_1", "nest_device")
    }
}

#[cfg(test)]
mod tests {
    use lockstep_core::device::NestStatus;
    use lockstep_core::{ErrorCategory, LockstepError, RunOutcome};

    use super::*;

    async fn started(scenario: Scenario) -> ScenarioRun<SimulationLoop> {
        let mut run = scenario.in_process(SchedulerConfig::default()).unwrap();
        run.simulation.launch_engines().await.unwrap();
        run.simulation.init_loop().await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_two_rates_joint_batches() {
        let mut run = started(Scenarios::two_rates(1).unwrap()).await;
        run.simulation.run_loop(ms(100)).await.unwrap();
        run.simulation.shutdown().await.unwrap();

        let counts = run.step_counts();
        assert_eq!(counts.get("a"), Some(&10));
        assert_eq!(counts.get("b"), Some(&4));

        let joint: Vec<f64> = run
            .probe
            .calls_of("watch_a_fn")
            .iter()
            .filter_map(|r| Some((r.joint_position("a")?, r.joint_position("b")?)))
            .filter(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect();
        assert_eq!(joint, vec![0.0, 50.0]);
    }

    #[tokio::test]
    async fn test_foreign_device_reaches_first_completion() {
        let mut run = started(Scenarios::foreign_device(1).unwrap()).await;
        assert!(
            run.simulation
                .registry()
                .requested_device_ids()
                .contains(&voltmeter_id("b"))
        );

        run.simulation.run_loop(ms(10)).await.unwrap();

        let calls = run.probe.calls_of("relay_fn");
        assert!(!calls.is_empty());
        let first = calls[0].devices["source"].as_ref().unwrap();
        assert_eq!(first.id(), &voltmeter_id("b"));
        let stimulus = run
            .engine("a")
            .unwrap()
            .inspect(|b| b.input("stimulus").cloned())
            .unwrap()
            .unwrap();
        assert!(stimulus.payload::<NestStatus>().is_some());
    }

    #[tokio::test]
    async fn test_brain_body_exchanges_both_ways() {
        let mut run = started(Scenarios::brain_body(9, ms(5), ms(20)).unwrap()).await;
        run.simulation.run_loop(ms(100)).await.unwrap();
        run.simulation.shutdown().await.unwrap();

        let counts = run.step_counts();
        assert_eq!(counts.get("brain"), Some(&20));
        assert_eq!(counts.get("body"), Some(&5));
        assert!(!run.probe.calls_of("brain_to_body_fn").is_empty());
        assert!(!run.probe.calls_of("body_to_brain_fn").is_empty());
        let received = run.engine("brain").unwrap().inspect(|b| b.received()).unwrap();
        assert!(received > 0);
    }

    #[tokio::test]
    async fn test_drifting_engine_is_skipped_not_rewound() {
        let mut run = started(Scenarios::drifting(1, ms(15))).await;
        run.simulation.run_loop(ms(200)).await.unwrap();
        run.simulation.shutdown().await.unwrap();

        let counts = run.step_counts();
        assert_eq!(counts.get("slow"), Some(&20));
        assert!(counts["fast"] < counts["slow"]);
    }

    #[tokio::test]
    async fn test_drift_limit_aborts_run() {
        let config = SchedulerConfig {
            max_drift: Some(ms(5)),
            ..SchedulerConfig::default()
        };
        let mut run = Scenarios::drifting(1, ms(15)).in_process(config).unwrap();
        run.simulation.launch_engines().await.unwrap();
        run.simulation.init_loop().await.unwrap();

        let err = run.simulation.run_loop(ms(200)).await.unwrap_err();
        assert!(matches!(err, LockstepError::DriftExceeded { .. }));
    }

    #[tokio::test]
    async fn test_hanging_engine_times_out() {
        let mut run = started(Scenarios::hanging(2, Duration::from_millis(50))).await;
        let err = run.simulation.run_loop(ms(100)).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::StepTimeout);
        assert_eq!(err.engine(), Some("stuck"));
    }

    #[tokio::test]
    async fn test_managed_run_stops_at_timeout() {
        let config = SchedulerConfig {
            simulation_timeout: Some(ms(50)),
            ..SchedulerConfig::default()
        };
        let scenario = Scenarios::two_rates(3).unwrap();
        let handles = scenario.engines.iter().map(SimulatedEngine::handle).collect();
        let mut run = scenario.managed(config, handles).unwrap();

        let outcome = run.simulation.run_to_completion().await.unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert_eq!(run.step_counts().get("a"), Some(&5));
    }
}
