//! Simulated engine backends.
//!
//! A [`SimulatedBackend`] stands in for a physics or neural simulator
//! behind any engine server. It advances its clock by the requested step
//! (plus an optional overshoot), exposes a small fixed set of output
//! devices, and stores whatever input devices it is sent.

use std::collections::BTreeMap;
use std::time::Duration;

use lockstep_core::device::{JointState, LinkState, NestStatus};
use lockstep_core::{Device, DeviceIdentifier, EngineBackend, EngineError, SimulationTime};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::rng::DeterministicRng;

/// Joint of a physics engine whose position is the engine time in ms.
pub const CLOCK_DEVICE: &str = "clock";
/// Pose of the simulated body of a physics engine.
pub const BODY_DEVICE: &str = "body";
/// Recorder output of a neural engine.
pub const VOLTMETER_DEVICE: &str = "voltmeter";

/// What the backend pretends to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Physics,
    Neuro,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Physics => "physics",
            EngineKind::Neuro => "neuro",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of the clock joint of a physics engine.
pub fn clock_id(engine: &str) -> DeviceIdentifier {
    DeviceIdentifier::new(CLOCK_DEVICE, engine, "physics_joint")
}

/// Identifier of the body link of a physics engine.
pub fn body_id(engine: &str) -> DeviceIdentifier {
    DeviceIdentifier::new(BODY_DEVICE, engine, "physics_link")
}

/// Identifier of the voltmeter of a neural engine.
pub fn voltmeter_id(engine: &str) -> DeviceIdentifier {
    DeviceIdentifier::new(VOLTMETER_DEVICE, engine, "nest_device")
}

/// Deterministic engine backend.
///
/// Physics backends expose [`CLOCK_DEVICE`] and [`BODY_DEVICE`]; neural
/// backends expose [`VOLTMETER_DEVICE`]. Outputs are recomputed after
/// initialization and after every step. An init document carrying a
/// `"seed"` number reseeds the noise generator.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    engine: String,
    kind: EngineKind,
    time: SimulationTime,
    step_drift: SimulationTime,
    step_cost: Duration,
    fail_at_step: Option<u64>,
    steps: u64,
    rng: DeterministicRng,
    outputs: BTreeMap<String, Device>,
    extra: BTreeMap<String, Device>,
    inputs: BTreeMap<String, Device>,
    received: u64,
    /// Position of the last joint received; drives the outputs
    command: f64,
}

impl SimulatedBackend {
    pub fn new(engine: impl Into<String>, kind: EngineKind, seed: u64) -> Self {
        Self {
            engine: engine.into(),
            kind,
            time: SimulationTime::zero(),
            step_drift: SimulationTime::zero(),
            step_cost: Duration::ZERO,
            fail_at_step: None,
            steps: 0,
            rng: DeterministicRng::from_seed(seed),
            outputs: BTreeMap::new(),
            extra: BTreeMap::new(),
            inputs: BTreeMap::new(),
            received: 0,
            command: 0.0,
        }
    }

    pub fn physics(engine: impl Into<String>, seed: u64) -> Self {
        Self::new(engine, EngineKind::Physics, seed)
    }

    pub fn neuro(engine: impl Into<String>, seed: u64) -> Self {
        Self::new(engine, EngineKind::Neuro, seed)
    }

    /// Every step overshoots the requested timestep by `drift`.
    pub fn with_step_drift(mut self, drift: SimulationTime) -> Self {
        self.step_drift = drift;
        self
    }

    /// Every step blocks the serving thread for `cost`.
    pub fn with_step_cost(mut self, cost: Duration) -> Self {
        self.step_cost = cost;
        self
    }

    /// The `step`-th step (1-based) fails with a backend error.
    pub fn failing_at_step(mut self, step: u64) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Adds a static output device, returned unchanged on every read.
    pub fn with_device(mut self, device: Device) -> Self {
        self.extra.insert(device.name().to_string(), device);
        self
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn time(&self) -> SimulationTime {
        self.time
    }

    /// Steps completed since initialization.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Number of input devices received since initialization.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Latest input device received under `name`.
    pub fn input(&self, name: &str) -> Option<&Device> {
        self.inputs.get(name)
    }

    fn time_ms(&self) -> f64 {
        self.time.as_nanos() as f64 / 1_000_000.0
    }

    fn refresh_outputs(&mut self) {
        let time_ms = self.time_ms();
        let command = self.command;
        self.outputs.clear();

        match self.kind {
            EngineKind::Physics => {
                let effort = command + self.rng.noise(0.01);
                self.outputs.insert(
                    CLOCK_DEVICE.to_string(),
                    Device::new(CLOCK_DEVICE, &self.engine, JointState {
                        position: time_ms,
                        velocity: command,
                        effort,
                    }),
                );
                let x = time_ms / 1000.0;
                self.outputs.insert(
                    BODY_DEVICE.to_string(),
                    Device::new(BODY_DEVICE, &self.engine, LinkState {
                        position: [x, 0.0, 0.0],
                        orientation: [0.0, 0.0, 0.0, 1.0],
                        linear_velocity: [command, 0.0, 0.0],
                        angular_velocity: [0.0; 3],
                    }),
                );
            }
            EngineKind::Neuro => {
                let membrane = -65.0 + command + self.rng.noise(2.0);
                let spikes = self.rng.random_range(0, 4);
                self.outputs.insert(
                    VOLTMETER_DEVICE.to_string(),
                    Device::new(VOLTMETER_DEVICE, &self.engine, NestStatus {
                        data: json!({
                            "time_ms": time_ms,
                            "V_m": membrane,
                            "spikes": spikes,
                            "inputs": self.received,
                        }),
                    }),
                );
            }
        }
    }
}

impl EngineBackend for SimulatedBackend {
    fn initialize(&mut self, init_data: &Value) -> Result<Value, EngineError> {
        if let Some(seed) = init_data.get("seed").and_then(Value::as_u64) {
            self.rng.reseed(seed);
        }
        self.time = SimulationTime::zero();
        self.steps = 0;
        self.received = 0;
        self.command = 0.0;
        self.inputs.clear();
        self.refresh_outputs();

        let devices: Vec<&String> = self.outputs.keys().chain(self.extra.keys()).collect();
        info!(
            engine = %self.engine,
            kind = %self.kind,
            seed = self.rng.seed(),
            "Simulated engine ready"
        );
        Ok(json!({
            "engine": self.engine,
            "kind": self.kind.as_str(),
            "devices": devices,
        }))
    }

    fn run_loop_step(&mut self, timestep: SimulationTime) -> Result<SimulationTime, EngineError> {
        self.steps += 1;
        if self.fail_at_step == Some(self.steps) {
            return Err(EngineError::Backend {
                engine: self.engine.clone(),
                reason: format!("simulated failure at step {}", self.steps),
            });
        }
        if !self.step_cost.is_zero() {
            std::thread::sleep(self.step_cost);
        }

        self.time += timestep + self.step_drift;
        self.refresh_outputs();
        Ok(self.time)
    }

    fn device_output(&mut self, id: &DeviceIdentifier) -> Result<Option<Device>, EngineError> {
        let device = self
            .outputs
            .get(&id.name)
            .or_else(|| self.extra.get(&id.name))
            .filter(|d| d.id().device_type == id.device_type);
        Ok(device.cloned())
    }

    fn device_input(&mut self, device: Device) -> Result<(), EngineError> {
        debug!(engine = %self.engine, device = %device.name(), "Input device received");
        self.received += 1;
        if let Some(joint) = device.payload::<JointState>() {
            self.command = joint.position;
        }
        self.inputs.insert(device.name().to_string(), device);
        Ok(())
    }

    fn shutdown(&mut self, _shutdown_data: &Value) -> Result<(), EngineError> {
        info!(
            engine = %self.engine,
            steps = self.steps,
            time = %self.time,
            received = self.received,
            "Simulated engine stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: i64) -> SimulationTime {
        SimulationTime::from_millis(value)
    }

    #[test]
    fn test_clock_tracks_engine_time() {
        let mut backend = SimulatedBackend::physics("body", 7);
        backend.initialize(&Value::Null).unwrap();
        backend.run_loop_step(ms(10)).unwrap();
        let time = backend.run_loop_step(ms(10)).unwrap();

        assert_eq!(time, ms(20));
        let clock = backend.device_output(&clock_id("body")).unwrap().unwrap();
        assert_eq!(clock.payload::<JointState>().map(|j| j.position), Some(20.0));
        assert!(backend.device_output(&voltmeter_id("body")).unwrap().is_none());
    }

    #[test]
    fn test_type_mismatch_is_absent() {
        let mut backend = SimulatedBackend::physics("body", 7);
        backend.initialize(&Value::Null).unwrap();
        let wrong = DeviceIdentifier::new(CLOCK_DEVICE, "body", "camera");
        assert!(backend.device_output(&wrong).unwrap().is_none());
        assert!(backend.device_output(&body_id("body")).unwrap().is_some());
    }

    #[test]
    fn test_drift_overshoots_every_step() {
        let mut backend = SimulatedBackend::physics("fast", 1).with_step_drift(ms(3));
        backend.initialize(&Value::Null).unwrap();
        assert_eq!(backend.run_loop_step(ms(10)).unwrap(), ms(13));
        assert_eq!(backend.run_loop_step(ms(10)).unwrap(), ms(26));
    }

    #[test]
    fn test_scripted_failure() {
        let mut backend = SimulatedBackend::neuro("brain", 1).failing_at_step(2);
        backend.initialize(&Value::Null).unwrap();
        backend.run_loop_step(ms(1)).unwrap();
        let err = backend.run_loop_step(ms(1)).unwrap_err();
        assert!(matches!(err, EngineError::Backend { .. }));
    }

    #[test]
    fn test_seed_makes_voltmeter_reproducible() {
        let read = |seed: u64| {
            let mut backend = SimulatedBackend::neuro("brain", 0);
            backend.initialize(&json!({ "seed": seed })).unwrap();
            backend.run_loop_step(ms(1)).unwrap();
            backend
                .device_output(&voltmeter_id("brain"))
                .unwrap()
                .and_then(|d| d.payload::<NestStatus>().map(|s| s.data.clone()))
        };
        assert_eq!(read(11), read(11));
        assert_ne!(read(11), read(12));
    }

    #[test]
    fn test_inputs_drive_outputs() {
        let mut backend = SimulatedBackend::physics("body", 3);
        backend.initialize(&Value::Null).unwrap();
        backend
            .device_input(Device::new("command", "body", JointState {
                position: 2.5,
                ..JointState::default()
            }))
            .unwrap();
        backend.run_loop_step(ms(5)).unwrap();

        assert_eq!(backend.received(), 1);
        assert!(backend.input("command").is_some());
        let clock = backend.device_output(&clock_id("body")).unwrap().unwrap();
        assert_eq!(clock.payload::<JointState>().map(|j| j.velocity), Some(2.5));
    }

    #[test]
    fn test_extra_device_is_served() {
        let extra = Device::new("status", "brain", NestStatus { data: json!({ "ok": true }) });
        let mut backend = SimulatedBackend::neuro("brain", 3).with_device(extra.clone());
        let reply = backend.initialize(&Value::Null).unwrap();

        assert_eq!(reply["kind"], "neuro");
        assert_eq!(reply["devices"], json!(["voltmeter", "status"]));
        assert_eq!(backend.device_output(extra.id()).unwrap(), Some(extra));
    }
}
