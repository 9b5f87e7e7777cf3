//! Mock engine client for scheduler and handle tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EngineClient, EngineConfig, EngineError, ProcessHandle};
use crate::device::{Device, DeviceIdentifier, JointState};
use crate::time::SimulationTime;

/// A command received by a mock engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Launch,
    Initialize,
    RunLoopStep(SimulationTime),
    GetDevices(Vec<String>),
    SetDevices(Vec<String>),
    Shutdown,
}

/// Ordered log of calls across several mock engines.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    entries: Arc<Mutex<Vec<(String, MockCall)>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, MockCall)> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn record(&self, engine: &str, call: MockCall) {
        self.entries.lock().push((engine.to_string(), call));
    }
}

#[derive(Debug, Default)]
struct MockState {
    time: SimulationTime,
    next_reported: Option<SimulationTime>,
    calls: Vec<MockCall>,
    delivered: Vec<Vec<Device>>,
    devices: BTreeMap<String, Device>,
}

/// In-memory engine that records every call.
///
/// Steps report `time + timestep + drift` unless a time is forced with
/// [`set_next_reported_time`](Self::set_next_reported_time). A clock device,
/// when configured, is a joint whose position is the engine time in ms.
#[derive(Debug, Clone)]
pub struct MockEngineClient {
    name: String,
    state: Arc<Mutex<MockState>>,
    journal: Option<CallJournal>,
    step_delay: Duration,
    drift: SimulationTime,
    clock_device: Option<String>,
    fail_initialize: bool,
}

impl MockEngineClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            journal: None,
            step_delay: Duration::ZERO,
            drift: SimulationTime::zero(),
            clock_device: None,
            fail_initialize: false,
        }
    }

    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Makes every step take `delay` of wall-clock time.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Makes every step overshoot by `drift`.
    pub fn with_drift(mut self, drift: SimulationTime) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_device(self, device: Device) -> Self {
        self.state
            .lock()
            .devices
            .insert(device.name().to_string(), device);
        self
    }

    pub fn with_clock_device(mut self, name: impl Into<String>) -> Self {
        self.clock_device = Some(name.into());
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Forces the time reported by the next step.
    pub fn set_next_reported_time(&self, time: SimulationTime) {
        self.state.lock().next_reported = Some(time);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Durations of every step received.
    pub fn steps(&self) -> Vec<SimulationTime> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::RunLoopStep(step) => Some(step),
                _ => None,
            })
            .collect()
    }

    /// Device lists of every set-devices call, empty ones included.
    pub fn delivered(&self) -> Vec<Vec<Device>> {
        self.state.lock().delivered.clone()
    }

    pub fn time(&self) -> SimulationTime {
        self.state.lock().time
    }

    fn record(&self, call: MockCall) {
        if let Some(journal) = &self.journal {
            journal.record(&self.name, call.clone());
        }
        self.state.lock().calls.push(call);
    }

    fn clock(&self, time: SimulationTime) -> Option<Device> {
        self.clock_device.as_ref().map(|name| {
            Device::new(
                name.clone(),
                self.name.clone(),
                JointState {
                    position: time.as_millis() as f64,
                    ..JointState::default()
                },
            )
        })
    }
}

#[async_trait]
impl EngineClient for MockEngineClient {
    fn transport(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, _config: &EngineConfig) -> Result<ProcessHandle, EngineError> {
        self.record(MockCall::Launch);
        Ok(ProcessHandle::current())
    }

    async fn initialize(
        &self,
        _init_data: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        self.record(MockCall::Initialize);
        if self.fail_initialize {
            return Err(EngineError::Backend {
                engine: self.name.clone(),
                reason: "init data rejected".to_string(),
            });
        }
        Ok(serde_json::Value::Null)
    }

    async fn run_loop_step(
        &self,
        timestep: SimulationTime,
    ) -> Result<SimulationTime, EngineError> {
        self.record(MockCall::RunLoopStep(timestep));
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }

        let mut state = self.state.lock();
        let reported = state
            .next_reported
            .take()
            .unwrap_or(state.time + timestep + self.drift);
        state.time = reported;
        Ok(reported)
    }

    async fn get_devices(&self, ids: &[DeviceIdentifier]) -> Result<Vec<Device>, EngineError> {
        self.record(MockCall::GetDevices(
            ids.iter().map(|id| id.name.clone()).collect(),
        ));

        let state = self.state.lock();
        let clock = self.clock(state.time);
        Ok(ids
            .iter()
            .filter_map(|id| match &clock {
                Some(device) if device.name() == id.name => Some(device.clone()),
                _ => state.devices.get(&id.name).cloned(),
            })
            .collect())
    }

    async fn set_devices(&self, devices: &[Device]) -> Result<(), EngineError> {
        self.record(MockCall::SetDevices(
            devices.iter().map(|d| d.name().to_string()).collect(),
        ));
        self.state.lock().delivered.push(devices.to_vec());
        Ok(())
    }

    async fn shutdown(&self, _shutdown_data: &serde_json::Value) -> Result<(), EngineError> {
        self.record(MockCall::Shutdown);
        Ok(())
    }
}
