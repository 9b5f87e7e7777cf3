//! Backend and devices shared by the transport tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lockstep_core::device::{CameraFrame, JointState, NestStatus};
use lockstep_core::{
    Device, DeviceIdentifier, EngineBackend, EngineError, EngineServerCore, SimulationTime,
};

/// Keeps devices by name and advances time by the requested step.
#[derive(Default)]
pub(crate) struct StoreBackend {
    pub time: SimulationTime,
    pub devices: BTreeMap<String, Device>,
    pub step_sleep: Duration,
}

impl EngineBackend for StoreBackend {
    fn initialize(
        &mut self,
        init_data: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::json!({ "echo": init_data }))
    }

    fn run_loop_step(&mut self, timestep: SimulationTime) -> Result<SimulationTime, EngineError> {
        if !self.step_sleep.is_zero() {
            std::thread::sleep(self.step_sleep);
        }
        self.time += timestep;
        Ok(self.time)
    }

    fn device_output(&mut self, id: &DeviceIdentifier) -> Result<Option<Device>, EngineError> {
        Ok(self.devices.get(&id.name).cloned())
    }

    fn device_input(&mut self, device: Device) -> Result<(), EngineError> {
        self.devices.insert(device.name().to_string(), device);
        Ok(())
    }

    fn shutdown(&mut self, _shutdown_data: &serde_json::Value) -> Result<(), EngineError> {
        Ok(())
    }
}

pub(crate) fn core(name: &str) -> Arc<EngineServerCore<StoreBackend>> {
    Arc::new(EngineServerCore::new(name, StoreBackend::default()))
}

pub(crate) fn slow_core(name: &str, step_sleep: Duration) -> Arc<EngineServerCore<StoreBackend>> {
    Arc::new(EngineServerCore::new(name, StoreBackend {
        step_sleep,
        ..StoreBackend::default()
    }))
}

/// Devices covering fixed-size, variable-length and free-form payloads.
pub(crate) fn sample_devices(engine: &str) -> Vec<Device> {
    vec![
        Device::new("elbow", engine, JointState {
            position: 0.25,
            velocity: -1.5,
            effort: 3.0,
        }),
        Device::new("eye", engine, CameraFrame {
            width: 2,
            height: 1,
            depth: 3,
            image: vec![1, 2, 3, 4, 5, 6],
        }),
        Device::new("voltmeter", engine, NestStatus {
            data: serde_json::json!({ "V_m": -65.0, "spikes": [1, 4] }),
        }),
    ]
}
