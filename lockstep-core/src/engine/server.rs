//! Server-side command handling shared by every transport.
//!
//! Transport servers decode a request, call the matching method on
//! [`EngineServerCore`], and encode the result. The core owns the
//! lifecycle check and the timed lock around the backend's devices, so a
//! command rejected over HTTP is rejected the same way over RPC or the
//! message channel.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{EngineCommand, EngineError, EngineState, Lifecycle};
use crate::device::{Device, DeviceIdentifier};
use crate::time::SimulationTime;

/// The simulator living inside an engine process.
///
/// Called with the registry lock held and never concurrently.
pub trait EngineBackend: Send + 'static {
    /// Applies one-time setup data and returns an optional reply document.
    ///
    /// # Errors
    ///
    /// - `EngineError::Backend` - Setup failed
    fn initialize(&mut self, init_data: &serde_json::Value)
    -> Result<serde_json::Value, EngineError>;

    /// Advances by `timestep` and returns the new engine time.
    ///
    /// # Errors
    ///
    /// - `EngineError::Backend` - Simulation step failed
    fn run_loop_step(&mut self, timestep: SimulationTime) -> Result<SimulationTime, EngineError>;

    /// Current value of an output device, `None` when unknown.
    ///
    /// # Errors
    ///
    /// - `EngineError::Backend` - Device could not be read
    fn device_output(&mut self, id: &DeviceIdentifier) -> Result<Option<Device>, EngineError>;

    /// Applies an input device.
    ///
    /// # Errors
    ///
    /// - `EngineError::Backend` - Device was rejected
    fn device_input(&mut self, device: Device) -> Result<(), EngineError>;

    /// Releases simulator resources.
    ///
    /// # Errors
    ///
    /// - `EngineError::Backend` - Teardown failed
    fn shutdown(&mut self, shutdown_data: &serde_json::Value) -> Result<(), EngineError>;
}

/// Lifecycle-checked front of an [`EngineBackend`].
///
/// The lifecycle and the backend sit behind separate locks, always taken
/// in that order. Initialize and the device commands keep the lifecycle
/// locked until the backend returns, so two of them never pass the same
/// state check. A step only holds the backend lock while the lifecycle
/// reads RUNNING, so commands arriving during a step are rejected instead
/// of queued.
pub struct EngineServerCore<B> {
    name: String,
    lifecycle: Mutex<Lifecycle>,
    backend: Mutex<B>,
    lock_timeout: Duration,
}

/// Default wait for the backend lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

impl<B: EngineBackend> EngineServerCore<B> {
    pub fn new(name: impl Into<String>, backend: B) -> Self {
        let name = name.into();
        Self {
            lifecycle: Mutex::new(Lifecycle::new(name.clone())),
            name,
            backend: Mutex::new(backend),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.lock().state()
    }

    /// Runs `f` on the backend under the timed lock.
    ///
    /// # Errors
    ///
    /// - `EngineError::LockTimeout` - Lock not acquired in time
    pub fn with_backend<T>(&self, f: impl FnOnce(&mut B) -> T) -> Result<T, EngineError> {
        let mut guard = self.lock_backend()?;
        Ok(f(&mut guard))
    }

    fn lock_backend(&self) -> Result<MutexGuard<'_, B>, EngineError> {
        self.backend
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| EngineError::LockTimeout {
                engine: self.name.clone(),
                timeout: self.lock_timeout,
            })
    }

    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Server not STOPPED
    /// - `EngineError::LockTimeout` - Backend busy
    /// - Backend errors
    pub fn initialize(
        &self,
        init_data: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.ensure(EngineCommand::Initialize)?;
        let reply = self.lock_backend()?.initialize(init_data)?;
        lifecycle.enter(EngineState::Paused);
        drop(lifecycle);
        info!(engine = %self.name, "Engine server initialized");
        Ok(reply)
    }

    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Server not PAUSED
    /// - `EngineError::InvalidTimestep` - Negative timestep
    /// - `EngineError::LockTimeout` - Backend busy
    /// - Backend errors
    pub fn run_loop_step(&self, timestep: SimulationTime) -> Result<SimulationTime, EngineError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.ensure(EngineCommand::RunLoopStep)?;
            if timestep.is_negative() {
                return Err(EngineError::InvalidTimestep {
                    engine: self.name.clone(),
                    timestep,
                });
            }
            lifecycle.enter(EngineState::Running);
        }

        let result = self
            .lock_backend()
            .and_then(|mut backend| backend.run_loop_step(timestep));

        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state() == EngineState::Running {
            lifecycle.enter(EngineState::Paused);
        }
        if let Ok(time) = &result {
            debug!(engine = %self.name, %timestep, %time, "Step finished");
        }
        result
    }

    /// Reads the requested devices. Unknown devices come back as `None`.
    ///
    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Server not PAUSED
    /// - `EngineError::LockTimeout` - Backend busy
    /// - Backend errors
    pub fn get_devices(
        &self,
        ids: &[DeviceIdentifier],
    ) -> Result<Vec<Option<Device>>, EngineError> {
        let lifecycle = self.lifecycle.lock();
        lifecycle.ensure(EngineCommand::GetDevices)?;
        let mut backend = self.lock_backend()?;
        ids.iter().map(|id| backend.device_output(id)).collect()
    }

    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Server not PAUSED
    /// - `EngineError::LockTimeout` - Backend busy
    /// - Backend errors
    pub fn set_devices(&self, devices: Vec<Device>) -> Result<(), EngineError> {
        let lifecycle = self.lifecycle.lock();
        lifecycle.ensure(EngineCommand::SetDevices)?;
        let mut backend = self.lock_backend()?;
        for device in devices {
            backend.device_input(device)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// - `EngineError::OutOfOrder` - Server already STOPPED
    /// - `EngineError::LockTimeout` - Backend busy
    /// - Backend errors
    pub fn shutdown(&self, shutdown_data: &serde_json::Value) -> Result<(), EngineError> {
        self.lifecycle
            .lock()
            .transition(EngineCommand::Shutdown, EngineState::Stopping)?;
        let result = self
            .lock_backend()
            .and_then(|mut backend| backend.shutdown(shutdown_data));
        self.lifecycle.lock().enter(EngineState::Stopped);
        info!(engine = %self.name, "Engine server shut down");
        result
    }
}
