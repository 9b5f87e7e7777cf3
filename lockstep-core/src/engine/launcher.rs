//! Starting and stopping engine processes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{EngineConfig, EngineError};

/// Argument carrying the address the engine server should bind.
pub const ARG_SERVER_URL: &str = "--serverurl";
/// Argument carrying the engine name.
pub const ARG_ENGINE_NAME: &str = "--engine";
/// Argument carrying the registration address.
pub const ARG_REGISTRATION_URL: &str = "--regservurl";

/// Builds the transport arguments every launched engine server accepts.
pub fn engine_process_args(
    engine_name: &str,
    server_address: &str,
    registration_address: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        ARG_SERVER_URL.to_string(),
        server_address.to_string(),
        ARG_ENGINE_NAME.to_string(),
        engine_name.to_string(),
    ];
    if let Some(registration) = registration_address {
        args.push(ARG_REGISTRATION_URL.to_string());
        args.push(registration.to_string());
    }
    args
}

/// Liveness token of a launched engine.
///
/// Owns the child process when the engine runs in its own process.
/// Co-located engines only carry a PID.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Token for an engine that lives in this process.
    pub fn current() -> Self {
        Self::from_pid(std::process::id())
    }

    /// Token for a process reported by PID only.
    pub fn from_pid(pid: u32) -> Self {
        Self { pid, child: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether this handle owns a spawned child.
    pub fn owns_process(&self) -> bool {
        self.child.is_some()
    }

    /// Checks whether the owned child is still alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Kills and reaps the owned child. No-op for co-located engines.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - Kill signal could not be delivered
    pub async fn terminate(&mut self) -> std::io::Result<()> {
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                debug!(pid = self.pid, "Killing engine process");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Starts engine processes for transports that need one.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launches the engine described by `config`, appending `transport_args`.
    ///
    /// # Errors
    ///
    /// - `EngineError::LaunchFailed` - Process could not be started
    async fn launch(
        &self,
        config: &EngineConfig,
        transport_args: Vec<String>,
    ) -> Result<ProcessHandle, EngineError>;
}

/// Spawns `config.launch_command` as a child process.
#[derive(Debug, Default, Clone)]
pub struct BasicLauncher;

#[async_trait]
impl ProcessLauncher for BasicLauncher {
    async fn launch(
        &self,
        config: &EngineConfig,
        transport_args: Vec<String>,
    ) -> Result<ProcessHandle, EngineError> {
        let command = config
            .launch_command
            .as_deref()
            .ok_or_else(|| EngineError::LaunchFailed {
                engine: config.name.clone(),
                reason: "no launch command configured".to_string(),
            })?;

        let child = Command::new(command)
            .args(&config.launch_args)
            .args(&transport_args)
            .envs(&config.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::LaunchFailed {
                engine: config.name.clone(),
                reason: format!("{command}: {e}"),
            })?;

        let pid = child.id().ok_or_else(|| EngineError::LaunchFailed {
            engine: config.name.clone(),
            reason: "process exited immediately".to_string(),
        })?;

        info!(engine = %config.name, pid, command, "Launched engine process");
        Ok(ProcessHandle {
            pid,
            child: Some(child),
        })
    }
}

/// Launcher for engines already running next to the orchestrator.
#[derive(Debug, Default, Clone)]
pub struct InProcessLauncher;

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn launch(
        &self,
        config: &EngineConfig,
        _transport_args: Vec<String>,
    ) -> Result<ProcessHandle, EngineError> {
        if config.launch_command.is_some() {
            warn!(engine = %config.name, "Launch command ignored for co-located engine");
        }
        Ok(ProcessHandle::current())
    }
}
