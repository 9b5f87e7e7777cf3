//! Process-wide transport state, built once and passed to every client.

use std::net::SocketAddr;
use std::sync::Arc;

use lockstep_core::engine::{EngineConfig, ProcessHandle, ProcessLauncher, engine_process_args};
use lockstep_core::{EngineError, TransportConfig};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::TransportError;
use crate::net::bind_with_retries;
use crate::registration::{self, RegistrationHandle, spawn_registration_registry};

/// Shared HTTP client, registration service and process launcher.
///
/// Construct one per orchestrator process and hand an `Arc` of it to the
/// network clients.
pub struct TransportContext {
    config: TransportConfig,
    http: reqwest::Client,
    launcher: Arc<dyn ProcessLauncher>,
    registrations: RegistrationHandle,
    registration_address: Option<SocketAddr>,
    registration_task: Option<JoinHandle<()>>,
}

impl TransportContext {
    /// Context without a registration listener. Clients connect to the
    /// configured server address of each engine directly.
    ///
    /// # Errors
    ///
    /// - `TransportError::Http` - HTTP client could not be built
    pub fn new(
        config: TransportConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            launcher,
            registrations: spawn_registration_registry(),
            registration_address: None,
            registration_task: None,
        })
    }

    /// Context that also listens for engine registrations on
    /// `config.registration_address`.
    ///
    /// # Errors
    ///
    /// - `TransportError::Http` - HTTP client could not be built
    /// - `TransportError::Bind` - Registration address could not be bound
    pub async fn start(
        config: TransportConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, TransportError> {
        let mut context = Self::new(config, launcher)?;
        let listener =
            bind_with_retries(&context.config.registration_address, context.config.bind_retries)
                .await?;
        let address = listener.local_addr()?;
        context.registration_task = Some(registration::serve(
            listener,
            context.registrations.clone(),
        ));
        context.registration_address = Some(address);
        info!(%address, "Registration listener started");
        Ok(context)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn registrations(&self) -> &RegistrationHandle {
        &self.registrations
    }

    /// Bound registration address, when listening.
    pub fn registration_address(&self) -> Option<SocketAddr> {
        self.registration_address
    }

    /// Launches an engine process and resolves the address it serves on.
    ///
    /// With a registration listener the address is whatever the server
    /// reports; otherwise it is the requested address.
    ///
    /// # Errors
    ///
    /// - `EngineError::LaunchFailed` - Process did not start or never registered
    pub async fn launch_engine(
        &self,
        config: &EngineConfig,
    ) -> Result<(ProcessHandle, String), EngineError> {
        let requested = config
            .server_address
            .clone()
            .unwrap_or_else(|| self.config.server_address.clone());
        let registration = config
            .registration_address
            .clone()
            .or_else(|| self.registration_address.map(|a| a.to_string()));

        let args = engine_process_args(&config.name, &requested, registration.as_deref());
        let mut process = self.launcher.launch(config, args).await?;

        let address = match self.registration_address {
            Some(_) => {
                let waited = self
                    .registrations
                    .wait_for(
                        &config.name,
                        self.config.registration_retries,
                        self.config.registration_interval,
                    )
                    .await;
                match waited {
                    Ok(address) => address,
                    Err(e) => {
                        if let Err(kill_error) = process.terminate().await {
                            warn!(
                                engine = %config.name,
                                pid = process.pid(),
                                error = %kill_error,
                                "Failed to terminate unregistered engine"
                            );
                        }
                        return Err(e);
                    }
                }
            }
            None => requested,
        };

        debug!(engine = %config.name, %address, pid = process.pid(), "Engine reachable");
        Ok((process, address))
    }

    /// Stops the registration listener.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.registration_task.take() {
            task.abort();
        }
        self.registration_address = None;
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("config", &self.config)
            .field("registration_address", &self.registration_address)
            .finish_non_exhaustive()
    }
}
