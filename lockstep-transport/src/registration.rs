//! Registration of engine server addresses.
//!
//! A launched engine server may end up on a different port than it was
//! asked for. After binding, it posts `{engine, address}` to the
//! orchestrator's registration listener, and the engine's client waits for
//! that entry before sending its first command.
//!
//! The registry itself is an actor: commands carry a oneshot responder and
//! are processed in order by a single task.

use std::collections::HashMap;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use lockstep_core::EngineError;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::TransportError;

/// Body of a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub engine: String,
    pub address: String,
}

#[derive(Debug)]
enum RegistrationCommand {
    Register {
        registration: Registration,
        responder: oneshot::Sender<Option<String>>,
    },
    Lookup {
        engine: String,
        responder: oneshot::Sender<Option<String>>,
    },
    Remove {
        engine: String,
        responder: oneshot::Sender<Option<String>>,
    },
}

/// Spawns the registration registry actor and returns its handle.
pub fn spawn_registration_registry() -> RegistrationHandle {
    let (sender, receiver) = mpsc::channel(100);
    tokio::spawn(run_registry(receiver));
    RegistrationHandle { sender }
}

async fn run_registry(mut receiver: mpsc::Receiver<RegistrationCommand>) {
    debug!("Registration registry started");
    let mut addresses: HashMap<String, String> = HashMap::new();

    while let Some(command) = receiver.recv().await {
        match command {
            RegistrationCommand::Register {
                registration,
                responder,
            } => {
                info!(
                    engine = %registration.engine,
                    address = %registration.address,
                    "Engine registered"
                );
                let previous = addresses.insert(registration.engine, registration.address);
                let _ = responder.send(previous);
            }
            RegistrationCommand::Lookup { engine, responder } => {
                let _ = responder.send(addresses.get(&engine).cloned());
            }
            RegistrationCommand::Remove { engine, responder } => {
                let _ = responder.send(addresses.remove(&engine));
            }
        }
    }

    debug!("Registration registry stopped");
}

/// Cloneable handle to the registration registry actor.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    sender: mpsc::Sender<RegistrationCommand>,
}

impl RegistrationHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistrationCommand,
    ) -> Option<T> {
        let (responder, rx) = oneshot::channel();
        self.sender.send(command(responder)).await.ok()?;
        rx.await.ok()
    }

    /// Records an engine's address, returning the one it replaces.
    pub async fn register(&self, registration: Registration) -> Option<String> {
        self.request(|responder| RegistrationCommand::Register {
            registration,
            responder,
        })
        .await
        .flatten()
    }

    pub async fn lookup(&self, engine: &str) -> Option<String> {
        let engine = engine.to_string();
        self.request(|responder| RegistrationCommand::Lookup { engine, responder })
            .await
            .flatten()
    }

    /// Forgets an engine, e.g. after it shut down.
    pub async fn remove(&self, engine: &str) -> Option<String> {
        let engine = engine.to_string();
        self.request(|responder| RegistrationCommand::Remove { engine, responder })
            .await
            .flatten()
    }

    /// Polls for an engine's address.
    ///
    /// # Errors
    ///
    /// - `EngineError::LaunchFailed` - No registration after `retries` polls
    pub async fn wait_for(
        &self,
        engine: &str,
        retries: u32,
        interval: Duration,
    ) -> Result<String, EngineError> {
        for attempt in 0..=retries {
            if let Some(address) = self.lookup(engine).await {
                return Ok(address);
            }
            if attempt < retries {
                debug!(engine, attempt, "Waiting for engine registration");
                tokio::time::sleep(interval).await;
            }
        }
        Err(EngineError::LaunchFailed {
            engine: engine.to_string(),
            reason: format!("engine server did not register within {retries} retries"),
        })
    }
}

/// Router of the registration listener.
pub fn router(registrations: RegistrationHandle) -> Router {
    Router::new()
        .route("/register", post(register))
        .with_state(registrations)
}

async fn register(
    State(registrations): State<RegistrationHandle>,
    Json(registration): Json<Registration>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if registration.engine.is_empty() || registration.address.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if let Some(previous) = registrations.register(registration.clone()).await {
        warn!(
            engine = %registration.engine,
            %previous,
            "Engine registered again, replacing address"
        );
    }
    Ok(Json(serde_json::json!({})))
}

/// Serves the registration router on `listener`.
pub fn serve(listener: TcpListener, registrations: RegistrationHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(registrations)).await {
            warn!(error = %e, "Registration listener stopped");
        }
    })
}

/// Reports an engine server's bound address to a registration listener.
///
/// # Errors
///
/// - `TransportError::Registration` - Listener unreachable or rejected the request
pub async fn register_engine(
    client: &reqwest::Client,
    registration_address: &str,
    engine: &str,
    address: &str,
) -> Result<(), TransportError> {
    let url = format!("http://{registration_address}/register");
    let body = Registration {
        engine: engine.to_string(),
        address: address.to_string(),
    };

    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| TransportError::Registration {
            engine: engine.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Registration {
            engine: engine.to_string(),
            reason: format!("listener answered {status}"),
        });
    }
    debug!(engine, address, registration_address, "Reported engine address");
    Ok(())
}
