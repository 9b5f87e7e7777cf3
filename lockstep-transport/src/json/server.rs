//! axum server exposing an engine over JSON.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use lockstep_core::device::ConversionAdapter;
use lockstep_core::{DeviceError, EngineBackend, EngineError, EngineServerCore};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    DataEnvelope, ErrorBody, ErrorDetail, JsonAdapter, ROUTE_GET_DEVICES, ROUTE_INITIALIZE,
    ROUTE_RUN_LOOP, ROUTE_SET_DEVICES, ROUTE_SHUTDOWN, RunLoopReply, RunLoopRequest, status_for,
};
use crate::TransportError;
use crate::net::{ServerHandle, ServerOptions, bind_with_retries};
use crate::registration::register_engine;

/// Engine error rendered as a JSON error reply.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        debug!(error = %self.0, %code, "Rejecting engine command");
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.0.wire_message(),
            },
        };
        (status_for(code), Json(body)).into_response()
    }
}

struct ServerState<B> {
    core: Arc<EngineServerCore<B>>,
    adapter: Arc<JsonAdapter>,
}

impl<B> Clone for ServerState<B> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<B: EngineBackend> ServerState<B> {
    /// Runs a core command off the async workers; steps and lock waits block.
    async fn blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce(&EngineServerCore<B>) -> Result<T, EngineError> + Send + 'static,
    ) -> Result<T, ApiError> {
        let core = Arc::clone(&self.core);
        let name = core.name().to_string();
        tokio::task::spawn_blocking(move || f(&core))
            .await
            .map_err(|e| ApiError(EngineError::Backend {
                engine: name,
                reason: format!("command task failed: {e}"),
            }))?
            .map_err(ApiError)
    }

    fn device_error(&self, source: DeviceError) -> ApiError {
        ApiError(EngineError::device(self.core.name(), source))
    }
}

async fn initialize<B: EngineBackend>(
    State(state): State<ServerState<B>>,
    Json(request): Json<DataEnvelope>,
) -> Result<Json<DataEnvelope>, ApiError> {
    let data = state
        .blocking(move |core| core.initialize(&request.data))
        .await?;
    Ok(Json(DataEnvelope { data }))
}

async fn run_loop<B: EngineBackend>(
    State(state): State<ServerState<B>>,
    Json(request): Json<RunLoopRequest>,
) -> Result<Json<RunLoopReply>, ApiError> {
    let time = state
        .blocking(move |core| core.run_loop_step(request.time_step))
        .await?;
    Ok(Json(RunLoopReply { time }))
}

async fn get_devices<B: EngineBackend>(
    State(state): State<ServerState<B>>,
    Json(request): Json<Map<String, Value>>,
) -> Result<Json<Map<String, Value>>, ApiError> {
    let ids = state
        .adapter
        .decode_ids(request)
        .map_err(|e| state.device_error(e))?;

    let lookup = ids.clone();
    let devices = state.blocking(move |core| core.get_devices(&lookup)).await?;

    let mut reply = Map::new();
    for (id, device) in ids.into_iter().zip(devices) {
        let body = match device {
            Some(device) => {
                state
                    .adapter
                    .serialize(&device)
                    .map_err(|e| state.device_error(e))?
                    .body
            }
            None => Value::Null,
        };
        reply.insert(id.name, body);
    }
    Ok(Json(reply))
}

async fn set_devices<B: EngineBackend>(
    State(state): State<ServerState<B>>,
    Json(request): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    let devices = state
        .adapter
        .decode_list(request)
        .map_err(|e| state.device_error(e))?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    state.blocking(move |core| core.set_devices(devices)).await?;
    Ok(Json(Value::Object(Map::new())))
}

async fn shutdown<B: EngineBackend>(
    State(state): State<ServerState<B>>,
    Json(request): Json<DataEnvelope>,
) -> Result<Json<Value>, ApiError> {
    state
        .blocking(move |core| core.shutdown(&request.data))
        .await?;
    Ok(Json(Value::Object(Map::new())))
}

/// JSON/HTTP front of an [`EngineServerCore`].
pub struct JsonEngineServer<B> {
    core: Arc<EngineServerCore<B>>,
    adapter: Arc<JsonAdapter>,
}

impl<B: EngineBackend> JsonEngineServer<B> {
    pub fn new(core: Arc<EngineServerCore<B>>) -> Self {
        Self {
            core,
            adapter: Arc::new(JsonAdapter::new()),
        }
    }

    pub fn with_adapter(mut self, adapter: JsonAdapter) -> Self {
        self.adapter = Arc::new(adapter);
        self
    }

    /// Router serving the five engine routes.
    pub fn router(&self) -> Router {
        let state = ServerState {
            core: Arc::clone(&self.core),
            adapter: Arc::clone(&self.adapter),
        };
        Router::new()
            .route(ROUTE_INITIALIZE, post(initialize::<B>))
            .route(ROUTE_RUN_LOOP, post(run_loop::<B>))
            .route(ROUTE_GET_DEVICES, post(get_devices::<B>))
            .route(ROUTE_SET_DEVICES, post(set_devices::<B>))
            .route(ROUTE_SHUTDOWN, post(shutdown::<B>))
            .with_state(state)
    }

    /// Binds, starts serving and reports the bound address when a
    /// registration listener is configured.
    ///
    /// # Errors
    ///
    /// - `TransportError::Bind` - No port could be bound
    /// - `TransportError::Registration` - Registration listener rejected the address
    pub async fn start(self, options: &ServerOptions) -> Result<ServerHandle, TransportError> {
        let listener = bind_with_retries(&options.address, options.bind_retries).await?;
        let address = listener.local_addr()?;
        let engine = self.core.name().to_string();
        let router = self.router();

        let task = tokio::spawn({
            let engine = engine.clone();
            async move {
                if let Err(e) = axum::serve(listener, router).await {
                    warn!(engine = %engine, error = %e, "JSON engine server stopped");
                }
            }
        });
        let handle = ServerHandle::new(engine, address, task);

        if let Some(registration) = &options.registration_address {
            let client = reqwest::Client::builder()
                .timeout(options.request_timeout)
                .build()?;
            register_engine(&client, registration, handle.engine(), &address.to_string())
                .await?;
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::json::CONTENT_TYPE;
    use crate::test_support::core;

    async fn post_json(router: &Router, route: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(route)
            .header("content-type", CONTENT_TYPE)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_step_before_initialize_is_conflict() {
        let router = JsonEngineServer::new(core("physics")).router();

        let (status, body) = post_json(&router, ROUTE_RUN_LOOP, json!({ "time_step": 1000 })).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "out_of_order");
    }

    #[tokio::test]
    async fn test_command_sequence() {
        let router = JsonEngineServer::new(core("physics")).router();

        let (status, body) = post_json(&router, ROUTE_INITIALIZE, json!({ "data": 7 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["echo"], 7);

        let (_, body) = post_json(&router, ROUTE_RUN_LOOP, json!({ "time_step": 1000 })).await;
        assert_eq!(body["time"], 1000);

        let device = json!({
            "elbow": {
                "type": "physics_joint",
                "engine_name": "physics",
                "position": 0.5,
                "velocity": 0.0,
                "effort": 0.0
            }
        });
        let (status, _) = post_json(&router, ROUTE_SET_DEVICES, device.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let request = json!({
            "elbow": { "type": "physics_joint", "engine_name": "physics" },
            "wrist": { "type": "physics_joint", "engine_name": "physics" }
        });
        let (_, body) = post_json(&router, ROUTE_GET_DEVICES, request).await;
        assert_eq!(body["elbow"], device["elbow"]);
        assert_eq!(body["wrist"], Value::Null);

        let (status, _) = post_json(&router, ROUTE_SHUTDOWN, json!({})).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_device_type_is_unprocessable() {
        let router = JsonEngineServer::new(core("physics")).router();
        post_json(&router, ROUTE_INITIALIZE, json!({})).await;

        let device = json!({ "probe": { "type": "thermometer", "engine_name": "physics" } });
        let (status, body) = post_json(&router, ROUTE_SET_DEVICES, device).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "no_adapter");
    }
}
