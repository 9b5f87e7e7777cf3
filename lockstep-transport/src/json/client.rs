//! reqwest client speaking the JSON engine protocol.

use std::sync::Arc;

use async_trait::async_trait;
use lockstep_core::engine::ProcessHandle;
use lockstep_core::{
    Device, DeviceIdentifier, EngineClient, EngineConfig, EngineError, ErrorCode, SimulationTime,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use super::{
    CONTENT_TYPE, DataEnvelope, ErrorBody, JsonAdapter, ROUTE_GET_DEVICES, ROUTE_INITIALIZE,
    ROUTE_RUN_LOOP, ROUTE_SET_DEVICES, ROUTE_SHUTDOWN, RunLoopReply, RunLoopRequest, code_for,
};
use crate::context::TransportContext;

/// Engine client issuing one HTTP request per command.
pub struct JsonEngineClient {
    name: String,
    context: Arc<TransportContext>,
    adapter: JsonAdapter,
    base_url: RwLock<Option<Url>>,
}

impl JsonEngineClient {
    pub fn new(name: impl Into<String>, context: Arc<TransportContext>) -> Self {
        Self {
            name: name.into(),
            context,
            adapter: JsonAdapter::new(),
            base_url: RwLock::new(None),
        }
    }

    /// Client for a server already listening at `address`.
    ///
    /// # Errors
    ///
    /// - `EngineError::Transport` - Address is not a valid URL authority
    pub fn connected(
        name: impl Into<String>,
        context: Arc<TransportContext>,
        address: &str,
    ) -> Result<Self, EngineError> {
        let client = Self::new(name, context);
        client.set_address(address)?;
        Ok(client)
    }

    pub fn with_adapter(mut self, adapter: JsonAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    fn set_address(&self, address: &str) -> Result<(), EngineError> {
        let url = Url::parse(&format!("http://{address}/")).map_err(|e| {
            EngineError::transport(&self.name, format!("bad address {address}: {e}"))
        })?;
        *self.base_url.write() = Some(url);
        Ok(())
    }

    fn url(&self, route: &str) -> Result<Url, EngineError> {
        let base = self
            .base_url
            .read()
            .clone()
            .ok_or_else(|| EngineError::transport(&self.name, "engine address not known yet"))?;
        base.join(route.trim_start_matches('/'))
            .map_err(|e| EngineError::transport(&self.name, e))
    }

    async fn post<Req, Rep>(&self, route: &str, body: &Req) -> Result<Rep, EngineError>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        let url = self.url(route)?;
        let response = self
            .context
            .http()
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::remote(&self.name, ErrorCode::Timeout, e.to_string())
                } else {
                    EngineError::transport(&self.name, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => EngineError::remote(
                    &self.name,
                    body.error.code.parse().unwrap_or(ErrorCode::Internal),
                    body.error.message,
                ),
                Err(_) => EngineError::remote(
                    &self.name,
                    code_for(status),
                    format!("{route} answered {status}: {text}"),
                ),
            });
        }

        response
            .json::<Rep>()
            .await
            .map_err(|e| EngineError::transport(&self.name, format!("bad reply to {route}: {e}")))
    }
}

#[async_trait]
impl EngineClient for JsonEngineClient {
    fn transport(&self) -> &'static str {
        "json"
    }

    async fn launch(&self, config: &EngineConfig) -> Result<ProcessHandle, EngineError> {
        let (process, address) = self.context.launch_engine(config).await?;
        self.set_address(&address)?;
        debug!(engine = %self.name, %address, "JSON engine client ready");
        Ok(process)
    }

    async fn initialize(&self, init_data: &Value) -> Result<Value, EngineError> {
        let reply: DataEnvelope = self
            .post(ROUTE_INITIALIZE, &DataEnvelope {
                data: init_data.clone(),
            })
            .await?;
        Ok(reply.data)
    }

    async fn run_loop_step(&self, timestep: SimulationTime) -> Result<SimulationTime, EngineError> {
        let reply: RunLoopReply = self
            .post(ROUTE_RUN_LOOP, &RunLoopRequest {
                time_step: timestep,
            })
            .await?;
        Ok(reply.time)
    }

    async fn get_devices(&self, ids: &[DeviceIdentifier]) -> Result<Vec<Device>, EngineError> {
        let request = self.adapter.encode_ids(ids);
        let reply: Map<String, Value> = self.post(ROUTE_GET_DEVICES, &request).await?;

        let devices = self
            .adapter
            .decode_list(reply)
            .map_err(|e| EngineError::device(&self.name, e))?;
        let found = devices.len();
        let devices: Vec<Device> = devices.into_iter().flatten().collect();
        if devices.len() < found {
            debug!(
                engine = %self.name,
                absent = found - devices.len(),
                "Engine does not know some requested devices"
            );
        }
        Ok(devices)
    }

    async fn set_devices(&self, devices: &[Device]) -> Result<(), EngineError> {
        let request = self
            .adapter
            .encode_list(devices)
            .map_err(|e| EngineError::device(&self.name, e))?;
        let _: Value = self.post(ROUTE_SET_DEVICES, &request).await?;
        Ok(())
    }

    async fn shutdown(&self, shutdown_data: &Value) -> Result<(), EngineError> {
        let _: Value = self
            .post(ROUTE_SHUTDOWN, &DataEnvelope {
                data: shutdown_data.clone(),
            })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for JsonEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonEngineClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url.read().as_ref().map(Url::as_str))
            .finish()
    }
}
