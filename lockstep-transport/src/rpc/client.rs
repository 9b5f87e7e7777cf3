//! Client side of the binary RPC transport.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lockstep_core::engine::ProcessHandle;
use lockstep_core::{
    Device, DeviceIdentifier, EngineClient, EngineConfig, EngineError, ErrorCode, SimulationTime,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::codec::RpcAdapter;
use super::effective_deadline;
use super::frame::{decode_reply, encode_request, read_frame, write_frame};
use super::messages::{
    GetDeviceRequest, InitRequest, RpcRequest, RpcResponse, RpcStatus, RunLoopStepRequest,
    SetDeviceRequest, ShutdownRequest,
};
use crate::context::TransportContext;

/// Engine client holding one TCP connection to its engine server.
///
/// Calls are serialized over the connection. The connection is opened on the
/// first call and dropped after any I/O failure, missed deadline or
/// cancelled call, so the next call reconnects.
pub struct RpcEngineClient {
    name: String,
    context: Arc<TransportContext>,
    adapter: RpcAdapter,
    address: RwLock<Option<String>>,
    connection: Mutex<Option<TcpStream>>,
    deadline: Option<Duration>,
}

impl RpcEngineClient {
    pub fn new(name: impl Into<String>, context: Arc<TransportContext>) -> Self {
        let deadline = effective_deadline(context.config().rpc_deadline);
        Self {
            name: name.into(),
            context,
            adapter: RpcAdapter::new(),
            address: RwLock::new(None),
            connection: Mutex::new(None),
            deadline,
        }
    }

    /// Client for a server already listening at `address`.
    pub fn connected(
        name: impl Into<String>,
        context: Arc<TransportContext>,
        address: impl Into<String>,
    ) -> Self {
        let client = Self::new(name, context);
        *client.address.write() = Some(address.into());
        client
    }

    pub fn with_adapter(mut self, adapter: RpcAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    /// Overrides the per-call deadline of the context configuration.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = effective_deadline(deadline);
        self
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, EngineError> {
        let method = request.name();
        let mut slot = ConnectionSlot {
            connection: self.connection.lock().await,
            completed: false,
        };

        let exchange = self.exchange(&mut slot.connection, &request);
        let reply = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, exchange).await.ok(),
            None => Some(exchange.await),
        };
        let Some(reply) = reply else {
            return Err(EngineError::remote(
                &self.name,
                ErrorCode::Timeout,
                format!("{method}: deadline exceeded"),
            ));
        };

        let reply = reply
            .map_err(|e| EngineError::transport(&self.name, format!("{method}: {e}")))?;
        slot.completed = true;
        reply.map_err(|status| EngineError::remote(&self.name, status.code, status.message))
    }

    async fn exchange(
        &self,
        connection: &mut Option<TcpStream>,
        request: &RpcRequest,
    ) -> io::Result<Result<RpcResponse, RpcStatus>> {
        if connection.is_none() {
            let address = self.address.read().clone().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "engine address not known yet")
            })?;
            let stream = TcpStream::connect(&address).await?;
            stream.set_nodelay(true)?;
            debug!(engine = %self.name, %address, "RPC connection established");
            *connection = Some(stream);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        write_frame(stream, &encode_request(request)).await?;
        let frame = read_frame(stream).await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection")
        })?;
        decode_reply(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn unexpected(&self, method: &str, reply: &RpcResponse) -> EngineError {
        EngineError::transport(
            &self.name,
            format!("{method} answered with a {} reply", reply_name(reply)),
        )
    }
}

/// Locked connection that is dropped unless the exchange on it completed.
///
/// A missed deadline, an I/O error or a cancelled call may leave a reply
/// unread on the stream, which would answer the next request.
struct ConnectionSlot<'a> {
    connection: MutexGuard<'a, Option<TcpStream>>,
    completed: bool,
}

impl Drop for ConnectionSlot<'_> {
    fn drop(&mut self) {
        if !self.completed {
            *self.connection = None;
        }
    }
}

fn reply_name(reply: &RpcResponse) -> &'static str {
    match reply {
        RpcResponse::Init(_) => "init",
        RpcResponse::Shutdown(_) => "shutdown",
        RpcResponse::RunLoopStep(_) => "run_loop_step",
        RpcResponse::GetDevice(_) => "get_device",
        RpcResponse::SetDevice(_) => "set_device",
    }
}

fn json_text(value: &Value) -> String {
    if value.is_null() {
        String::new()
    } else {
        value.to_string()
    }
}

#[async_trait]
impl EngineClient for RpcEngineClient {
    fn transport(&self) -> &'static str {
        "rpc"
    }

    async fn launch(&self, config: &EngineConfig) -> Result<ProcessHandle, EngineError> {
        let (process, address) = self.context.launch_engine(config).await?;
        *self.address.write() = Some(address.clone());
        *self.connection.lock().await = None;
        debug!(engine = %self.name, %address, "RPC engine client ready");
        Ok(process)
    }

    async fn initialize(&self, init_data: &Value) -> Result<Value, EngineError> {
        let request = RpcRequest::Init(InitRequest {
            json: json_text(init_data),
        });
        match self.call(request).await? {
            RpcResponse::Init(reply) if reply.json.is_empty() => Ok(Value::Null),
            RpcResponse::Init(reply) => serde_json::from_str(&reply.json).map_err(|e| {
                EngineError::transport(&self.name, format!("init reply is not JSON: {e}"))
            }),
            other => Err(self.unexpected("init", &other)),
        }
    }

    async fn run_loop_step(&self, timestep: SimulationTime) -> Result<SimulationTime, EngineError> {
        let request = RpcRequest::RunLoopStep(RunLoopStepRequest {
            timestep: timestep.as_nanos(),
        });
        match self.call(request).await? {
            RpcResponse::RunLoopStep(reply) => Ok(SimulationTime::from_nanos(reply.engine_time)),
            other => Err(self.unexpected("run_loop_step", &other)),
        }
    }

    async fn get_devices(&self, ids: &[DeviceIdentifier]) -> Result<Vec<Device>, EngineError> {
        let request = RpcRequest::GetDevice(GetDeviceRequest { ids: ids.to_vec() });
        let messages = match self.call(request).await? {
            RpcResponse::GetDevice(reply) => reply.messages,
            other => return Err(self.unexpected("get_device", &other)),
        };

        let decoded = self
            .adapter
            .decode_messages(&messages)
            .map_err(|e| EngineError::device(&self.name, e))?;
        let found = decoded.len();
        let devices: Vec<Device> = decoded.into_iter().flatten().collect();
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
        let messages = self
            .adapter
            .encode_devices(devices)
            .map_err(|e| EngineError::device(&self.name, e))?;
        match self.call(RpcRequest::SetDevice(SetDeviceRequest { messages })).await? {
            RpcResponse::SetDevice(_) => Ok(()),
            other => Err(self.unexpected("set_device", &other)),
        }
    }

    async fn shutdown(&self, shutdown_data: &Value) -> Result<(), EngineError> {
        let request = RpcRequest::Shutdown(ShutdownRequest {
            json: json_text(shutdown_data),
        });
        let result = match self.call(request).await? {
            RpcResponse::Shutdown(_) => Ok(()),
            other => Err(self.unexpected("shutdown", &other)),
        };
        *self.connection.lock().await = None;
        result
    }
}

impl std::fmt::Debug for RpcEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngineClient")
            .field("name", &self.name)
            .field("address", &*self.address.read())
            .field("deadline", &self.deadline)
            .finish()
    }
}
