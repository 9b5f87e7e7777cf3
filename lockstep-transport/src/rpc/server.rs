//! TCP server implementing the RPC engine service.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use lockstep_core::device::ConversionAdapter;
use lockstep_core::{EngineBackend, EngineError, EngineServerCore, ErrorCode, SimulationTime};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::codec::RpcAdapter;
use super::frame::{decode_request, encode_reply, read_frame, write_frame};
use super::messages::{
    DeviceMessage, GetDeviceReply, InitReply, RpcRequest, RpcResponse, RpcStatus,
    RunLoopStepReply, SetDeviceReply, ShutdownReply,
};
use crate::TransportError;
use crate::net::{ServerHandle, ServerOptions, bind_with_retries};
use crate::registration::register_engine;

fn status(error: &EngineError) -> RpcStatus {
    RpcStatus {
        code: error.code(),
        message: error.wire_message(),
    }
}

fn parse_json(engine: &str, text: &str) -> Result<serde_json::Value, EngineError> {
    if text.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(text).map_err(|e| EngineError::Remote {
        engine: engine.to_string(),
        code: ErrorCode::InvalidArgument,
        message: format!("invalid JSON document: {e}"),
    })
}

/// RPC front of an [`EngineServerCore`].
pub struct RpcEngineServer<B> {
    core: Arc<EngineServerCore<B>>,
    adapter: Arc<RpcAdapter>,
}

impl<B: EngineBackend> RpcEngineServer<B> {
    pub fn new(core: Arc<EngineServerCore<B>>) -> Self {
        Self {
            core,
            adapter: Arc::new(RpcAdapter::new()),
        }
    }

    pub fn with_adapter(mut self, adapter: RpcAdapter) -> Self {
        self.adapter = Arc::new(adapter);
        self
    }

    /// Binds, starts accepting connections and registers the bound address.
    ///
    /// # Errors
    ///
    /// - `TransportError::Bind` - No port could be bound
    /// - `TransportError::Registration` - Registration listener rejected the address
    pub async fn start(self, options: &ServerOptions) -> Result<ServerHandle, TransportError> {
        let listener = bind_with_retries(&options.address, options.bind_retries).await?;
        let address = listener.local_addr()?;
        let engine = self.core.name().to_string();

        let task = tokio::spawn(accept_loop(listener, self.core, self.adapter));
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

async fn accept_loop<B: EngineBackend>(
    listener: TcpListener,
    core: Arc<EngineServerCore<B>>,
    adapter: Arc<RpcAdapter>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let core = Arc::clone(&core);
                let adapter = Arc::clone(&adapter);
                tokio::spawn(serve_connection(stream, peer, core, adapter));
            }
            Err(e) => {
                warn!(engine = %core.name(), error = %e, "Failed to accept RPC connection");
            }
        }
    }
}

async fn serve_connection<B: EngineBackend>(
    mut stream: TcpStream,
    peer: SocketAddr,
    core: Arc<EngineServerCore<B>>,
    adapter: Arc<RpcAdapter>,
) {
    debug!(engine = %core.name(), %peer, "RPC client connected");
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(engine = %core.name(), %peer, error = %e, "RPC connection failed");
                break;
            }
        };

        let reply = handle_frame(frame, &core, &adapter).await;
        if let Err(e) = write_frame(&mut stream, &encode_reply(&reply)).await {
            debug!(engine = %core.name(), %peer, error = %e, "Failed to send RPC reply");
            break;
        }
    }
    debug!(engine = %core.name(), %peer, "RPC client disconnected");
}

async fn handle_frame<B: EngineBackend>(
    frame: Bytes,
    core: &Arc<EngineServerCore<B>>,
    adapter: &Arc<RpcAdapter>,
) -> Result<RpcResponse, RpcStatus> {
    let request = decode_request(frame).map_err(|e| RpcStatus {
        code: ErrorCode::InvalidArgument,
        message: format!("malformed request: {e}"),
    })?;
    let method = request.name();

    let core = Arc::clone(core);
    let adapter = Arc::clone(adapter);
    let result = tokio::task::spawn_blocking(move || dispatch(&core, &adapter, request))
        .await
        .map_err(|e| RpcStatus {
            code: ErrorCode::Internal,
            message: format!("{method} task failed: {e}"),
        })?;

    result.map_err(|e| {
        debug!(method, error = %e, "RPC call rejected");
        status(&e)
    })
}

fn dispatch<B: EngineBackend>(
    core: &EngineServerCore<B>,
    adapter: &RpcAdapter,
    request: RpcRequest,
) -> Result<RpcResponse, EngineError> {
    let engine = core.name();
    match request {
        RpcRequest::Init(request) => {
            let reply = core.initialize(&parse_json(engine, &request.json)?)?;
            Ok(RpcResponse::Init(InitReply {
                json: reply.to_string(),
            }))
        }
        RpcRequest::Shutdown(request) => {
            core.shutdown(&parse_json(engine, &request.json)?)?;
            Ok(RpcResponse::Shutdown(ShutdownReply))
        }
        RpcRequest::RunLoopStep(request) => {
            let time = core.run_loop_step(SimulationTime::from_nanos(request.timestep))?;
            Ok(RpcResponse::RunLoopStep(RunLoopStepReply {
                engine_time: time.as_nanos(),
            }))
        }
        RpcRequest::GetDevice(request) => {
            let devices = core.get_devices(&request.ids)?;
            let messages = request
                .ids
                .into_iter()
                .zip(devices)
                .map(|(id, device)| match device {
                    Some(device) => adapter
                        .serialize(&device)
                        .map_err(|e| EngineError::device(engine, e)),
                    None => Ok(DeviceMessage { id, payload: None }),
                })
                .collect::<Result<_, _>>()?;
            Ok(RpcResponse::GetDevice(GetDeviceReply { messages }))
        }
        RpcRequest::SetDevice(request) => {
            let devices = adapter
                .decode_messages(&request.messages)
                .map_err(|e| EngineError::device(engine, e))?
                .into_iter()
                .flatten()
                .collect();
            core.set_devices(devices)?;
            Ok(RpcResponse::SetDevice(SetDeviceReply))
        }
    }
}
