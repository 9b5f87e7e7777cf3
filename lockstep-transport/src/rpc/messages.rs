//! Typed messages of the RPC engine service.

use bytes::Bytes;
use lockstep_core::{DeviceIdentifier, ErrorCode};

/// Payload variants a device message can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadMessage {
    Joint {
        position: f64,
        velocity: f64,
        effort: f64,
    },
    Link {
        position: [f64; 3],
        orientation: [f64; 4],
        linear_velocity: [f64; 3],
        angular_velocity: [f64; 3],
    },
    Camera {
        width: u32,
        height: u32,
        depth: u8,
        image: Bytes,
    },
    /// Free-form JSON text
    Json { text: String },
}

impl PayloadMessage {
    pub(crate) fn kind(&self) -> u8 {
        match self {
            PayloadMessage::Joint { .. } => 1,
            PayloadMessage::Link { .. } => 2,
            PayloadMessage::Camera { .. } => 3,
            PayloadMessage::Json { .. } => 4,
        }
    }
}

/// Identifier plus optional payload. A reply entry without payload marks a
/// device the engine does not know.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMessage {
    pub id: DeviceIdentifier,
    pub payload: Option<PayloadMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitRequest {
    pub json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitReply {
    pub json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownRequest {
    pub json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLoopStepRequest {
    /// Nanoseconds to advance
    pub timestep: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLoopStepReply {
    /// Engine time after the step, in nanoseconds
    pub engine_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetDeviceRequest {
    pub ids: Vec<DeviceIdentifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetDeviceReply {
    pub messages: Vec<DeviceMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetDeviceRequest {
    pub messages: Vec<DeviceMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetDeviceReply;

/// A call on the engine service.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    Init(InitRequest),
    Shutdown(ShutdownRequest),
    RunLoopStep(RunLoopStepRequest),
    GetDevice(GetDeviceRequest),
    SetDevice(SetDeviceRequest),
}

/// Successful answer to an [`RpcRequest`] of the same variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    Init(InitReply),
    Shutdown(ShutdownReply),
    RunLoopStep(RunLoopStepReply),
    GetDevice(GetDeviceReply),
    SetDevice(SetDeviceReply),
}

/// Non-OK status of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcStatus {
    pub code: ErrorCode,
    pub message: String,
}

/// Method identifiers on the wire.
pub(crate) mod method {
    pub const INIT: u8 = 1;
    pub const SHUTDOWN: u8 = 2;
    pub const RUN_LOOP_STEP: u8 = 3;
    pub const GET_DEVICE: u8 = 4;
    pub const SET_DEVICE: u8 = 5;
}

impl RpcRequest {
    pub(crate) fn method(&self) -> u8 {
        match self {
            RpcRequest::Init(_) => method::INIT,
            RpcRequest::Shutdown(_) => method::SHUTDOWN,
            RpcRequest::RunLoopStep(_) => method::RUN_LOOP_STEP,
            RpcRequest::GetDevice(_) => method::GET_DEVICE,
            RpcRequest::SetDevice(_) => method::SET_DEVICE,
        }
    }

    /// Method name, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::Init(_) => "init",
            RpcRequest::Shutdown(_) => "shutdown",
            RpcRequest::RunLoopStep(_) => "run_loop_step",
            RpcRequest::GetDevice(_) => "get_device",
            RpcRequest::SetDevice(_) => "set_device",
        }
    }
}

impl RpcResponse {
    pub(crate) fn method(&self) -> u8 {
        match self {
            RpcResponse::Init(_) => method::INIT,
            RpcResponse::Shutdown(_) => method::SHUTDOWN,
            RpcResponse::RunLoopStep(_) => method::RUN_LOOP_STEP,
            RpcResponse::GetDevice(_) => method::GET_DEVICE,
            RpcResponse::SetDevice(_) => method::SET_DEVICE,
        }
    }
}
