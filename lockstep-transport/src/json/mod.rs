//! Engine commands as JSON over HTTP.
//!
//! One POST per command, all bodies `application/json`:
//!
//! | Route | Request | Reply |
//! |-------|---------|-------|
//! | `/initialize` | `{"data": ..}` | `{"data": ..}` |
//! | `/run_loop` | `{"time_step": ns}` | `{"time": ns}` |
//! | `/get_device_information` | device ids by name | devices by name, `null` when absent |
//! | `/set_device` | devices by name | `{}` |
//! | `/shutdown` | `{"data": ..}` | `{}` |
//!
//! Failures answer with a non-2xx status and
//! `{"error": {"code": .., "message": ..}}`.

pub mod client;
pub mod codec;
pub mod server;

use axum::http::StatusCode;
use lockstep_core::{ErrorCode, SimulationTime};
use serde::{Deserialize, Serialize};

pub use client::JsonEngineClient;
pub use codec::{JsonAdapter, JsonDevice};
pub use server::JsonEngineServer;

pub const CONTENT_TYPE: &str = "application/json";

pub const ROUTE_INITIALIZE: &str = "/initialize";
pub const ROUTE_RUN_LOOP: &str = "/run_loop";
pub const ROUTE_GET_DEVICES: &str = "/get_device_information";
pub const ROUTE_SET_DEVICES: &str = "/set_device";
pub const ROUTE_SHUTDOWN: &str = "/shutdown";

/// Free-form document carried by initialize and shutdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunLoopRequest {
    pub time_step: SimulationTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunLoopReply {
    pub time: SimulationTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// HTTP status answering an error of class `code`.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::OutOfOrder => StatusCode::CONFLICT,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NoAdapter => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Backend | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error class of a status, for replies without a readable error body.
pub fn code_for(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::CONFLICT => ErrorCode::OutOfOrder,
        StatusCode::BAD_REQUEST => ErrorCode::InvalidArgument,
        StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::NoAdapter,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => ErrorCode::Timeout,
        _ => ErrorCode::Internal,
    }
}
