//! Lockstep Transport - wire protocols between the scheduler and engines
//!
//! Three interchangeable implementations of the engine command surface:
//! JSON over HTTP ([`json`]), a length-prefixed binary RPC over TCP
//! ([`rpc`]) and a tagged message channel for co-located engines
//! ([`channel`]). Each provides an [`EngineClient`](lockstep_core::EngineClient),
//! a server that fronts an [`EngineServerCore`](lockstep_core::EngineServerCore),
//! and a conversion adapter for devices. Servers report their bound
//! address to the orchestrator's [`registration`] service.

pub mod channel;
pub mod context;
pub mod json;
pub mod net;
pub mod registration;
pub mod rpc;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::{ChannelAdapter, ChannelEngineClient, ChannelEngineServer};
pub use context::TransportContext;
pub use json::{JsonAdapter, JsonEngineClient, JsonEngineServer};
pub use net::{ServerHandle, ServerOptions};
pub use registration::{RegistrationHandle, spawn_registration_registry};
pub use rpc::{RpcAdapter, RpcEngineClient, RpcEngineServer};

/// Errors raised while standing up transport endpoints.
///
/// Failures of individual engine commands are reported as
/// [`EngineError`](lockstep_core::EngineError) instead.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid address '{address}'")]
    InvalidAddress { address: String },

    #[error("Could not bind {address} after {attempts} attempts: {source}")]
    Bind {
        address: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Registration of engine '{engine}' failed: {reason}")]
    Registration { engine: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
