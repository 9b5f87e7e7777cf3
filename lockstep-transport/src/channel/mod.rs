//! Tagged message channel for co-located engines.
//!
//! Each side of a [`channel_pair`] keeps one ordered queue per [`Tag`].
//! Commands and size vectors travel on `GeneralComm`, fixed-layout device
//! bodies on `Device`, fixed-size acknowledgements on `Ack`, error text
//! on `Error`, and the engine's process id once on `Pid` right after the
//! channel is set up.
//!
//! Devices cross the channel in two parts: first the vector of
//! variable-length field sizes, then the packed body laid out by a
//! [`Schema`].

pub mod client;
pub mod codec;
pub mod command;
pub mod link;
pub mod schema;
pub mod server;

pub use client::ChannelEngineClient;
pub use codec::ChannelAdapter;
pub use command::{Ack, ChannelCommand, CommandInfo, CommandMessage};
pub use link::{ChannelEndpoint, Tag, channel_pair};
pub use schema::{FieldKind, PackedDevice, Schema};
pub use server::ChannelEngineServer;

/// Errors of the channel link and its message encodings.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel peer went away while waiting for a {tag} message")]
    Disconnected { tag: Tag },

    #[error("Malformed {what} message: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("Timed out after {timeout:?} waiting for a {tag} message")]
    Timeout {
        tag: Tag,
        timeout: std::time::Duration,
    },
}

impl ChannelError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        ChannelError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}
