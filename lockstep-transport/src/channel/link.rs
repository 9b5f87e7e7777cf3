//! In-process link with one ordered queue per message tag.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::ChannelError;

/// Message classes; each has its own queue in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Device = 0,
    GeneralComm = 1,
    Ack = 2,
    Error = 3,
    Pid = 4,
}

const TAG_COUNT: usize = 5;

impl Tag {
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Device => "device",
            Tag::GeneralComm => "general",
            Tag::Ack => "ack",
            Tag::Error => "error",
            Tag::Pid => "pid",
        };
        f.write_str(name)
    }
}

/// One side of a tagged link.
///
/// Async receives are for the orchestrator; engine servers run on their
/// own thread and use [`ChannelEndpoint::blocking_recv`].
#[derive(Debug)]
pub struct ChannelEndpoint {
    outgoing: Vec<mpsc::UnboundedSender<Bytes>>,
    incoming: Vec<mpsc::UnboundedReceiver<Bytes>>,
}

/// Creates a connected pair of endpoints.
pub fn channel_pair() -> (ChannelEndpoint, ChannelEndpoint) {
    let mut a = ChannelEndpoint {
        outgoing: Vec::with_capacity(TAG_COUNT),
        incoming: Vec::with_capacity(TAG_COUNT),
    };
    let mut b = ChannelEndpoint {
        outgoing: Vec::with_capacity(TAG_COUNT),
        incoming: Vec::with_capacity(TAG_COUNT),
    };
    for _ in 0..TAG_COUNT {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        a.outgoing.push(a_tx);
        a.incoming.push(a_rx);
        b.outgoing.push(b_tx);
        b.incoming.push(b_rx);
    }
    (a, b)
}

impl ChannelEndpoint {
    /// Queues `message` for the peer.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Disconnected` - Peer endpoint was dropped
    pub fn send(&self, tag: Tag, message: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.outgoing[tag.index()]
            .send(message.into())
            .map_err(|_| ChannelError::Disconnected { tag })
    }

    /// Waits for the next message on `tag`.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Disconnected` - Peer endpoint was dropped
    pub async fn recv(&mut self, tag: Tag) -> Result<Bytes, ChannelError> {
        self.incoming[tag.index()]
            .recv()
            .await
            .ok_or(ChannelError::Disconnected { tag })
    }

    /// Like [`recv`](Self::recv), bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Disconnected` - Peer endpoint was dropped
    /// - `ChannelError::Timeout` - Nothing arrived in time
    pub async fn recv_within(
        &mut self,
        tag: Tag,
        timeout: Duration,
    ) -> Result<Bytes, ChannelError> {
        tokio::time::timeout(timeout, self.recv(tag))
            .await
            .map_err(|_| ChannelError::Timeout { tag, timeout })?
    }

    /// Blocks the calling thread until a message arrives on `tag`.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Disconnected` - Peer endpoint was dropped
    pub fn blocking_recv(&mut self, tag: Tag) -> Result<Bytes, ChannelError> {
        self.incoming[tag.index()]
            .blocking_recv()
            .ok_or(ChannelError::Disconnected { tag })
    }
}
