//! Command loop of an engine reached over the message channel.

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use lockstep_core::device::ConversionAdapter;
use lockstep_core::{
    DeviceError, EngineBackend, EngineError, EngineServerCore, ErrorCode, SimulationTime,
};
use tracing::{debug, info, warn};

use super::ChannelError;
use super::codec::ChannelAdapter;
use super::command::{Ack, ChannelCommand, CommandMessage};
use super::link::{ChannelEndpoint, Tag};
use super::schema::PackedDevice;

/// Most devices a single get or send command may announce.
pub const MAX_DEVICES_PER_COMMAND: usize = 1 << 16;

/// Serves one channel endpoint from a dedicated thread.
///
/// The server announces its process id, then blocks on the next command
/// and answers each with exactly one [`Ack`]. The lifecycle of the
/// wrapped core (STOPPED, PAUSED, RUNNING, STOPPING) decides which
/// commands are accepted. The loop ends after a successful shutdown or
/// when the client endpoint is dropped.
pub struct ChannelEngineServer<B> {
    core: Arc<EngineServerCore<B>>,
    adapter: ChannelAdapter,
}

impl<B: EngineBackend> ChannelEngineServer<B> {
    pub fn new(core: Arc<EngineServerCore<B>>) -> Self {
        Self {
            core,
            adapter: ChannelAdapter::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: ChannelAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    /// Starts the command loop on its own thread.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - Thread could not be spawned
    pub fn spawn(
        self,
        endpoint: ChannelEndpoint,
    ) -> std::io::Result<JoinHandle<Result<(), ChannelError>>> {
        std::thread::Builder::new()
            .name(format!("channel-{}", self.core.name()))
            .spawn(move || self.run(endpoint))
    }

    /// Runs the command loop on the calling thread.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Disconnected` - Client endpoint went away before shutdown
    pub fn run(self, mut endpoint: ChannelEndpoint) -> Result<(), ChannelError> {
        endpoint.send(Tag::Pid, Bytes::copy_from_slice(&std::process::id().to_le_bytes()))?;
        info!(engine = %self.core.name(), "Channel engine server started");

        loop {
            let message = match CommandMessage::decode(endpoint.blocking_recv(Tag::GeneralComm)?) {
                Ok(message) => message,
                Err(e) => {
                    warn!(engine = %self.core.name(), error = %e, "Dropping malformed command");
                    self.reply_error(&endpoint, &self.invalid(e))?;
                    continue;
                }
            };

            let command = message.command;
            let succeeded = self.serve(&mut endpoint, &message)?;
            debug!(
                engine = %self.core.name(),
                ?command,
                succeeded,
                state = %self.core.state(),
                "Channel command handled"
            );
            if command == ChannelCommand::Shutdown && succeeded {
                info!(engine = %self.core.name(), "Channel engine server stopped");
                return Ok(());
            }
        }
    }

    fn invalid(&self, reason: impl std::fmt::Display) -> EngineError {
        EngineError::remote(self.core.name(), ErrorCode::InvalidArgument, reason.to_string())
    }

    fn json_argument(&self, message: &CommandMessage) -> Result<serde_json::Value, EngineError> {
        let text = message.text();
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(text).map_err(|e| self.invalid(format!("invalid JSON document: {e}")))
    }

    fn reply_error(
        &self,
        endpoint: &ChannelEndpoint,
        error: &EngineError,
    ) -> Result<(), ChannelError> {
        endpoint.send(Tag::Ack, Ack::error(error.code()).encode())?;
        endpoint.send(Tag::Error, error.wire_message())
    }

    /// Sends the acknowledgement for `result`; returns whether it succeeded.
    fn reply(
        &self,
        endpoint: &ChannelEndpoint,
        result: Result<i64, EngineError>,
    ) -> Result<bool, ChannelError> {
        match result {
            Ok(value) => {
                endpoint.send(Tag::Ack, Ack::ok(value).encode())?;
                Ok(true)
            }
            Err(e) => {
                debug!(engine = %self.core.name(), error = %e, "Channel command rejected");
                self.reply_error(endpoint, &e)?;
                Ok(false)
            }
        }
    }

    fn receive_devices(
        &self,
        endpoint: &mut ChannelEndpoint,
        count: usize,
    ) -> Result<Vec<Result<PackedDevice, DeviceError>>, ChannelError> {
        let mut devices = Vec::with_capacity(count);
        for _ in 0..count {
            let sizes = endpoint.blocking_recv(Tag::GeneralComm)?;
            let body = endpoint.blocking_recv(Tag::Device)?;
            devices.push(PackedDevice::from_messages(&sizes, body));
        }
        Ok(devices)
    }

    fn device_count(&self, message: &CommandMessage) -> Result<usize, EngineError> {
        let count = message.int().map_err(|e| self.invalid(e))?;
        let count = usize::try_from(count)
            .map_err(|_| self.invalid(format!("negative device count {count}")))?;
        if count > MAX_DEVICES_PER_COMMAND {
            return Err(self.invalid(format!(
                "device count {count} exceeds {MAX_DEVICES_PER_COMMAND}"
            )));
        }
        Ok(count)
    }

    fn serve(
        &self,
        endpoint: &mut ChannelEndpoint,
        message: &CommandMessage,
    ) -> Result<bool, ChannelError> {
        let engine = self.core.name();
        match message.command {
            ChannelCommand::Initialize => {
                let result = self
                    .json_argument(message)
                    .and_then(|data| self.core.initialize(&data));
                match result {
                    Ok(reply) => {
                        endpoint.send(Tag::Ack, Ack::ok(0).encode())?;
                        endpoint.send(Tag::GeneralComm, reply.to_string())?;
                        Ok(true)
                    }
                    Err(e) => self.reply(endpoint, Err(e)),
                }
            }
            ChannelCommand::Shutdown => {
                let result = self
                    .json_argument(message)
                    .and_then(|data| self.core.shutdown(&data))
                    .map(|()| 0);
                self.reply(endpoint, result)
            }
            ChannelCommand::RunStep => {
                let result = message
                    .int()
                    .map_err(|e| self.invalid(e))
                    .and_then(|nanos| self.core.run_loop_step(SimulationTime::from_nanos(nanos)))
                    .map(SimulationTime::as_nanos);
                self.reply(endpoint, result)
            }
            ChannelCommand::GetDevices => {
                let count = match self.device_count(message) {
                    Ok(count) => count,
                    Err(e) => return self.reply(endpoint, Err(e)),
                };
                let requests = self.receive_devices(endpoint, count)?;

                let replies = requests
                    .into_iter()
                    .map(|packed| packed.and_then(|p| self.adapter.extract_id(&p)))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| EngineError::device(engine, e))
                    .and_then(|ids| self.core.get_devices(&ids))
                    .and_then(|devices| {
                        devices
                            .into_iter()
                            .map(|device| match device {
                                Some(device) => self.adapter.serialize(&device),
                                None => Ok(PackedDevice::absent()),
                            })
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(|e| EngineError::device(engine, e))
                    });

                match replies {
                    Ok(replies) => {
                        endpoint.send(Tag::Ack, Ack::ok(replies.len() as i64).encode())?;
                        for packed in replies {
                            endpoint.send(Tag::GeneralComm, packed.encode_sizes())?;
                            endpoint.send(Tag::Device, packed.body)?;
                        }
                        Ok(true)
                    }
                    Err(e) => self.reply(endpoint, Err(e)),
                }
            }
            ChannelCommand::SendDevices => {
                let count = match self.device_count(message) {
                    Ok(count) => count,
                    Err(e) => return self.reply(endpoint, Err(e)),
                };
                let incoming = self.receive_devices(endpoint, count)?;

                let result = incoming
                    .into_iter()
                    .map(|packed| packed.and_then(|p| self.adapter.deserialize(&p)))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| EngineError::device(engine, e))
                    .and_then(|devices| self.core.set_devices(devices))
                    .map(|()| count as i64);
                self.reply(endpoint, result)
            }
            ChannelCommand::None => self.reply(endpoint, Ok(0)),
        }
    }
}
