//! Orchestrator side of the message channel.

use std::time::Duration;

use async_trait::async_trait;
use lockstep_core::device::ConversionAdapter;
use lockstep_core::engine::ProcessHandle;
use lockstep_core::{
    Device, DeviceIdentifier, EngineClient, EngineConfig, EngineError, SimulationTime,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::ChannelError;
use super::codec::ChannelAdapter;
use super::command::{Ack, ChannelCommand, CommandInfo, CommandMessage};
use super::link::{ChannelEndpoint, Tag};
use super::schema::PackedDevice;

/// Engine client driving a [`ChannelEngineServer`](super::ChannelEngineServer)
/// through the parent side of a channel pair.
pub struct ChannelEngineClient {
    name: String,
    endpoint: Mutex<ChannelEndpoint>,
    adapter: ChannelAdapter,
    handshake_timeout: Duration,
}

impl ChannelEngineClient {
    /// `handshake_timeout` bounds the wait for the engine's process id.
    pub fn new(
        name: impl Into<String>,
        endpoint: ChannelEndpoint,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: Mutex::new(endpoint),
            adapter: ChannelAdapter::new(),
            handshake_timeout,
        }
    }

    pub fn with_adapter(mut self, adapter: ChannelAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    fn link_error(&self, error: ChannelError) -> EngineError {
        EngineError::transport(&self.name, error)
    }

    fn send_command(
        &self,
        endpoint: &ChannelEndpoint,
        command: ChannelCommand,
        info: CommandInfo,
    ) -> Result<(), EngineError> {
        endpoint
            .send(Tag::GeneralComm, CommandMessage::new(command, info).encode())
            .map_err(|e| self.link_error(e))
    }

    fn send_packed(
        &self,
        endpoint: &ChannelEndpoint,
        packed: PackedDevice,
    ) -> Result<(), EngineError> {
        endpoint
            .send(Tag::GeneralComm, packed.encode_sizes())
            .and_then(|()| endpoint.send(Tag::Device, packed.body))
            .map_err(|e| self.link_error(e))
    }

    /// Waits for the acknowledgement; a failed one is turned into the
    /// remote error, with its message read from the error tag.
    async fn await_ack(&self, endpoint: &mut ChannelEndpoint) -> Result<Ack, EngineError> {
        let raw = endpoint.recv(Tag::Ack).await.map_err(|e| self.link_error(e))?;
        let ack = Ack::decode(raw).map_err(|e| self.link_error(e))?;
        if ack.is_ok() {
            return Ok(ack);
        }

        let message = endpoint
            .recv(Tag::Error)
            .await
            .map_err(|e| self.link_error(e))?;
        Err(EngineError::remote(
            &self.name,
            ack.error_code(),
            String::from_utf8_lossy(&message),
        ))
    }

    async fn simple_command(
        &self,
        command: ChannelCommand,
        info: CommandInfo,
    ) -> Result<Ack, EngineError> {
        let mut endpoint = self.endpoint.lock().await;
        self.send_command(&endpoint, command, info)?;
        self.await_ack(&mut endpoint).await
    }
}

fn json_info(value: &Value) -> CommandInfo {
    if value.is_null() {
        CommandInfo::Text(String::new())
    } else {
        CommandInfo::Text(value.to_string())
    }
}

#[async_trait]
impl EngineClient for ChannelEngineClient {
    fn transport(&self) -> &'static str {
        "channel"
    }

    /// The engine side is already running; launching waits for the process
    /// id it announces once the channel is up.
    async fn launch(&self, _config: &EngineConfig) -> Result<ProcessHandle, EngineError> {
        let mut endpoint = self.endpoint.lock().await;
        let raw = endpoint
            .recv_within(Tag::Pid, self.handshake_timeout)
            .await
            .map_err(|e| EngineError::LaunchFailed {
                engine: self.name.clone(),
                reason: e.to_string(),
            })?;
        let pid: [u8; 4] = raw.as_ref().try_into().map_err(|_| EngineError::LaunchFailed {
            engine: self.name.clone(),
            reason: format!("process id message has {} bytes", raw.len()),
        })?;
        let pid = u32::from_le_bytes(pid);
        debug!(engine = %self.name, pid, "Channel engine announced itself");
        Ok(ProcessHandle::from_pid(pid))
    }

    async fn initialize(&self, init_data: &Value) -> Result<Value, EngineError> {
        let mut endpoint = self.endpoint.lock().await;
        self.send_command(&endpoint, ChannelCommand::Initialize, json_info(init_data))?;
        self.await_ack(&mut endpoint).await?;

        let reply = endpoint
            .recv(Tag::GeneralComm)
            .await
            .map_err(|e| self.link_error(e))?;
        if reply.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&reply).map_err(|e| {
            EngineError::transport(&self.name, format!("init reply is not JSON: {e}"))
        })
    }

    async fn run_loop_step(&self, timestep: SimulationTime) -> Result<SimulationTime, EngineError> {
        let ack = self
            .simple_command(ChannelCommand::RunStep, CommandInfo::Int(timestep.as_nanos()))
            .await?;
        Ok(SimulationTime::from_nanos(ack.value))
    }

    async fn get_devices(&self, ids: &[DeviceIdentifier]) -> Result<Vec<Device>, EngineError> {
        let requests = ids
            .iter()
            .map(|id| self.adapter.encode_identifier(id))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::device(&self.name, e))?;

        let mut endpoint = self.endpoint.lock().await;
        self.send_command(
            &endpoint,
            ChannelCommand::GetDevices,
            CommandInfo::Int(requests.len() as i64),
        )?;
        for packed in requests {
            self.send_packed(&endpoint, packed)?;
        }
        let ack = self.await_ack(&mut endpoint).await?;

        let mut devices = Vec::with_capacity(ids.len());
        let mut absent = 0usize;
        for _ in 0..ack.value.max(0) {
            let sizes = endpoint
                .recv(Tag::GeneralComm)
                .await
                .map_err(|e| self.link_error(e))?;
            let body = endpoint.recv(Tag::Device).await.map_err(|e| self.link_error(e))?;
            let device = PackedDevice::from_messages(&sizes, body)
                .and_then(|packed| self.adapter.decode_optional(&packed))
                .map_err(|e| EngineError::device(&self.name, e))?;
            match device {
                Some(device) => devices.push(device),
                None => absent += 1,
            }
        }
        if absent > 0 {
            debug!(engine = %self.name, absent, "Engine does not know some requested devices");
        }
        Ok(devices)
    }

    async fn set_devices(&self, devices: &[Device]) -> Result<(), EngineError> {
        let packed = devices
            .iter()
            .map(|device| self.adapter.serialize(device))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::device(&self.name, e))?;

        let mut endpoint = self.endpoint.lock().await;
        self.send_command(
            &endpoint,
            ChannelCommand::SendDevices,
            CommandInfo::Int(packed.len() as i64),
        )?;
        for device in packed {
            self.send_packed(&endpoint, device)?;
        }
        self.await_ack(&mut endpoint).await.map(|_| ())
    }

    async fn shutdown(&self, shutdown_data: &Value) -> Result<(), EngineError> {
        self.simple_command(ChannelCommand::Shutdown, json_info(shutdown_data))
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for ChannelEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEngineClient")
            .field("name", &self.name)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use lockstep_core::device::NestStatus;
    use lockstep_core::{DeviceIdentifiers, EngineHandle, ErrorCode};

    use super::*;
    use crate::channel::ChannelEngineServer;
    use crate::channel::link::channel_pair;
    use crate::test_support::{core, sample_devices};

    fn connected(name: &str) -> ChannelEngineClient {
        let (parent, child) = channel_pair();
        ChannelEngineServer::new(core(name)).spawn(child).unwrap();
        ChannelEngineClient::new(name, parent, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_full_lifecycle_over_channel() {
        let config = EngineConfig::new("engine_3", SimulationTime::from_millis(1));
        let mut handle = EngineHandle::new(config, connected("engine_3"));

        let pid = handle.launch().await.unwrap();
        assert_eq!(pid, std::process::id());
        handle.initialize().await.unwrap();
        handle.handle_input_devices(sample_devices("engine_3")).await.unwrap();

        handle.run_loop_step(SimulationTime::from_millis(1)).unwrap();
        handle.wait_for_step_completion().await.unwrap();
        assert_eq!(handle.engine_time(), SimulationTime::from_millis(1));

        let ids: DeviceIdentifiers = sample_devices("engine_3")
            .iter()
            .map(|d| d.id().clone())
            .chain([DeviceIdentifier::new("ghost", "engine_3", "nest_device")])
            .collect();
        let cache = handle.request_output_devices(&ids).await.unwrap();
        assert_eq!(cache.len(), 3);
        assert!(cache.get("ghost").is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_is_remote_error() {
        let client = connected("engine_3");
        let err = client
            .get_devices(&[DeviceIdentifier::new("elbow", "engine_3", "physics_joint")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfOrder);
        assert!(matches!(err, EngineError::Remote { .. }));

        // The link stays usable after a rejected command.
        client.initialize(&Value::Null).await.unwrap();
    }

    #[tokio::test]
    async fn test_voltmeter_identifier_survives_channel() {
        let client = connected("engine_3");
        client.initialize(&serde_json::json!({ "world": 1 })).await.unwrap();

        let voltmeter = Device::new("voltmeter", "engine_3", NestStatus {
            data: serde_json::json!({ "events": [1, 2, 3] }),
        });
        client.set_devices(std::slice::from_ref(&voltmeter)).await.unwrap();
        let back = client.get_devices(&[voltmeter.id().clone()]).await.unwrap();

        assert_eq!(back, vec![voltmeter]);
    }

    #[tokio::test]
    async fn test_missing_engine_fails_launch() {
        let (parent, _child) = channel_pair();
        let client = ChannelEngineClient::new("engine_3", parent, Duration::from_millis(20));
        let config = EngineConfig::new("engine_3", SimulationTime::from_millis(1));

        let err = client.launch(&config).await.unwrap_err();
        assert!(matches!(err, EngineError::LaunchFailed { .. }));
    }
}
