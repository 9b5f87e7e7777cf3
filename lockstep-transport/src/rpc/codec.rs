//! Device conversion for the RPC transport.

use bytes::Bytes;
use lockstep_core::device::{
    CameraFrame, ConversionAdapter, ConverterRegistry, DeviceConverter, DevicePayload, JointState,
    LinkState, NestStatus,
};
use lockstep_core::{Device, DeviceData, DeviceError, DeviceIdentifier};

use super::messages::{DeviceMessage, PayloadMessage};

fn mismatch(device: &Device, expected: &str) -> DeviceError {
    DeviceError::TypeMismatch {
        device: device.name().to_string(),
        declared: expected.to_string(),
        actual: device.data().type_name().to_string(),
    }
}

fn wrong_payload(id: &DeviceIdentifier) -> DeviceError {
    DeviceError::Malformed {
        reason: format!(
            "device '{}' of type '{}' carries a different payload",
            id.name, id.device_type
        ),
    }
}

fn message(device: &Device, payload: PayloadMessage) -> DeviceMessage {
    DeviceMessage {
        id: device.id().clone(),
        payload: Some(payload),
    }
}

struct JointConverter;

impl DeviceConverter<DeviceMessage> for JointConverter {
    fn to_wire(&self, device: &Device) -> Result<DeviceMessage, DeviceError> {
        let joint = device
            .payload::<JointState>()
            .ok_or_else(|| mismatch(device, JointState::TYPE_NAME))?;
        Ok(message(device, PayloadMessage::Joint {
            position: joint.position,
            velocity: joint.velocity,
            effort: joint.effort,
        }))
    }

    fn from_wire(
        &self,
        id: &DeviceIdentifier,
        wire: &DeviceMessage,
    ) -> Result<DeviceData, DeviceError> {
        match wire.payload {
            Some(PayloadMessage::Joint {
                position,
                velocity,
                effort,
            }) => Ok(JointState {
                position,
                velocity,
                effort,
            }
            .into_data()),
            _ => Err(wrong_payload(id)),
        }
    }
}

struct LinkConverter;

impl DeviceConverter<DeviceMessage> for LinkConverter {
    fn to_wire(&self, device: &Device) -> Result<DeviceMessage, DeviceError> {
        let link = device
            .payload::<LinkState>()
            .ok_or_else(|| mismatch(device, LinkState::TYPE_NAME))?;
        Ok(message(device, PayloadMessage::Link {
            position: link.position,
            orientation: link.orientation,
            linear_velocity: link.linear_velocity,
            angular_velocity: link.angular_velocity,
        }))
    }

    fn from_wire(
        &self,
        id: &DeviceIdentifier,
        wire: &DeviceMessage,
    ) -> Result<DeviceData, DeviceError> {
        match wire.payload {
            Some(PayloadMessage::Link {
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            }) => Ok(LinkState {
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            }
            .into_data()),
            _ => Err(wrong_payload(id)),
        }
    }
}

struct CameraConverter;

impl DeviceConverter<DeviceMessage> for CameraConverter {
    fn to_wire(&self, device: &Device) -> Result<DeviceMessage, DeviceError> {
        let frame = device
            .payload::<CameraFrame>()
            .ok_or_else(|| mismatch(device, CameraFrame::TYPE_NAME))?;
        Ok(message(device, PayloadMessage::Camera {
            width: frame.width,
            height: frame.height,
            depth: frame.depth,
            image: Bytes::copy_from_slice(&frame.image),
        }))
    }

    fn from_wire(
        &self,
        id: &DeviceIdentifier,
        wire: &DeviceMessage,
    ) -> Result<DeviceData, DeviceError> {
        match &wire.payload {
            Some(PayloadMessage::Camera {
                width,
                height,
                depth,
                image,
            }) => Ok(CameraFrame {
                width: *width,
                height: *height,
                depth: *depth,
                image: image.to_vec(),
            }
            .into_data()),
            _ => Err(wrong_payload(id)),
        }
    }
}

/// Neural simulator status travels as JSON text.
struct NestConverter;

impl DeviceConverter<DeviceMessage> for NestConverter {
    fn to_wire(&self, device: &Device) -> Result<DeviceMessage, DeviceError> {
        let status = device
            .payload::<NestStatus>()
            .ok_or_else(|| mismatch(device, NestStatus::TYPE_NAME))?;
        Ok(message(device, PayloadMessage::Json {
            text: status.data.to_string(),
        }))
    }

    fn from_wire(
        &self,
        id: &DeviceIdentifier,
        wire: &DeviceMessage,
    ) -> Result<DeviceData, DeviceError> {
        match &wire.payload {
            Some(PayloadMessage::Json { text }) => {
                let data = serde_json::from_str(text).map_err(|e| DeviceError::Malformed {
                    reason: format!("device '{}': {e}", id.name),
                })?;
                Ok(NestStatus { data }.into_data())
            }
            _ => Err(wrong_payload(id)),
        }
    }
}

/// Conversion adapter of the RPC transport.
#[derive(Debug)]
pub struct RpcAdapter {
    registry: ConverterRegistry<DeviceMessage>,
}

impl RpcAdapter {
    pub fn new() -> Self {
        Self {
            registry: ConverterRegistry::new()
                .with(JointState::TYPE_NAME, JointConverter)
                .with(LinkState::TYPE_NAME, LinkConverter)
                .with(CameraFrame::TYPE_NAME, CameraConverter)
                .with(NestStatus::TYPE_NAME, NestConverter),
        }
    }

    pub fn with_registry(registry: ConverterRegistry<DeviceMessage>) -> Self {
        Self { registry }
    }

    /// Decodes a reply list. Entries without payload are absent devices.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - A declared type has no converter
    /// - `DeviceError::Malformed` - Payload does not match the declared type
    pub fn decode_messages(
        &self,
        messages: &[DeviceMessage],
    ) -> Result<Vec<Option<Device>>, DeviceError> {
        messages
            .iter()
            .map(|message| match message.payload {
                Some(_) => self.deserialize(message).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - A payload type has no converter
    pub fn encode_devices(&self, devices: &[Device]) -> Result<Vec<DeviceMessage>, DeviceError> {
        devices.iter().map(|device| self.serialize(device)).collect()
    }
}

impl Default for RpcAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionAdapter for RpcAdapter {
    type Wire = DeviceMessage;

    fn serialize(&self, device: &Device) -> Result<DeviceMessage, DeviceError> {
        self.registry.serialize(device)
    }

    fn deserialize(&self, wire: &DeviceMessage) -> Result<Device, DeviceError> {
        self.registry.deserialize(self.extract_id(wire)?, wire)
    }

    fn extract_id(&self, wire: &DeviceMessage) -> Result<DeviceIdentifier, DeviceError> {
        if wire.id.name.is_empty() {
            return Err(DeviceError::Malformed {
                reason: "device message without name".to_string(),
            });
        }
        Ok(wire.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::frame::{decode_request, encode_request};
    use crate::rpc::messages::{RpcRequest, SetDeviceRequest};
    use crate::test_support::sample_devices;

    #[test]
    fn test_devices_survive_encoding_and_framing() {
        let adapter = RpcAdapter::new();
        let devices = sample_devices("engine_1");

        let request = RpcRequest::SetDevice(SetDeviceRequest {
            messages: adapter.encode_devices(&devices).unwrap(),
        });
        let RpcRequest::SetDevice(decoded) = decode_request(encode_request(&request)).unwrap()
        else {
            panic!("wrong request variant");
        };

        let back: Vec<Device> = adapter
            .decode_messages(&decoded.messages)
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(back, devices);
    }

    #[test]
    fn test_identifier_triple_survives() {
        let adapter = RpcAdapter::new();
        let device = Device::new("voltmeter", "engine_1", NestStatus::default());
        let wire = adapter.serialize(&device).unwrap();

        assert_eq!(
            adapter.extract_id(&wire).unwrap(),
            DeviceIdentifier::new("voltmeter", "engine_1", "nest_device")
        );
    }

    #[test]
    fn test_payload_must_match_declared_type() {
        let adapter = RpcAdapter::new();
        let wire = DeviceMessage {
            id: DeviceIdentifier::new("elbow", "physics", "physics_joint"),
            payload: Some(PayloadMessage::Json {
                text: "{}".to_string(),
            }),
        };
        assert!(matches!(adapter.deserialize(&wire), Err(DeviceError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_type_has_no_adapter() {
        let adapter = RpcAdapter::new();
        let wire = DeviceMessage {
            id: DeviceIdentifier::new("probe", "lab", "thermometer"),
            payload: Some(PayloadMessage::Json {
                text: "{}".to_string(),
            }),
        };
        assert!(matches!(adapter.deserialize(&wire), Err(DeviceError::NoAdapter { .. })));
    }
}
