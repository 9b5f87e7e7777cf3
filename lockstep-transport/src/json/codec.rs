//! Device conversion for the JSON transport.
//!
//! A device list is an object mapping device name to
//! `{"type": .., "engine_name": .., ...payload fields}`. Absent devices in
//! a reply are `null`.

use std::marker::PhantomData;

use lockstep_core::device::{
    CameraFrame, ConversionAdapter, ConverterRegistry, DeviceConverter, DevicePayload, JointState,
    LinkState, NestStatus,
};
use lockstep_core::{Device, DeviceData, DeviceError, DeviceIdentifier};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

const TYPE_KEY: &str = "type";
const ENGINE_KEY: &str = "engine_name";

/// One entry of a JSON device list.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonDevice {
    pub name: String,
    pub body: Value,
}

/// Converter for payloads whose serde form is a flat JSON object.
pub struct SerdeConverter<P>(PhantomData<fn() -> P>);

impl<P> SerdeConverter<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for SerdeConverter<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> DeviceConverter<JsonDevice> for SerdeConverter<P>
where
    P: DevicePayload + Serialize + DeserializeOwned,
{
    fn to_wire(&self, device: &Device) -> Result<JsonDevice, DeviceError> {
        let payload = device
            .payload::<P>()
            .ok_or_else(|| DeviceError::TypeMismatch {
                device: device.name().to_string(),
                declared: P::TYPE_NAME.to_string(),
                actual: device.data().type_name().to_string(),
            })?;

        let mut body = match serde_json::to_value(payload) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(DeviceError::Malformed {
                    reason: format!("payload of '{}' is not an object: {other}", device.name()),
                });
            }
            Err(e) => {
                return Err(DeviceError::Malformed {
                    reason: e.to_string(),
                });
            }
        };
        body.insert(TYPE_KEY.to_string(), Value::from(device.id().device_type.clone()));
        body.insert(ENGINE_KEY.to_string(), Value::from(device.engine_name()));

        Ok(JsonDevice {
            name: device.name().to_string(),
            body: Value::Object(body),
        })
    }

    fn from_wire(
        &self,
        id: &DeviceIdentifier,
        wire: &JsonDevice,
    ) -> Result<DeviceData, DeviceError> {
        serde_json::from_value::<P>(wire.body.clone())
            .map(DevicePayload::into_data)
            .map_err(|e| DeviceError::Malformed {
                reason: format!("device '{}': {e}", id.name),
            })
    }
}

/// Conversion adapter of the JSON transport.
#[derive(Debug)]
pub struct JsonAdapter {
    registry: ConverterRegistry<JsonDevice>,
}

impl JsonAdapter {
    /// Adapter with converters for every built-in device type.
    pub fn new() -> Self {
        Self {
            registry: ConverterRegistry::new()
                .with(JointState::TYPE_NAME, SerdeConverter::<JointState>::new())
                .with(LinkState::TYPE_NAME, SerdeConverter::<LinkState>::new())
                .with(CameraFrame::TYPE_NAME, SerdeConverter::<CameraFrame>::new())
                .with(NestStatus::TYPE_NAME, SerdeConverter::<NestStatus>::new()),
        }
    }

    /// Adapter over a custom converter table.
    pub fn with_registry(registry: ConverterRegistry<JsonDevice>) -> Self {
        Self { registry }
    }

    /// Encodes devices as a name-keyed object.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - A payload type has no converter
    pub fn encode_list(&self, devices: &[Device]) -> Result<Map<String, Value>, DeviceError> {
        devices
            .iter()
            .map(|device| {
                let wire = self.serialize(device)?;
                Ok((wire.name, wire.body))
            })
            .collect()
    }

    /// Encodes identifiers only, as sent with a device request.
    pub fn encode_ids(&self, ids: &[DeviceIdentifier]) -> Map<String, Value> {
        ids.iter()
            .map(|id| {
                let mut body = Map::new();
                body.insert(TYPE_KEY.to_string(), Value::from(id.device_type.clone()));
                body.insert(ENGINE_KEY.to_string(), Value::from(id.engine_name.clone()));
                (id.name.clone(), Value::Object(body))
            })
            .collect()
    }

    /// Reads identifiers from a name-keyed object.
    ///
    /// # Errors
    ///
    /// - `DeviceError::Malformed` - An entry lacks its type or engine name
    pub fn decode_ids(
        &self,
        list: Map<String, Value>,
    ) -> Result<Vec<DeviceIdentifier>, DeviceError> {
        list.into_iter()
            .map(|(name, body)| self.extract_id(&JsonDevice { name, body }))
            .collect()
    }

    /// Decodes a name-keyed object. `null` entries come back as `None`.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - A declared type has no converter
    /// - `DeviceError::Malformed` - An entry could not be decoded
    pub fn decode_list(
        &self,
        list: Map<String, Value>,
    ) -> Result<Vec<Option<Device>>, DeviceError> {
        list.into_iter()
            .map(|(name, body)| match body {
                Value::Null => Ok(None),
                body => self.deserialize(&JsonDevice { name, body }).map(Some),
            })
            .collect()
    }
}

impl Default for JsonAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionAdapter for JsonAdapter {
    type Wire = JsonDevice;

    fn serialize(&self, device: &Device) -> Result<JsonDevice, DeviceError> {
        self.registry.serialize(device)
    }

    fn deserialize(&self, wire: &JsonDevice) -> Result<Device, DeviceError> {
        let id = self.extract_id(wire)?;
        self.registry.deserialize(id, wire)
    }

    fn extract_id(&self, wire: &JsonDevice) -> Result<DeviceIdentifier, DeviceError> {
        let field = |key: &str| {
            wire.body
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DeviceError::Malformed {
                    reason: format!("device '{}' has no string field '{key}'", wire.name),
                })
        };
        Ok(DeviceIdentifier {
            name: wire.name.clone(),
            engine_name: field(ENGINE_KEY)?,
            device_type: field(TYPE_KEY)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::sample_devices;

    #[test]
    fn test_sample_devices_survive_conversion() {
        let adapter = JsonAdapter::new();
        for device in sample_devices("engine_1") {
            let wire = adapter.serialize(&device).unwrap();
            assert_eq!(adapter.deserialize(&wire).unwrap(), device);
        }
    }

    #[test]
    fn test_identifier_triple_survives() {
        let adapter = JsonAdapter::new();
        let device = Device::new("voltmeter", "engine_1", NestStatus::default());

        let wire = adapter.serialize(&device).unwrap();
        let id = adapter.extract_id(&wire).unwrap();
        assert_eq!(id, DeviceIdentifier::new("voltmeter", "engine_1", "nest_device"));
    }

    #[test]
    fn test_wire_envelope_shape() {
        let adapter = JsonAdapter::new();
        let joint = Device::new("elbow", "physics", JointState {
            position: 1.0,
            velocity: 2.0,
            effort: 3.0,
        });

        let list = adapter.encode_list(&[joint]).unwrap();
        assert_eq!(
            Value::Object(list),
            json!({
                "elbow": {
                    "type": "physics_joint",
                    "engine_name": "physics",
                    "position": 1.0,
                    "velocity": 2.0,
                    "effort": 3.0
                }
            })
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let adapter = JsonAdapter::new();
        let wire = JsonDevice {
            name: "probe".to_string(),
            body: json!({ "type": "thermometer", "engine_name": "lab" }),
        };
        assert!(matches!(
            adapter.deserialize(&wire),
            Err(DeviceError::NoAdapter { ref device_type }) if device_type == "thermometer"
        ));
    }

    #[test]
    fn test_null_entries_are_absent() {
        let adapter = JsonAdapter::new();
        let list = json!({ "missing": null }).as_object().cloned().unwrap();
        assert_eq!(adapter.decode_list(list).unwrap(), vec![None]);
    }

    #[test]
    fn test_missing_engine_name_is_malformed() {
        let adapter = JsonAdapter::new();
        let list = json!({ "elbow": { "type": "physics_joint" } })
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(adapter.decode_ids(list), Err(DeviceError::Malformed { .. })));
    }
}
