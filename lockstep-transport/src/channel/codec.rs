//! Device conversion for the message channel.

use bytes::{BufMut, Bytes, BytesMut};
use lockstep_core::device::{
    CameraFrame, ConversionAdapter, ConverterRegistry, DeviceConverter, DevicePayload, JointState,
    LinkState, NestStatus,
};
use lockstep_core::{Device, DeviceData, DeviceError, DeviceIdentifier};

use super::schema::{
    IDENTIFIER_FIELDS, PackedDevice, Schema, identifier_fields, unpack_identifier,
};

fn mismatch(device: &Device, expected: &str) -> DeviceError {
    DeviceError::TypeMismatch {
        device: device.name().to_string(),
        declared: expected.to_string(),
        actual: device.data().type_name().to_string(),
    }
}

fn f64s(values: &[f64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * 8);
    for value in values {
        buf.put_f64_le(*value);
    }
    buf.freeze()
}

fn read_f64s<const N: usize>(field: &Bytes) -> [f64; N] {
    let mut out = [0.0; N];
    for (slot, chunk) in out.iter_mut().zip(field.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *slot = f64::from_le_bytes(raw);
    }
    out
}

/// Body fields after the identifier prefix.
fn payload_fields(schema: &Schema, wire: &PackedDevice) -> Result<Vec<Bytes>, DeviceError> {
    let mut fields = schema.unpack(wire)?;
    Ok(fields.split_off(IDENTIFIER_FIELDS))
}

fn pack(
    schema: &Schema,
    device: &Device,
    payload: Vec<Bytes>,
) -> Result<PackedDevice, DeviceError> {
    let mut values = identifier_fields(device.id());
    values.extend(payload);
    schema.pack(values)
}

struct JointConverter {
    schema: Schema,
}

impl JointConverter {
    fn new() -> Self {
        Self {
            schema: Schema::identifier().fixed(8).fixed(8).fixed(8),
        }
    }
}

impl DeviceConverter<PackedDevice> for JointConverter {
    fn to_wire(&self, device: &Device) -> Result<PackedDevice, DeviceError> {
        let joint = device
            .payload::<JointState>()
            .ok_or_else(|| mismatch(device, JointState::TYPE_NAME))?;
        pack(&self.schema, device, vec![
            f64s(&[joint.position]),
            f64s(&[joint.velocity]),
            f64s(&[joint.effort]),
        ])
    }

    fn from_wire(
        &self,
        _id: &DeviceIdentifier,
        wire: &PackedDevice,
    ) -> Result<DeviceData, DeviceError> {
        let fields = payload_fields(&self.schema, wire)?;
        let [position] = read_f64s::<1>(&fields[0]);
        let [velocity] = read_f64s::<1>(&fields[1]);
        let [effort] = read_f64s::<1>(&fields[2]);
        Ok(JointState {
            position,
            velocity,
            effort,
        }
        .into_data())
    }
}

struct LinkConverter {
    schema: Schema,
}

impl LinkConverter {
    fn new() -> Self {
        Self {
            schema: Schema::identifier().fixed(24).fixed(32).fixed(24).fixed(24),
        }
    }
}

impl DeviceConverter<PackedDevice> for LinkConverter {
    fn to_wire(&self, device: &Device) -> Result<PackedDevice, DeviceError> {
        let link = device
            .payload::<LinkState>()
            .ok_or_else(|| mismatch(device, LinkState::TYPE_NAME))?;
        pack(&self.schema, device, vec![
            f64s(&link.position),
            f64s(&link.orientation),
            f64s(&link.linear_velocity),
            f64s(&link.angular_velocity),
        ])
    }

    fn from_wire(
        &self,
        _id: &DeviceIdentifier,
        wire: &PackedDevice,
    ) -> Result<DeviceData, DeviceError> {
        let fields = payload_fields(&self.schema, wire)?;
        Ok(LinkState {
            position: read_f64s(&fields[0]),
            orientation: read_f64s(&fields[1]),
            linear_velocity: read_f64s(&fields[2]),
            angular_velocity: read_f64s(&fields[3]),
        }
        .into_data())
    }
}

/// Fixed header plus a variable run of pixel bytes.
struct CameraConverter {
    schema: Schema,
}

impl CameraConverter {
    fn new() -> Self {
        Self {
            schema: Schema::identifier().fixed(4).fixed(4).fixed(1).variable(1),
        }
    }
}

impl DeviceConverter<PackedDevice> for CameraConverter {
    fn to_wire(&self, device: &Device) -> Result<PackedDevice, DeviceError> {
        let frame = device
            .payload::<CameraFrame>()
            .ok_or_else(|| mismatch(device, CameraFrame::TYPE_NAME))?;
        pack(&self.schema, device, vec![
            Bytes::copy_from_slice(&frame.width.to_le_bytes()),
            Bytes::copy_from_slice(&frame.height.to_le_bytes()),
            Bytes::copy_from_slice(&[frame.depth]),
            Bytes::copy_from_slice(&frame.image),
        ])
    }

    fn from_wire(
        &self,
        _id: &DeviceIdentifier,
        wire: &PackedDevice,
    ) -> Result<DeviceData, DeviceError> {
        let fields = payload_fields(&self.schema, wire)?;
        let u32_field = |field: &Bytes| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(field);
            u32::from_le_bytes(raw)
        };
        Ok(CameraFrame {
            width: u32_field(&fields[0]),
            height: u32_field(&fields[1]),
            depth: fields[2][0],
            image: fields[3].to_vec(),
        }
        .into_data())
    }
}

/// Status document as variable-length JSON text.
struct NestConverter {
    schema: Schema,
}

impl NestConverter {
    fn new() -> Self {
        Self {
            schema: Schema::identifier().variable(1),
        }
    }
}

impl DeviceConverter<PackedDevice> for NestConverter {
    fn to_wire(&self, device: &Device) -> Result<PackedDevice, DeviceError> {
        let status = device
            .payload::<NestStatus>()
            .ok_or_else(|| mismatch(device, NestStatus::TYPE_NAME))?;
        pack(&self.schema, device, vec![Bytes::from(status.data.to_string())])
    }

    fn from_wire(
        &self,
        id: &DeviceIdentifier,
        wire: &PackedDevice,
    ) -> Result<DeviceData, DeviceError> {
        let fields = payload_fields(&self.schema, wire)?;
        let data = serde_json::from_slice(&fields[0]).map_err(|e| DeviceError::Malformed {
            reason: format!("device '{}': {e}", id.name),
        })?;
        Ok(NestStatus { data }.into_data())
    }
}

/// Conversion adapter of the message channel.
#[derive(Debug)]
pub struct ChannelAdapter {
    registry: ConverterRegistry<PackedDevice>,
}

impl ChannelAdapter {
    pub fn new() -> Self {
        Self {
            registry: ConverterRegistry::new()
                .with(JointState::TYPE_NAME, JointConverter::new())
                .with(LinkState::TYPE_NAME, LinkConverter::new())
                .with(CameraFrame::TYPE_NAME, CameraConverter::new())
                .with(NestStatus::TYPE_NAME, NestConverter::new()),
        }
    }

    pub fn with_registry(registry: ConverterRegistry<PackedDevice>) -> Self {
        Self { registry }
    }

    /// Packs only the identifier, as sent in device requests.
    ///
    /// # Errors
    ///
    /// - `DeviceError::Malformed` - Identifier could not be packed
    pub fn encode_identifier(&self, id: &DeviceIdentifier) -> Result<PackedDevice, DeviceError> {
        Schema::identifier().pack(identifier_fields(id))
    }

    /// Decodes a reply entry; an absent marker gives `None`.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - Declared type has no converter
    /// - `DeviceError::Malformed` - Body does not fit the type's schema
    pub fn decode_optional(&self, wire: &PackedDevice) -> Result<Option<Device>, DeviceError> {
        if wire.is_absent() {
            return Ok(None);
        }
        self.deserialize(wire).map(Some)
    }
}

impl Default for ChannelAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionAdapter for ChannelAdapter {
    type Wire = PackedDevice;

    fn serialize(&self, device: &Device) -> Result<PackedDevice, DeviceError> {
        self.registry.serialize(device)
    }

    fn deserialize(&self, wire: &PackedDevice) -> Result<Device, DeviceError> {
        self.registry.deserialize(self.extract_id(wire)?, wire)
    }

    fn extract_id(&self, wire: &PackedDevice) -> Result<DeviceIdentifier, DeviceError> {
        unpack_identifier(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_devices;

    #[test]
    fn test_sample_devices_survive_packing() {
        let adapter = ChannelAdapter::new();
        for device in sample_devices("engine_1") {
            let packed = adapter.serialize(&device).unwrap();
            assert_eq!(adapter.deserialize(&packed).unwrap(), device);
        }
    }

    #[test]
    fn test_camera_image_length_travels_in_sizes() {
        let adapter = ChannelAdapter::new();
        let camera = Device::new("eye", "engine_1", CameraFrame {
            width: 2,
            height: 1,
            depth: 3,
            image: vec![7; 6],
        });

        let packed = adapter.serialize(&camera).unwrap();
        assert_eq!(packed.sizes.last(), Some(&6));
        assert_eq!(packed.body.len(), 3 + 6 + 8 + 4 + 4 + 1 + 6);
    }

    #[test]
    fn test_identifier_request_is_not_a_device() {
        let adapter = ChannelAdapter::new();
        let id = DeviceIdentifier::new("elbow", "engine_1", "physics_joint");
        let request = adapter.encode_identifier(&id).unwrap();

        assert_eq!(adapter.extract_id(&request).unwrap(), id);
        assert!(matches!(
            adapter.deserialize(&request),
            Err(DeviceError::Malformed { .. })
        ));
    }

    #[test]
    fn test_absent_marker_decodes_to_none() {
        let adapter = ChannelAdapter::new();
        assert_eq!(adapter.decode_optional(&PackedDevice::absent()).unwrap(), None);
    }

    #[test]
    fn test_unknown_type_has_no_adapter() {
        let adapter = ChannelAdapter::new();
        let request = adapter
            .encode_identifier(&DeviceIdentifier::new("probe", "lab", "thermometer"))
            .unwrap();
        assert!(matches!(
            adapter.deserialize(&request),
            Err(DeviceError::NoAdapter { .. })
        ));
    }
}
