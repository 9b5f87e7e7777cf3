//! Devices: the typed, identified messages exchanged with engines.
//!
//! A device is a payload keyed by a [`DeviceIdentifier`]. The orchestrator
//! only inspects the identifier; payload layout is the business of the
//! engine that owns the device and of the per-transport converters in
//! [`conversion`].

pub mod cache;
pub mod conversion;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::DeviceCache;
pub use conversion::{ConversionAdapter, ConverterRegistry, DeviceConverter};

/// Ordered set of identifiers, as requested from an engine.
pub type DeviceIdentifiers = BTreeSet<DeviceIdentifier>;

/// Immutable `(name, engine, type)` key of a device.
///
/// `(name, engine_name)` is unique simulation-wide. The derived ordering
/// compares `name` first, which is the order output caches are kept in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier {
    pub name: String,
    pub engine_name: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

impl DeviceIdentifier {
    pub fn new(
        name: impl Into<String>,
        engine_name: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            engine_name: engine_name.into(),
            device_type: device_type.into(),
        }
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.engine_name, self.device_type)
    }
}

/// Joint sensor/actuator state of a physics engine. Fixed-size fields only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    pub position: f64,
    pub velocity: f64,
    pub effort: f64,
}

/// Rigid link pose and twist. Fixed-size tuples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkState {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
    pub linear_velocity: [f64; 3],
    pub angular_velocity: [f64; 3],
}

/// Camera image. Mixes fixed-size header fields with variable-length pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub image: Vec<u8>,
}

/// Free-form status document of a neural simulator device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NestStatus {
    pub data: serde_json::Value,
}

/// Concrete payload of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceData {
    Joint(JointState),
    Link(LinkState),
    Camera(CameraFrame),
    Nest(NestStatus),
}

impl DeviceData {
    /// Type name of the concrete payload, used for converter dispatch.
    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceData::Joint(_) => JointState::TYPE_NAME,
            DeviceData::Link(_) => LinkState::TYPE_NAME,
            DeviceData::Camera(_) => CameraFrame::TYPE_NAME,
            DeviceData::Nest(_) => NestStatus::TYPE_NAME,
        }
    }
}

/// Links a payload struct to its [`DeviceData`] variant and type name.
pub trait DevicePayload: Sized {
    /// Type name stored in [`DeviceIdentifier::device_type`].
    const TYPE_NAME: &'static str;

    /// Wraps the payload into its variant.
    fn into_data(self) -> DeviceData;

    /// Borrows the payload back out of a matching variant.
    fn from_data(data: &DeviceData) -> Option<&Self>;
}

macro_rules! device_payload {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl DevicePayload for $ty {
            const TYPE_NAME: &'static str = $name;

            fn into_data(self) -> DeviceData {
                DeviceData::$variant(self)
            }

            fn from_data(data: &DeviceData) -> Option<&Self> {
                match data {
                    DeviceData::$variant(payload) => Some(payload),
                    _ => None,
                }
            }
        }
    };
}

device_payload!(JointState, Joint, "physics_joint");
device_payload!(LinkState, Link, "physics_link");
device_payload!(CameraFrame, Camera, "camera");
device_payload!(NestStatus, Nest, "nest_device");

/// A typed payload keyed by its identifier.
///
/// The identifier's `device_type` always names the payload variant;
/// [`Device::from_parts`] enforces this for externally built identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    id: DeviceIdentifier,
    data: DeviceData,
}

impl Device {
    /// Creates a device owned by `engine_name`, typed after its payload.
    pub fn new(
        name: impl Into<String>,
        engine_name: impl Into<String>,
        payload: impl DevicePayload,
    ) -> Self {
        let data = payload.into_data();
        let id = DeviceIdentifier::new(name, engine_name, data.type_name());
        Self { id, data }
    }

    /// Joins an identifier and a payload.
    ///
    /// # Errors
    ///
    /// - `DeviceError::TypeMismatch` - Identifier type differs from the payload type
    pub fn from_parts(id: DeviceIdentifier, data: DeviceData) -> Result<Self, DeviceError> {
        if id.device_type != data.type_name() {
            return Err(DeviceError::TypeMismatch {
                device: id.name,
                declared: id.device_type,
                actual: data.type_name().to_string(),
            });
        }
        Ok(Self { id, data })
    }

    pub fn id(&self) -> &DeviceIdentifier {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn engine_name(&self) -> &str {
        &self.id.engine_name
    }

    pub fn data(&self) -> &DeviceData {
        &self.data
    }

    /// Borrows the payload as `P` if the variant matches.
    pub fn payload<P: DevicePayload>(&self) -> Option<&P> {
        P::from_data(&self.data)
    }

    pub fn into_parts(self) -> (DeviceIdentifier, DeviceData) {
        (self.id, self.data)
    }
}

/// Errors raised while converting or validating devices.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No adapter for device type '{device_type}'")]
    NoAdapter { device_type: String },

    #[error("Device '{device}' declares type '{declared}' but carries '{actual}'")]
    TypeMismatch {
        device: String,
        declared: String,
        actual: String,
    },

    #[error("Malformed device message: {reason}")]
    Malformed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_orders_by_name_first() {
        let a = DeviceIdentifier::new("alpha", "zeta_engine", "camera");
        let b = DeviceIdentifier::new("beta", "alpha_engine", "camera");
        assert!(a < b);

        let ids: DeviceIdentifiers = [b.clone(), a.clone(), b.clone()].into_iter().collect();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_new_device_is_typed_after_payload() {
        let device = Device::new("joint", "gazebo", JointState::default());
        assert_eq!(device.id().device_type, "physics_joint");
        assert!(device.payload::<JointState>().is_some());
        assert!(device.payload::<CameraFrame>().is_none());
    }

    #[test]
    fn test_from_parts_rejects_type_mismatch() {
        let id = DeviceIdentifier::new("voltmeter", "engine_1", "camera");
        let data = DeviceData::Nest(NestStatus::default());

        let err = Device::from_parts(id, data).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::TypeMismatch { ref device, .. } if device == "voltmeter"
        ));
    }

    #[test]
    fn test_identifier_json_uses_type_key() {
        let id = DeviceIdentifier::new("voltmeter", "engine_1", "nest_device");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["type"], "nest_device");
        assert_eq!(json["engine_name"], "engine_1");
    }
}
