//! Per-transport conversion between devices and wire messages.
//!
//! Every transport owns a [`ConverterRegistry`] mapping device type names to
//! converters for its wire representation. Serialization dispatches on the
//! concrete payload type; deserialization dispatches on the type declared
//! by the wire message. A type with no registered converter is rejected
//! with [`DeviceError::NoAdapter`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Device, DeviceData, DeviceError, DeviceIdentifier};

/// Converts one concrete device type to and from the wire type `W`.
pub trait DeviceConverter<W>: Send + Sync {
    /// Encodes the device, identifier included.
    ///
    /// # Errors
    ///
    /// - `DeviceError::TypeMismatch` - Device payload is not the type this converter handles
    fn to_wire(&self, device: &Device) -> Result<W, DeviceError>;

    /// Decodes the payload of a wire message whose identifier was already read.
    ///
    /// # Errors
    ///
    /// - `DeviceError::Malformed` - Payload fields are missing or invalid
    fn from_wire(&self, id: &DeviceIdentifier, wire: &W) -> Result<DeviceData, DeviceError>;
}

/// Device conversion contract implemented once per transport.
pub trait ConversionAdapter: Send + Sync {
    /// Wire representation of a single device.
    type Wire;

    /// Encodes a device.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - No converter registered for the payload type
    fn serialize(&self, device: &Device) -> Result<Self::Wire, DeviceError>;

    /// Decodes a device, selecting the converter by the declared type.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - Declared type has no converter
    /// - `DeviceError::Malformed` - Message could not be decoded
    fn deserialize(&self, wire: &Self::Wire) -> Result<Device, DeviceError>;

    /// Reads only the identifier of a wire message.
    ///
    /// # Errors
    ///
    /// - `DeviceError::Malformed` - Identifier fields are missing
    fn extract_id(&self, wire: &Self::Wire) -> Result<DeviceIdentifier, DeviceError>;
}

/// Type-name keyed table of converters for wire type `W`.
pub struct ConverterRegistry<W> {
    converters: HashMap<String, Arc<dyn DeviceConverter<W>>>,
}

impl<W> ConverterRegistry<W> {
    pub fn new() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Registers a converter, returning the one it replaces.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        converter: Arc<dyn DeviceConverter<W>>,
    ) -> Option<Arc<dyn DeviceConverter<W>>> {
        self.converters.insert(type_name.into(), converter)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(
        mut self,
        type_name: impl Into<String>,
        converter: impl DeviceConverter<W> + 'static,
    ) -> Self {
        self.register(type_name, Arc::new(converter));
        self
    }

    pub fn supports(&self, type_name: &str) -> bool {
        self.converters.contains_key(type_name)
    }

    /// Looks up the converter for a type name.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - Nothing registered under `type_name`
    pub fn converter(&self, type_name: &str) -> Result<&dyn DeviceConverter<W>, DeviceError> {
        self.converters
            .get(type_name)
            .map(|c| c.as_ref())
            .ok_or_else(|| DeviceError::NoAdapter {
                device_type: type_name.to_string(),
            })
    }

    /// Encodes a device with the converter of its payload type.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - Payload type not registered
    pub fn serialize(&self, device: &Device) -> Result<W, DeviceError> {
        self.converter(device.data().type_name())?.to_wire(device)
    }

    /// Decodes a wire message with the converter of its declared type.
    ///
    /// # Errors
    ///
    /// - `DeviceError::NoAdapter` - Declared type not registered
    /// - `DeviceError::Malformed` - Payload could not be decoded
    /// - `DeviceError::TypeMismatch` - Converter produced a different payload type
    pub fn deserialize(&self, id: DeviceIdentifier, wire: &W) -> Result<Device, DeviceError> {
        let data = self.converter(&id.device_type)?.from_wire(&id, wire)?;
        Device::from_parts(id, data)
    }
}

impl<W> Default for ConverterRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> fmt::Debug for ConverterRegistry<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.converters.keys().collect();
        types.sort();
        f.debug_struct("ConverterRegistry")
            .field("types", &types)
            .finish()
    }
}
