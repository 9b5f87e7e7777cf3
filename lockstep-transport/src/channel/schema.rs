//! Fixed-layout packing of device fields.
//!
//! A schema is an ordered list of fields. Fixed fields always occupy the
//! same number of bytes; variable fields hold a run of equally sized
//! elements whose count travels separately in the size vector. Every schema
//! starts with the three identifier strings (name, type, engine), so the
//! identifier of a packed device can be read without knowing its type.

use bytes::{BufMut, Bytes, BytesMut};
use lockstep_core::{DeviceError, DeviceIdentifier};

/// Layout of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Always exactly `width` bytes
    Fixed { width: usize },
    /// Any number of `elem_width`-byte elements
    Variable { elem_width: usize },
}

/// Number of leading identifier fields in every schema.
pub const IDENTIFIER_FIELDS: usize = 3;

/// Ordered field layout of one device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<FieldKind>,
}

/// Packed device as it crosses the channel: the element counts of the
/// variable fields, then the concatenated field bytes.
///
/// An empty size vector stands for a device the engine does not know.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackedDevice {
    pub sizes: Vec<u32>,
    pub body: Bytes,
}

impl PackedDevice {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn is_absent(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Reassembles a device from its two channel messages.
    ///
    /// # Errors
    ///
    /// - `DeviceError::Malformed` - Size vector is malformed
    pub fn from_messages(sizes: &[u8], body: Bytes) -> Result<Self, DeviceError> {
        Ok(Self {
            sizes: Self::decode_sizes(sizes)?,
            body,
        })
    }

    /// Wire form of the size vector: count followed by little-endian sizes.
    pub fn encode_sizes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 4 * self.sizes.len());
        buf.put_u32_le(self.sizes.len() as u32);
        for size in &self.sizes {
            buf.put_u32_le(*size);
        }
        buf.freeze()
    }

    /// # Errors
    ///
    /// - `DeviceError::Malformed` - Length does not match the announced count
    pub fn decode_sizes(buf: &[u8]) -> Result<Vec<u32>, DeviceError> {
        let Some((count, rest)) = buf.split_first_chunk::<4>() else {
            return Err(malformed("size vector shorter than its count"));
        };
        let count = u32::from_le_bytes(*count) as usize;
        if rest.len() != count * 4 {
            return Err(malformed(format!(
                "size vector announces {count} entries but carries {} bytes",
                rest.len()
            )));
        }
        Ok(rest
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

fn malformed(reason: impl Into<String>) -> DeviceError {
    DeviceError::Malformed {
        reason: reason.into(),
    }
}

impl Schema {
    /// Schema holding only the identifier strings.
    pub fn identifier() -> Self {
        Self {
            fields: vec![FieldKind::Variable { elem_width: 1 }; IDENTIFIER_FIELDS],
        }
    }

    pub fn fixed(mut self, width: usize) -> Self {
        self.fields.push(FieldKind::Fixed { width });
        self
    }

    pub fn variable(mut self, elem_width: usize) -> Self {
        self.fields.push(FieldKind::Variable { elem_width });
        self
    }

    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    fn variable_count(&self) -> usize {
        self.fields
            .iter()
            .filter(|f| matches!(f, FieldKind::Variable { .. }))
            .count()
    }

    /// Lays out `values`, one per field, identifier fields first.
    ///
    /// # Errors
    ///
    /// - `DeviceError::Malformed` - Wrong field count, a fixed field of the
    ///   wrong width, or a variable field that is not a whole number of elements
    pub fn pack(&self, values: Vec<Bytes>) -> Result<PackedDevice, DeviceError> {
        if values.len() != self.fields.len() {
            return Err(malformed(format!(
                "schema has {} fields, got {}",
                self.fields.len(),
                values.len()
            )));
        }

        let mut sizes = Vec::with_capacity(self.variable_count());
        let mut body = BytesMut::with_capacity(values.iter().map(Bytes::len).sum());
        for (index, (kind, value)) in self.fields.iter().zip(values).enumerate() {
            match *kind {
                FieldKind::Fixed { width } if value.len() != width => {
                    return Err(malformed(format!(
                        "field {index} needs {width} bytes, got {}",
                        value.len()
                    )));
                }
                FieldKind::Fixed { .. } => {}
                FieldKind::Variable { elem_width } => {
                    if elem_width == 0 || value.len() % elem_width != 0 {
                        return Err(malformed(format!(
                            "field {index} is not a run of {elem_width}-byte elements"
                        )));
                    }
                    sizes.push((value.len() / elem_width) as u32);
                }
            }
            body.extend_from_slice(&value);
        }

        Ok(PackedDevice {
            sizes,
            body: body.freeze(),
        })
    }

    /// Splits a packed device back into one slice per field.
    ///
    /// # Errors
    ///
    /// - `DeviceError::Malformed` - Size vector or body length does not fit the schema
    pub fn unpack(&self, packed: &PackedDevice) -> Result<Vec<Bytes>, DeviceError> {
        if packed.sizes.len() != self.variable_count() {
            return Err(malformed(format!(
                "schema has {} variable fields, size vector has {}",
                self.variable_count(),
                packed.sizes.len()
            )));
        }

        let mut counts = packed.sizes.iter();
        let mut offset = 0usize;
        let mut values = Vec::with_capacity(self.fields.len());
        for kind in &self.fields {
            let len = match *kind {
                FieldKind::Fixed { width } => width,
                FieldKind::Variable { elem_width } => {
                    let count = counts.next().copied().unwrap_or_default() as usize;
                    count
                        .checked_mul(elem_width)
                        .ok_or_else(|| malformed("field size overflows"))?
                }
            };
            let end = offset
                .checked_add(len)
                .filter(|end| *end <= packed.body.len())
                .ok_or_else(|| {
                    malformed(format!(
                        "body of {} bytes is too short for the schema",
                        packed.body.len()
                    ))
                })?;
            values.push(packed.body.slice(offset..end));
            offset = end;
        }

        if offset != packed.body.len() {
            return Err(malformed(format!(
                "{} trailing bytes after the last field",
                packed.body.len() - offset
            )));
        }
        Ok(values)
    }
}

/// Field values for the identifier prefix.
pub fn identifier_fields(id: &DeviceIdentifier) -> Vec<Bytes> {
    vec![
        Bytes::copy_from_slice(id.name.as_bytes()),
        Bytes::copy_from_slice(id.device_type.as_bytes()),
        Bytes::copy_from_slice(id.engine_name.as_bytes()),
    ]
}

/// Reads the identifier prefix of any packed device.
///
/// # Errors
///
/// - `DeviceError::Malformed` - Device is absent or its prefix is not UTF-8
pub fn unpack_identifier(packed: &PackedDevice) -> Result<DeviceIdentifier, DeviceError> {
    if packed.sizes.len() < IDENTIFIER_FIELDS {
        return Err(malformed("packed device has no identifier"));
    }

    let mut offset = 0usize;
    let mut parts = Vec::with_capacity(IDENTIFIER_FIELDS);
    for size in &packed.sizes[..IDENTIFIER_FIELDS] {
        let end = offset + *size as usize;
        let bytes = packed
            .body
            .get(offset..end)
            .ok_or_else(|| malformed("identifier runs past the body"))?;
        let text = std::str::from_utf8(bytes)
            .map_err(|e| malformed(format!("identifier is not UTF-8: {e}")))?;
        parts.push(text.to_string());
        offset = end;
    }

    let [name, device_type, engine_name]: [String; IDENTIFIER_FIELDS] = parts
        .try_into()
        .map_err(|_| malformed("identifier is incomplete"))?;
    if name.is_empty() {
        return Err(malformed("packed device without name"));
    }
    Ok(DeviceIdentifier {
        name,
        engine_name,
        device_type,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn camera_schema() -> Schema {
        Schema::identifier().fixed(4).fixed(4).fixed(1).variable(1)
    }

    #[test]
    fn test_identifier_is_readable_without_type() {
        let id = DeviceIdentifier::new("eye", "physics", "camera");
        let mut values = identifier_fields(&id);
        values.extend([
            Bytes::from_static(&[2, 0, 0, 0]),
            Bytes::from_static(&[1, 0, 0, 0]),
            Bytes::from_static(&[3]),
            Bytes::from_static(&[9; 6]),
        ]);

        let packed = camera_schema().pack(values).unwrap();
        assert_eq!(packed.sizes, vec![3, 6, 7, 6]);
        assert_eq!(unpack_identifier(&packed).unwrap(), id);
    }

    #[test]
    fn test_fixed_field_width_is_enforced() {
        let schema = Schema::identifier().fixed(8);
        let mut values = identifier_fields(&DeviceIdentifier::new("j", "e", "physics_joint"));
        values.push(Bytes::from_static(&[0; 4]));

        assert!(matches!(schema.pack(values), Err(DeviceError::Malformed { .. })));
    }

    #[test]
    fn test_unpack_rejects_trailing_bytes() {
        let schema = Schema::identifier();
        let mut packed = schema
            .pack(identifier_fields(&DeviceIdentifier::new("v", "e", "nest_device")))
            .unwrap();
        let mut body = BytesMut::from(&packed.body[..]);
        body.put_u8(0);
        packed.body = body.freeze();

        assert!(schema.unpack(&packed).is_err());
    }

    #[test]
    fn test_absent_device_has_no_identifier() {
        assert!(PackedDevice::absent().is_absent());
        assert!(unpack_identifier(&PackedDevice::absent()).is_err());
    }

    #[test]
    fn test_size_vector_length_must_match_count() {
        let packed = PackedDevice {
            sizes: vec![1, 2, 3],
            body: Bytes::new(),
        };
        let encoded = packed.encode_sizes();
        assert_eq!(PackedDevice::decode_sizes(&encoded).unwrap(), vec![1, 2, 3]);
        assert!(PackedDevice::decode_sizes(&encoded[..encoded.len() - 1]).is_err());
        assert!(PackedDevice::decode_sizes(&[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_pack_then_unpack_preserves_fields(
            name in "[a-z]{1,12}",
            fixed in proptest::collection::vec(any::<u8>(), 8),
            floats in proptest::collection::vec(any::<u8>(), 0..8).prop_map(|v| {
                v.into_iter().flat_map(|b| [b; 4]).collect::<Vec<u8>>()
            }),
            text in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let schema = Schema::identifier().fixed(8).variable(4).variable(1);
            let mut values = identifier_fields(&DeviceIdentifier::new(name, "engine", "kind"));
            values.extend([Bytes::from(fixed), Bytes::from(floats), Bytes::from(text)]);

            let packed = schema.pack(values.clone()).unwrap();
            prop_assert_eq!(packed.sizes.len(), 5);
            prop_assert_eq!(schema.unpack(&packed).unwrap(), values);
        }
    }
}
