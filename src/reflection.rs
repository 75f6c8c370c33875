//! Component field reflection
//!
//! Components are runtime-typed byte blocks. The metadata here describes
//! their fields so the runtime can default-initialise, compare, diff and
//! persist them without compile-time knowledge of the type.

use serde::{Deserialize, Serialize};
use speedy::{Readable, Writable};

use crate::error::{EcsError, Result};

/// Primitive kind of a reflected field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Readable, Writable)]
pub enum TypeDescriptor {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl TypeDescriptor {
    /// Byte size of the field kind
    pub fn byte_size(self) -> usize {
        match self {
            TypeDescriptor::Bool | TypeDescriptor::I8 | TypeDescriptor::U8 => 1,
            TypeDescriptor::I16 | TypeDescriptor::U16 => 2,
            TypeDescriptor::I32 | TypeDescriptor::U32 | TypeDescriptor::F32 => 4,
            TypeDescriptor::I64 | TypeDescriptor::U64 | TypeDescriptor::F64 => 8,
        }
    }
}

/// One reflected field: name, byte offset inside the component, kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub offset: u32,
    pub descriptor: TypeDescriptor,
}

/// Tagged field value used by the diff and persistence paths
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Readable, Writable)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl FieldValue {
    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            FieldValue::Bool(_) => TypeDescriptor::Bool,
            FieldValue::I8(_) => TypeDescriptor::I8,
            FieldValue::I16(_) => TypeDescriptor::I16,
            FieldValue::I32(_) => TypeDescriptor::I32,
            FieldValue::I64(_) => TypeDescriptor::I64,
            FieldValue::U8(_) => TypeDescriptor::U8,
            FieldValue::U16(_) => TypeDescriptor::U16,
            FieldValue::U32(_) => TypeDescriptor::U32,
            FieldValue::U64(_) => TypeDescriptor::U64,
            FieldValue::F32(_) => TypeDescriptor::F32,
            FieldValue::F64(_) => TypeDescriptor::F64,
        }
    }
}

/// A field index that changed between two instances of the same type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectionTypeChange {
    pub field_index: u32,
}

/// Reflection metadata for one component type.
///
/// `default_data` is the bit pattern new instances start from; its length
/// always equals the component's byte size.
#[derive(Debug, Clone)]
pub struct ComponentReflection {
    pub byte_size: u32,
    pub alignment: u32,
    pub fields: Vec<FieldInfo>,
    pub default_data: Vec<u8>,
}

impl ComponentReflection {
    /// Metadata for an opaque component with no reflected fields. Instances
    /// default to zeroed bytes and diff as a single unit.
    pub fn opaque(byte_size: u32, alignment: u32) -> Self {
        Self {
            byte_size,
            alignment,
            fields: Vec::new(),
            default_data: vec![0; byte_size as usize],
        }
    }

    pub fn new(byte_size: u32, alignment: u32, fields: Vec<FieldInfo>, default_data: Vec<u8>) -> Self {
        debug_assert_eq!(default_data.len(), byte_size as usize);
        Self {
            byte_size,
            alignment,
            fields,
            default_data,
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// Read one field out of an instance's bytes.
    pub fn read_field(&self, data: &[u8], field_index: usize) -> Result<FieldValue> {
        let field = self
            .fields
            .get(field_index)
            .ok_or_else(|| EcsError::SerializationError(format!("field index {field_index} out of range")))?;
        let offset = field.offset as usize;
        let size = field.descriptor.byte_size();
        if offset + size > data.len() {
            return Err(EcsError::SerializationError(format!(
                "field '{}' extends past the component data",
                field.name
            )));
        }
        let bytes = &data[offset..offset + size];
        let value = match field.descriptor {
            TypeDescriptor::Bool => FieldValue::Bool(bytes[0] != 0),
            TypeDescriptor::I8 => FieldValue::I8(bytes[0] as i8),
            TypeDescriptor::I16 => FieldValue::I16(i16::from_ne_bytes(bytes.try_into().unwrap())),
            TypeDescriptor::I32 => FieldValue::I32(i32::from_ne_bytes(bytes.try_into().unwrap())),
            TypeDescriptor::I64 => FieldValue::I64(i64::from_ne_bytes(bytes.try_into().unwrap())),
            TypeDescriptor::U8 => FieldValue::U8(bytes[0]),
            TypeDescriptor::U16 => FieldValue::U16(u16::from_ne_bytes(bytes.try_into().unwrap())),
            TypeDescriptor::U32 => FieldValue::U32(u32::from_ne_bytes(bytes.try_into().unwrap())),
            TypeDescriptor::U64 => FieldValue::U64(u64::from_ne_bytes(bytes.try_into().unwrap())),
            TypeDescriptor::F32 => FieldValue::F32(f32::from_ne_bytes(bytes.try_into().unwrap())),
            TypeDescriptor::F64 => FieldValue::F64(f64::from_ne_bytes(bytes.try_into().unwrap())),
        };
        Ok(value)
    }

    /// Write one field into an instance's bytes. The value kind must match
    /// the field descriptor.
    pub fn write_field(&self, data: &mut [u8], field_index: usize, value: FieldValue) -> Result<()> {
        let field = self
            .fields
            .get(field_index)
            .ok_or_else(|| EcsError::DeserializationError(format!("field index {field_index} out of range")))?;
        if field.descriptor != value.descriptor() {
            return Err(EcsError::DeserializationError(format!(
                "field '{}' expects {:?}, got {:?}",
                field.name,
                field.descriptor,
                value.descriptor()
            )));
        }
        let offset = field.offset as usize;
        let target = &mut data[offset..offset + field.descriptor.byte_size()];
        match value {
            FieldValue::Bool(v) => target[0] = v as u8,
            FieldValue::I8(v) => target[0] = v as u8,
            FieldValue::I16(v) => target.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::I32(v) => target.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::I64(v) => target.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::U8(v) => target[0] = v,
            FieldValue::U16(v) => target.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::U32(v) => target.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::U64(v) => target.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::F32(v) => target.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::F64(v) => target.copy_from_slice(&v.to_ne_bytes()),
        }
        Ok(())
    }

    /// Compare two instances field by field, appending the indices that
    /// differ. Falls back to a whole-value byte compare when the type has no
    /// reflected fields.
    pub fn determine_changes(
        &self,
        previous: &[u8],
        current: &[u8],
        changes: &mut Vec<ReflectionTypeChange>,
    ) {
        if self.fields.is_empty() {
            if previous != current {
                changes.push(ReflectionTypeChange { field_index: 0 });
            }
            return;
        }
        for (index, field) in self.fields.iter().enumerate() {
            let offset = field.offset as usize;
            let size = field.descriptor.byte_size();
            if previous[offset..offset + size] != current[offset..offset + size] {
                changes.push(ReflectionTypeChange {
                    field_index: index as u32,
                });
            }
        }
    }

    /// Copy the listed fields from `source` into `destination`.
    pub fn apply_changes(
        &self,
        destination: &mut [u8],
        source: &[u8],
        changes: &[ReflectionTypeChange],
    ) {
        if self.fields.is_empty() {
            destination.copy_from_slice(source);
            return;
        }
        for change in changes {
            let field = &self.fields[change.field_index as usize];
            let offset = field.offset as usize;
            let size = field.descriptor.byte_size();
            destination[offset..offset + size].copy_from_slice(&source[offset..offset + size]);
        }
    }

    /// Encode an instance as named field values for persistence.
    pub fn encode_instance(&self, data: &[u8]) -> Result<Vec<FieldValue>> {
        (0..self.fields.len())
            .map(|index| self.read_field(data, index))
            .collect()
    }

    /// Decode persisted field values into an instance, starting from the
    /// default bit pattern so missing tail fields keep their defaults.
    pub fn decode_instance(&self, values: &[FieldValue]) -> Result<Vec<u8>> {
        let mut data = self.default_data.clone();
        for (index, value) in values.iter().enumerate() {
            if index >= self.fields.len() {
                break;
            }
            self.write_field(&mut data, index, *value)?;
        }
        Ok(data)
    }
}

/// Build reflection metadata for a plain-old-data Rust type.
///
/// Field offsets come from the caller; the default data is the byte image of
/// `default`. Intended for tests and statically known engine components.
pub fn reflect_pod<T: Copy>(fields: Vec<FieldInfo>, default: T) -> ComponentReflection {
    let byte_size = std::mem::size_of::<T>();
    let mut default_data = vec![0u8; byte_size];
    // Plain bit copy of the default instance
    unsafe {
        std::ptr::copy_nonoverlapping(
            &default as *const T as *const u8,
            default_data.as_mut_ptr(),
            byte_size,
        );
    }
    ComponentReflection::new(
        byte_size as u32,
        std::mem::align_of::<T>() as u32,
        fields,
        default_data,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reflection() -> ComponentReflection {
        ComponentReflection::new(
            12,
            4,
            vec![
                FieldInfo {
                    name: "x".to_string(),
                    offset: 0,
                    descriptor: TypeDescriptor::F32,
                },
                FieldInfo {
                    name: "y".to_string(),
                    offset: 4,
                    descriptor: TypeDescriptor::F32,
                },
                FieldInfo {
                    name: "flags".to_string(),
                    offset: 8,
                    descriptor: TypeDescriptor::U32,
                },
            ],
            vec![0; 12],
        )
    }

    #[test]
    fn test_read_write_round_trip() {
        let reflection = sample_reflection();
        let mut data = vec![0u8; 12];
        reflection
            .write_field(&mut data, 0, FieldValue::F32(1.5))
            .unwrap();
        reflection
            .write_field(&mut data, 2, FieldValue::U32(9))
            .unwrap();

        assert_eq!(reflection.read_field(&data, 0).unwrap(), FieldValue::F32(1.5));
        assert_eq!(reflection.read_field(&data, 2).unwrap(), FieldValue::U32(9));
    }

    #[test]
    fn test_write_kind_mismatch() {
        let reflection = sample_reflection();
        let mut data = vec![0u8; 12];
        let result = reflection.write_field(&mut data, 0, FieldValue::U32(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_determine_and_apply_changes() {
        let reflection = sample_reflection();
        let mut previous = vec![0u8; 12];
        let mut current = vec![0u8; 12];
        reflection
            .write_field(&mut current, 1, FieldValue::F32(3.0))
            .unwrap();

        let mut changes = Vec::new();
        reflection.determine_changes(&previous, &current, &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field_index, 1);

        reflection.apply_changes(&mut previous, &current, &changes);
        assert_eq!(previous, current);
    }

    #[test]
    fn test_decode_keeps_defaults_for_missing_fields() {
        let mut reflection = sample_reflection();
        reflection.default_data[8] = 42;

        let data = reflection.decode_instance(&[FieldValue::F32(2.0)]).unwrap();
        assert_eq!(reflection.read_field(&data, 0).unwrap(), FieldValue::F32(2.0));
        assert_eq!(reflection.read_field(&data, 2).unwrap(), FieldValue::U32(42));
    }
}
