//! encoded_value, encoded_array and encoded_annotation items.

use crate::dex::error::DexError;
use crate::dex::model::{AnnotationElement, EncodedAnnotation, EncodedValue, FieldRef, MethodRef, Proto};
use crate::dex::{read_u1, read_uleb128, read_x, write_u1, write_uleb128, write_x};

const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_METHOD_TYPE: u8 = 0x15;
const VALUE_METHOD_HANDLE: u8 = 0x16;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_FIELD: u8 = 0x19;
const VALUE_METHOD: u8 = 0x1a;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_ANNOTATION: u8 = 0x1d;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

/// Turns indices of the unit being read into symbolic references.
pub(crate) trait IdResolver
{
    fn string(&self, idx: u32) -> Result<String, DexError>;
    fn type_desc(&self, idx: u32) -> Result<String, DexError>;
    fn proto(&self, idx: u32) -> Result<Proto, DexError>;
    fn field(&self, idx: u32) -> Result<FieldRef, DexError>;
    fn method(&self, idx: u32) -> Result<MethodRef, DexError>;
}

/// Turns symbolic references into indices of the unit being written.
pub(crate) trait IdIndexer
{
    fn string_idx(&self, value: &str) -> Result<u32, DexError>;
    fn type_idx(&self, descriptor: &str) -> Result<u32, DexError>;
    fn proto_idx(&self, proto: &Proto) -> Result<u32, DexError>;
    fn field_idx(&self, field: &FieldRef) -> Result<u32, DexError>;
    fn method_idx(&self, method: &MethodRef) -> Result<u32, DexError>;
}

fn read_le(bytes: &[u8], ix: &mut usize, size: usize) -> Result<u64, DexError>
{
    let raw = read_x(bytes, ix, size)?;
    let mut v = 0u64;
    for (i, b) in raw.iter().enumerate()
    {
        v |= (*b as u64) << (8 * i);
    }
    Ok(v)
}

fn sign_extend(v: u64, size: usize) -> i64
{
    let shift = 64 - 8 * size as u32;
    ((v << shift) as i64) >> shift
}

pub(crate) fn read_encoded_value(bytes: &[u8], ix: &mut usize, ids: &dyn IdResolver) -> Result<EncodedValue, DexError>
{
    let header = read_u1(bytes, ix)?;
    let value_arg = (header >> 5) as usize;
    let value_type = header & 0x1f;
    let size = value_arg + 1;

    let value = match value_type
    {
        VALUE_BYTE => EncodedValue::Byte(read_u1(bytes, ix)? as i8),
        VALUE_SHORT => EncodedValue::Short(sign_extend(read_le(bytes, ix, size)?, size) as i16),
        VALUE_CHAR => EncodedValue::Char(read_le(bytes, ix, size)? as u16),
        VALUE_INT => EncodedValue::Int(sign_extend(read_le(bytes, ix, size)?, size) as i32),
        VALUE_LONG => EncodedValue::Long(sign_extend(read_le(bytes, ix, size)?, size)),
        // Floating point values are zero-extended to the right.
        VALUE_FLOAT => EncodedValue::Float((read_le(bytes, ix, size)? << (8 * (4 - size.min(4)))) as u32),
        VALUE_DOUBLE => EncodedValue::Double(read_le(bytes, ix, size)? << (8 * (8 - size))),
        VALUE_METHOD_TYPE => EncodedValue::MethodType(ids.proto(read_le(bytes, ix, size)? as u32)?),
        VALUE_METHOD_HANDLE => fail!("method handle values are not supported"),
        VALUE_STRING => EncodedValue::String(ids.string(read_le(bytes, ix, size)? as u32)?),
        VALUE_TYPE => EncodedValue::Type(ids.type_desc(read_le(bytes, ix, size)? as u32)?),
        VALUE_FIELD => EncodedValue::Field(ids.field(read_le(bytes, ix, size)? as u32)?),
        VALUE_METHOD => EncodedValue::Method(ids.method(read_le(bytes, ix, size)? as u32)?),
        VALUE_ENUM => EncodedValue::Enum(ids.field(read_le(bytes, ix, size)? as u32)?),
        VALUE_ARRAY => EncodedValue::Array(read_encoded_array(bytes, ix, ids)?),
        VALUE_ANNOTATION => EncodedValue::Annotation(read_encoded_annotation(bytes, ix, ids)?),
        VALUE_NULL => EncodedValue::Null,
        VALUE_BOOLEAN => EncodedValue::Boolean(value_arg != 0),
        other => fail!("unknown encoded value type 0x{:02x}", other),
    };
    Ok(value)
}

pub(crate) fn read_encoded_array(bytes: &[u8], ix: &mut usize, ids: &dyn IdResolver) -> Result<Vec<EncodedValue>, DexError>
{
    let size = read_uleb128(bytes, ix)? as usize;
    let mut values = Vec::with_capacity(size.min(4096));
    for _ in 0..size
    {
        values.push(read_encoded_value(bytes, ix, ids)?);
    }
    Ok(values)
}

pub(crate) fn read_encoded_annotation(bytes: &[u8], ix: &mut usize, ids: &dyn IdResolver) -> Result<EncodedAnnotation, DexError>
{
    let ty = ids.type_desc(read_uleb128(bytes, ix)?)?;
    let size = read_uleb128(bytes, ix)? as usize;
    let mut elements = Vec::with_capacity(size.min(4096));
    for _ in 0..size
    {
        let name = ids.string(read_uleb128(bytes, ix)?)?;
        let value = read_encoded_value(bytes, ix, ids)?;
        elements.push(AnnotationElement { name, value });
    }
    Ok(EncodedAnnotation { ty, elements })
}

fn write_header(buffer: &mut Vec<u8>, value_type: u8, size: usize) -> usize
{
    write_u1(buffer, (((size - 1) as u8) << 5) | value_type)
}

fn write_signed(buffer: &mut Vec<u8>, value_type: u8, v: i64) -> usize
{
    let mut size = 8;
    while size > 1
    {
        let shift = 64 - 8 * (size - 1) as u32;
        if ((v << shift) >> shift) != v
        {
            break;
        }
        size -= 1;
    }
    let mut c = write_header(buffer, value_type, size);
    c += write_x(buffer, &v.to_le_bytes()[..size]);
    c
}

fn write_unsigned(buffer: &mut Vec<u8>, value_type: u8, v: u64) -> usize
{
    let mut size = 1;
    while size < 8 && (v >> (8 * size)) != 0
    {
        size += 1;
    }
    let mut c = write_header(buffer, value_type, size);
    c += write_x(buffer, &v.to_le_bytes()[..size]);
    c
}

/// Right zero-extended encoding used for float and double: trailing zero
/// bytes of the little-endian form are dropped.
fn write_right_extended(buffer: &mut Vec<u8>, value_type: u8, bits: u64, width: usize) -> usize
{
    let bytes = bits.to_le_bytes();
    let mut start = 0;
    while start < width - 1 && bytes[start] == 0
    {
        start += 1;
    }
    let size = width - start;
    let mut c = write_header(buffer, value_type, size);
    c += write_x(buffer, &bytes[start..width]);
    c
}

pub(crate) fn write_encoded_value(buffer: &mut Vec<u8>, value: &EncodedValue, ids: &dyn IdIndexer) -> Result<usize, DexError>
{
    let c = match value
    {
        EncodedValue::Byte(v) => write_header(buffer, VALUE_BYTE, 1) + write_u1(buffer, *v as u8),
        EncodedValue::Short(v) => write_signed(buffer, VALUE_SHORT, *v as i64),
        EncodedValue::Char(v) => write_unsigned(buffer, VALUE_CHAR, *v as u64),
        EncodedValue::Int(v) => write_signed(buffer, VALUE_INT, *v as i64),
        EncodedValue::Long(v) => write_signed(buffer, VALUE_LONG, *v),
        EncodedValue::Float(bits) => write_right_extended(buffer, VALUE_FLOAT, *bits as u64, 4),
        EncodedValue::Double(bits) => write_right_extended(buffer, VALUE_DOUBLE, *bits, 8),
        EncodedValue::MethodType(p) => write_unsigned(buffer, VALUE_METHOD_TYPE, ids.proto_idx(p)? as u64),
        EncodedValue::String(s) => write_unsigned(buffer, VALUE_STRING, ids.string_idx(s)? as u64),
        EncodedValue::Type(t) => write_unsigned(buffer, VALUE_TYPE, ids.type_idx(t)? as u64),
        EncodedValue::Field(f) => write_unsigned(buffer, VALUE_FIELD, ids.field_idx(f)? as u64),
        EncodedValue::Method(m) => write_unsigned(buffer, VALUE_METHOD, ids.method_idx(m)? as u64),
        EncodedValue::Enum(f) => write_unsigned(buffer, VALUE_ENUM, ids.field_idx(f)? as u64),
        EncodedValue::Array(items) => write_header(buffer, VALUE_ARRAY, 1) + write_encoded_array(buffer, items, ids)?,
        EncodedValue::Annotation(a) => write_header(buffer, VALUE_ANNOTATION, 1) + write_encoded_annotation(buffer, a, ids)?,
        EncodedValue::Null => write_header(buffer, VALUE_NULL, 1),
        EncodedValue::Boolean(b) => write_header(buffer, VALUE_BOOLEAN, if *b { 2 } else { 1 }),
    };
    Ok(c)
}

pub(crate) fn write_encoded_array(buffer: &mut Vec<u8>, values: &[EncodedValue], ids: &dyn IdIndexer) -> Result<usize, DexError>
{
    let mut c = write_uleb128(buffer, values.len() as u32);
    for v in values
    {
        c += write_encoded_value(buffer, v, ids)?;
    }
    Ok(c)
}

/// Elements are written sorted by name index, as the format requires.
pub(crate) fn write_encoded_annotation(buffer: &mut Vec<u8>, annotation: &EncodedAnnotation, ids: &dyn IdIndexer) -> Result<usize, DexError>
{
    let mut elements = Vec::with_capacity(annotation.elements.len());
    for e in &annotation.elements
    {
        elements.push((ids.string_idx(&e.name)?, &e.value));
    }
    elements.sort_by_key(|(idx, _)| *idx);

    let mut c = write_uleb128(buffer, ids.type_idx(&annotation.ty)?);
    c += write_uleb128(buffer, elements.len() as u32);
    for (name_idx, value) in elements
    {
        c += write_uleb128(buffer, name_idx);
        c += write_encoded_value(buffer, value, ids)?;
    }
    Ok(c)
}
