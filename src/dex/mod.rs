//! Reading, rewriting and writing dex units.
//!
//! Classes are decoded into the index-free model in [`model`], so they can be
//! moved between units freely; [`writer`] assigns fresh indices when a set of
//! classes is written back out.

#[macro_use]
pub mod error;

pub mod clinit;
pub mod model;
pub(crate) mod opcodes;
pub mod reader;
pub mod refs;
pub(crate) mod values;
pub mod writer;

pub use crate::dex::error::DexError;
pub use crate::dex::model::{AccessFlags, ClassDef, Code, EncodedValue, Field, FieldRef, Method, MethodRef, Proto};
pub use crate::dex::reader::{ClassEntry, DexUnit};
pub use crate::dex::refs::{RefCounts, RefSet};
pub use crate::dex::writer::write_dex;

/// Largest number of entries any 16-bit indexed id table may hold.
pub const MAX_TABLE_ENTRIES: u32 = 65536;

// Basic type reading and writing
pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError>
{
    if bytes.len() < *ix + 1
    {
        fail!("Unexpected end of stream reading u1 at index {}", *ix);
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError>
{
    if bytes.len() < *ix + 2
    {
        fail!("Unexpected end of stream reading u2 at index {}", *ix);
    }
    let result = u16::from_le_bytes([bytes[*ix], bytes[*ix + 1]]);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if bytes.len() < *ix + 4
    {
        fail!("Unexpected end of stream reading u4 at index {}", *ix);
    }
    let result = u32::from_le_bytes([bytes[*ix], bytes[*ix + 1], bytes[*ix + 2], bytes[*ix + 3]]);
    *ix += 4;
    Ok(result)
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    let mut value: u32 = 0;
    for i in 0..5
    {
        let byte = read_u1(bytes, ix)?;
        value |= ((byte & 0x7f) as u32).wrapping_shl(7 * i);
        if byte & 0x80 == 0
        {
            return Ok(value);
        }
    }
    fail!("uleb128 value longer than 5 bytes ending at index {}", *ix)
}

pub(crate) fn read_uleb128p1(bytes: &[u8], ix: &mut usize) -> Result<Option<u32>, DexError>
{
    let raw = read_uleb128(bytes, ix)?;
    Ok(raw.checked_sub(1))
}

pub(crate) fn read_sleb128(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError>
{
    let mut value: i32 = 0;
    let mut shift = 0;
    for _ in 0..5
    {
        let byte = read_u1(bytes, ix)?;
        value |= ((byte & 0x7f) as i32).wrapping_shl(shift);
        shift += 7;
        if byte & 0x80 == 0
        {
            if shift < 32 && (byte & 0x40) != 0
            {
                value |= -1i32 << shift;
            }
            return Ok(value);
        }
    }
    fail!("sleb128 value longer than 5 bytes ending at index {}", *ix)
}

pub(crate) fn read_x<'a>(bytes: &'a [u8], ix: &mut usize, length: usize) -> Result<&'a [u8], DexError>
{
    if bytes.len() < *ix || bytes.len() - *ix < length
    {
        fail!("buffer too short for {} byte read at index {}", length, *ix);
    }
    let slice = &bytes[*ix..*ix + length];
    *ix += length;
    Ok(slice)
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize
{
    buffer.push(val);
    1
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    4
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize
{
    let mut remaining = val;
    let mut c = 0;
    loop
    {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining != 0
        {
            byte |= 0x80;
        }
        buffer.push(byte);
        c += 1;
        if remaining == 0
        {
            return c;
        }
    }
}

pub(crate) fn write_uleb128p1(buffer: &mut Vec<u8>, val: Option<u32>) -> usize
{
    match val
    {
        Some(v) => write_uleb128(buffer, v + 1),
        None => write_uleb128(buffer, 0),
    }
}

pub(crate) fn write_sleb128(buffer: &mut Vec<u8>, val: i32) -> usize
{
    let mut remaining = val;
    let mut c = 0;
    loop
    {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        let done = (remaining == 0 && byte & 0x40 == 0) || (remaining == -1 && byte & 0x40 != 0);
        if !done
        {
            byte |= 0x80;
        }
        buffer.push(byte);
        c += 1;
        if done
        {
            return c;
        }
    }
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize
{
    buffer.extend_from_slice(val);
    val.len()
}

/// Pad `buffer` with zero bytes up to the next multiple of `alignment`.
pub(crate) fn align(buffer: &mut Vec<u8>, alignment: usize)
{
    while buffer.len() % alignment != 0
    {
        buffer.push(0);
    }
}
