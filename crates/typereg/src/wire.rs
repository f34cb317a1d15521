//! Primitive read/write helpers shared by the value codec and the tree codec.
//!
//! All integers are big-endian. Strings are a u32 byte length followed by
//! UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::descriptor::TypeDescriptor;
use crate::errors::{Result, TypeError};

/// Descriptors nested deeper than this are rejected on decode.
const MAX_DESCRIPTOR_DEPTH: usize = 64;

pub fn ensure_remaining(buf: &Bytes, need: usize, what: &str) -> Result<()> {
    if buf.remaining() < need {
        return Err(TypeError::Decode(format!(
            "truncated input reading {what}: need {need} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    ensure_remaining(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut Bytes, what: &str) -> Result<u16> {
    ensure_remaining(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_u32())
}

pub fn get_i32(buf: &mut Bytes, what: &str) -> Result<i32> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut Bytes, what: &str) -> Result<i64> {
    ensure_remaining(buf, 8, what)?;
    Ok(buf.get_i64())
}

pub fn get_f64(buf: &mut Bytes, what: &str) -> Result<f64> {
    ensure_remaining(buf, 8, what)?;
    Ok(buf.get_f64())
}

pub fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn get_str(buf: &mut Bytes, what: &str) -> Result<String> {
    let len = get_u32(buf, what)? as usize;
    ensure_remaining(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| TypeError::Decode(format!("invalid utf-8 in {what}: {e}")))
}

/// Write a descriptor: name, version, argument count, then each argument.
pub fn put_descriptor(buf: &mut BytesMut, desc: &TypeDescriptor) {
    put_str(buf, &desc.name);
    buf.put_u32(desc.version);
    buf.put_u16(desc.args.len() as u16);
    for arg in &desc.args {
        put_descriptor(buf, arg);
    }
}

pub fn get_descriptor(buf: &mut Bytes) -> Result<TypeDescriptor> {
    get_descriptor_inner(buf, 0)
}

fn get_descriptor_inner(buf: &mut Bytes, depth: usize) -> Result<TypeDescriptor> {
    if depth > MAX_DESCRIPTOR_DEPTH {
        return Err(TypeError::Decode("type descriptor nested too deeply".to_string()));
    }
    let name = get_str(buf, "descriptor name")?;
    let version = get_u32(buf, "descriptor version")?;
    let count = get_u16(buf, "descriptor argument count")?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(get_descriptor_inner(buf, depth + 1)?);
    }
    Ok(TypeDescriptor::new(name, args, version))
}
