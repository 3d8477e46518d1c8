//! Little endian helpers shared by the record codecs.
//!
//! Decoding works on a `&mut &[u8]` that is advanced past whatever was read.
//! Running off the end is never an io error here, it is a `Truncated` codec
//! error naming the field that could not be read.

use crate::trace::trace_error::CodecError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    LittleEndian::write_i32(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, CodecError> {
    buf.read_u8().map_err(|_| CodecError::Truncated { field })
}

pub fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, CodecError> {
    buf.read_u16::<LittleEndian>()
        .map_err(|_| CodecError::Truncated { field })
}

pub fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, CodecError> {
    buf.read_u32::<LittleEndian>()
        .map_err(|_| CodecError::Truncated { field })
}

pub fn get_i32(buf: &mut &[u8], field: &'static str) -> Result<i32, CodecError> {
    buf.read_i32::<LittleEndian>()
        .map_err(|_| CodecError::Truncated { field })
}

pub fn get_u64(buf: &mut &[u8], field: &'static str) -> Result<u64, CodecError> {
    buf.read_u64::<LittleEndian>()
        .map_err(|_| CodecError::Truncated { field })
}

/// Split off exactly `len` bytes.
pub fn get_bytes<'a>(
    buf: &mut &'a [u8],
    len: usize,
    field: &'static str,
) -> Result<&'a [u8], CodecError> {
    if buf.len() < len {
        return Err(CodecError::Truncated { field });
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_layout() {
        let mut out = Vec::new();
        put_u16(&mut out, 0x0102);
        put_u32(&mut out, 0x0304_0506);
        put_i32(&mut out, -1);
        assert_eq!(
            vec![0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0xff, 0xff, 0xff, 0xff],
            out
        );
    }

    #[test]
    fn reads_advance_the_cursor() {
        let data = [0x2a, 0x01, 0x00, 0x00, 0x00, 0xee];
        let mut buf = &data[..];
        assert_eq!(0x2a, get_u8(&mut buf, "a").unwrap());
        assert_eq!(1, get_u32(&mut buf, "b").unwrap());
        assert_eq!(1, buf.len());
    }

    #[test]
    fn short_read_names_the_field() {
        let data = [0u8; 3];
        let mut buf = &data[..];
        match get_u32(&mut buf, "eflags") {
            Err(CodecError::Truncated { field }) => assert_eq!("eflags", field),
            _ => panic!("expected truncation"),
        }
        assert!(get_bytes(&mut buf, 4, "rawbytes").is_err());
    }
}
