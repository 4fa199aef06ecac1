use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn put_u64_varint(buf: &mut BytesMut, value: u64) {
    buf.put_u64_varint(value);
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let bytes = try_get_bytes(buf)?;
    let s = String::from_utf8(bytes.to_vec())?;
    Ok(s)
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()
        .map_err(|e| anyhow!("invalid length prefix: {:?}", e))?;
    if buf.remaining() < len {
        return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", len, buf.remaining()));
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn try_get_u64_varint(buf: &mut impl Buf) -> anyhow::Result<u64> {
    buf.try_get_u64_varint()
        .map_err(|e| anyhow!("invalid varint: {:?}", e))
}

pub fn try_get_u64(buf: &mut impl Buf) -> anyhow::Result<u64> {
    if buf.remaining() < std::mem::size_of::<u64>() {
        return Err(anyhow!("buffer underflow"));
    }
    Ok(buf.get_u64())
}
