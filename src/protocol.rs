//! Wire codec for the framed transport.
//!
//! One frame on the wire, strictly in this order:
//!
//! ```text
//! [u8: ext_len] [ext: ext_len bytes UTF-8] [i32 LE: meta_len] [meta: meta_len bytes]
//! ```
//!
//! The header is cheap and fully self-describing: a receiver can decide
//! whether to buffer, spool to disk, or relay a frame before committing any
//! memory to the body. [`read_head`] consumes exactly the header and leaves
//! the body on the stream for [`read_body`] / [`copy_body`].
//!
//! A frame is either fully present or absent: a short read anywhere inside a
//! frame is a [`ProtocolError`] and fatal for the connection that produced it.

use std::io::{Read, Write};

use thiserror::Error;

/// Maximum extension tag length in bytes (fits the `u8` length prefix).
pub const MAX_EXTENSION_LEN: usize = 255;

/// Maximum meta length: the wire field is a signed 32-bit integer.
pub const MAX_META_LEN: usize = i32::MAX as usize;

/// Errors producing a frame. Never observed on the wire.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The extension tag exceeds the 255-byte limit.
    #[error("frame extension is {0} bytes, limit is {MAX_EXTENSION_LEN}")]
    ExtensionTooLong(usize),

    /// The meta does not fit the signed 32-bit length field.
    #[error("frame meta is {0} bytes, exceeds i32::MAX")]
    MetaTooLarge(usize),
}

/// Errors consuming a frame. Fatal for the affected connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended inside a frame.
    #[error("stream ended mid-frame")]
    UnexpectedEof,

    /// The extension bytes are not valid UTF-8.
    #[error("frame extension is not valid UTF-8")]
    BadExtensionUtf8,

    /// The meta length field is negative.
    #[error("frame declares negative meta length {0}")]
    NegativeLength(i32),

    /// Underlying transport error.
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
}

fn map_io(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof
    } else {
        ProtocolError::Io(err)
    }
}

/// A single self-describing packet: a short routing tag plus opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Routing / semantic label, ≤ 255 bytes UTF-8.
    pub extension: String,
    /// Opaque payload.
    pub meta: Vec<u8>,
}

impl Frame {
    /// Build a frame from a tag and payload.
    pub fn new(extension: impl Into<String>, meta: Vec<u8>) -> Self {
        Self { extension: extension.into(), meta }
    }

    /// Encode the full frame (header + meta) into one buffer.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let head = encode_head(&self.extension, self.meta.len())?;
        let mut buf = Vec::with_capacity(head.len() + self.meta.len());
        buf.extend_from_slice(&head);
        buf.extend_from_slice(&self.meta);
        Ok(buf)
    }
}

/// Encode just the header for a frame whose body will be written separately.
pub fn encode_head(extension: &str, meta_len: usize) -> Result<Vec<u8>, EncodeError> {
    let ext = extension.as_bytes();
    if ext.len() > MAX_EXTENSION_LEN {
        return Err(EncodeError::ExtensionTooLong(ext.len()));
    }
    if meta_len > MAX_META_LEN {
        return Err(EncodeError::MetaTooLarge(meta_len));
    }
    let mut head = Vec::with_capacity(1 + ext.len() + 4);
    head.push(ext.len() as u8);
    head.extend_from_slice(ext);
    head.extend_from_slice(&(meta_len as i32).to_le_bytes());
    Ok(head)
}

/// A decoded frame header. The body is still on the stream.
#[derive(Debug, Clone)]
pub struct FrameHead {
    /// Extension tag.
    pub extension: String,
    /// Declared body length.
    pub meta_len: usize,
    /// The exact header bytes as read, so a relay can forward them verbatim.
    pub raw: Vec<u8>,
}

/// Read exactly one frame header, leaving the body for the caller.
pub fn read_head<R: Read + ?Sized>(reader: &mut R) -> Result<FrameHead, ProtocolError> {
    let mut ext_len = [0u8; 1];
    reader.read_exact(&mut ext_len).map_err(map_io)?;

    let mut ext = vec![0u8; ext_len[0] as usize];
    reader.read_exact(&mut ext).map_err(map_io)?;
    let extension =
        String::from_utf8(ext.clone()).map_err(|_| ProtocolError::BadExtensionUtf8)?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).map_err(map_io)?;
    let meta_len = i32::from_le_bytes(len_bytes);
    if meta_len < 0 {
        return Err(ProtocolError::NegativeLength(meta_len));
    }

    let mut raw = Vec::with_capacity(5 + ext.len());
    raw.push(ext_len[0]);
    raw.extend_from_slice(&ext);
    raw.extend_from_slice(&len_bytes);

    Ok(FrameHead { extension, meta_len: meta_len as usize, raw })
}

/// Read a frame body of exactly `meta_len` bytes.
pub fn read_body<R: Read + ?Sized>(
    reader: &mut R,
    meta_len: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let mut body = vec![0u8; meta_len];
    reader.read_exact(&mut body).map_err(map_io)?;
    Ok(body)
}

/// Stream a frame body into `sink` in at-most-`chunk` increments.
///
/// Never reads past `meta_len`, so the stream is left positioned at the next
/// frame boundary.
pub fn copy_body<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    meta_len: usize,
    sink: &mut W,
    chunk: usize,
) -> Result<(), ProtocolError> {
    let chunk = chunk.max(1);
    let mut buf = vec![0u8; chunk.min(meta_len.max(1))];
    let mut remaining = meta_len;
    while remaining > 0 {
        let take = remaining.min(chunk);
        reader.read_exact(&mut buf[..take]).map_err(map_io)?;
        sink.write_all(&buf[..take])?;
        remaining -= take;
    }
    Ok(())
}

/// Read one complete frame (header + body).
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let head = read_head(reader)?;
    let meta = read_body(reader, head.meta_len)?;
    Ok(Frame { extension: head.extension, meta })
}

/// Write one complete frame. Does not flush.
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), std::io::Error> {
    let encoded = frame
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let frame = Frame::new("greeting", b"hello world".to_vec());
        let bytes = frame.encode().unwrap();
        let decoded = read_frame(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_empty_meta() {
        let frame = Frame::new("ping", Vec::new());
        let bytes = frame.encode().unwrap();
        let decoded = read_frame(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded.extension, "ping");
        assert!(decoded.meta.is_empty());
    }

    #[test]
    fn round_trip_empty_extension() {
        let frame = Frame::new("", vec![1, 2, 3]);
        let bytes = frame.encode().unwrap();
        let decoded = read_frame(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_utf8_extension() {
        let frame = Frame::new("标签-tag", vec![0xFF, 0x00]);
        let bytes = frame.encode().unwrap();
        let decoded = read_frame(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn extension_limit_is_bytes_not_chars() {
        // 255 ASCII chars is fine; 256 is not.
        let ok = "x".repeat(255);
        assert!(Frame::new(ok, vec![]).encode().is_ok());
        let too_long = "x".repeat(256);
        assert!(matches!(
            Frame::new(too_long, vec![]).encode(),
            Err(EncodeError::ExtensionTooLong(256))
        ));
    }

    #[test]
    fn head_leaves_body_on_stream() {
        let frame = Frame::new("data", b"abcdef".to_vec());
        let bytes = frame.encode().unwrap();
        let mut cursor = Cursor::new(bytes);
        let head = read_head(&mut cursor).unwrap();
        assert_eq!(head.extension, "data");
        assert_eq!(head.meta_len, 6);
        let body = read_body(&mut cursor, head.meta_len).unwrap();
        assert_eq!(body, b"abcdef");
    }

    #[test]
    fn head_raw_bytes_forward_verbatim() {
        let frame = Frame::new("relay", b"payload".to_vec());
        let bytes = frame.encode().unwrap();
        let head = read_head(&mut Cursor::new(bytes.clone())).unwrap();
        assert_eq!(head.raw, bytes[..head.raw.len()]);
    }

    #[test]
    fn short_read_is_unexpected_eof() {
        let frame = Frame::new("cut", b"0123456789".to_vec());
        let mut bytes = frame.encode().unwrap();
        bytes.truncate(bytes.len() - 4);
        let err = read_frame(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[test]
    fn truncated_header_is_unexpected_eof() {
        // ext_len says 10 but only 3 ext bytes follow.
        let bytes = vec![10u8, b'a', b'b', b'c'];
        let err = read_head(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[test]
    fn negative_length_rejected() {
        let mut bytes = vec![1u8, b'x'];
        bytes.extend_from_slice(&(-5i32).to_le_bytes());
        let err = read_head(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ProtocolError::NegativeLength(-5)));
    }

    #[test]
    fn bad_extension_utf8_rejected() {
        let mut bytes = vec![2u8, 0xFF, 0xFE];
        bytes.extend_from_slice(&0i32.to_le_bytes());
        let err = read_head(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ProtocolError::BadExtensionUtf8));
    }

    #[test]
    fn copy_body_streams_in_chunks() {
        let frame = Frame::new("big", vec![7u8; 10_000]);
        let bytes = frame.encode().unwrap();
        let mut cursor = Cursor::new(bytes);
        let head = read_head(&mut cursor).unwrap();
        let mut sink = Vec::new();
        copy_body(&mut cursor, head.meta_len, &mut sink, 333).unwrap();
        assert_eq!(sink.len(), 10_000);
        assert!(sink.iter().all(|&b| b == 7));
    }

    #[test]
    fn copy_body_never_over_reads() {
        let first = Frame::new("a", vec![1u8; 100]);
        let second = Frame::new("b", vec![2u8; 5]);
        let mut bytes = first.encode().unwrap();
        bytes.extend_from_slice(&second.encode().unwrap());
        let mut cursor = Cursor::new(bytes);

        let head = read_head(&mut cursor).unwrap();
        let mut sink = Vec::new();
        copy_body(&mut cursor, head.meta_len, &mut sink, 7).unwrap();

        // The next frame must decode cleanly from the same stream.
        let next = read_frame(&mut cursor).unwrap();
        assert_eq!(next.extension, "b");
        assert_eq!(next.meta, vec![2u8; 5]);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let frames = [
            Frame::new("one", b"1".to_vec()),
            Frame::new("two", b"22".to_vec()),
            Frame::new("three", b"333".to_vec()),
        ];
        let mut bytes = Vec::new();
        for f in &frames {
            bytes.extend_from_slice(&f.encode().unwrap());
        }
        let mut cursor = Cursor::new(bytes);
        for f in &frames {
            assert_eq!(&read_frame(&mut cursor).unwrap(), f);
        }
    }
}
