//! Encoder and incremental decoder for binary protocol messages.
//!
//! A message is an envelope (strict or non-strict) followed by a struct
//! payload. On an upgraded connection every inbound envelope is preceded by a
//! [`RequestHeader`] struct.

use crate::error::{ApplicationException, ProtocolError};
use crate::message::{MessageHeader, RequestHeader};
use crate::types::{MessageKind, TType};
use crate::value::{Struct, Value};
use crate::{
    MAX_CONTAINER_SIZE, MAX_DEPTH, MAX_MESSAGE_SIZE, MAX_STRING_SIZE, VERSION_1, VERSION_MASK,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Tracing header, present only on upgraded connections.
    pub header: Option<RequestHeader>,
    pub envelope: MessageHeader,
    pub body: Struct,
}

/// Encodes envelopes and struct payloads.
pub struct Encoder;

impl Encoder {
    /// Encodes a complete message: envelope followed by its payload.
    pub fn encode_message(header: &MessageHeader, body: &Struct) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64);
        Self::write_message_header(&mut buf, header)?;
        Self::write_struct(&mut buf, body)?;
        check_message_size(buf)
    }

    /// Encodes an outbound call, prefixed by a tracing header when the
    /// connection has been upgraded.
    pub fn encode_call(
        request_header: Option<&RequestHeader>,
        header: &MessageHeader,
        args: &Struct,
    ) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64);
        if let Some(request_header) = request_header {
            Self::write_struct(&mut buf, &request_header.to_struct())?;
        }
        Self::write_message_header(&mut buf, header)?;
        Self::write_struct(&mut buf, args)?;
        check_message_size(buf)
    }

    /// Encodes a REPLY carrying a result struct.
    pub fn encode_reply(name: &str, seq_id: i32, result: &Struct) -> Result<BytesMut, ProtocolError> {
        Self::encode_message(&MessageHeader::new(name, MessageKind::Reply, seq_id), result)
    }

    /// Encodes an EXCEPTION carrying an application exception.
    pub fn encode_exception(
        name: &str,
        seq_id: i32,
        exception: &ApplicationException,
    ) -> Result<BytesMut, ProtocolError> {
        Self::encode_message(
            &MessageHeader::new(name, MessageKind::Exception, seq_id),
            &exception.to_struct(),
        )
    }

    /// Writes a strict envelope.
    pub fn write_message_header(buf: &mut BytesMut, header: &MessageHeader) -> Result<(), ProtocolError> {
        buf.put_u32(VERSION_1 | header.kind.as_u8() as u32);
        write_bytes(buf, header.name.as_bytes())?;
        buf.put_i32(header.seq_id);
        Ok(())
    }

    /// Writes a struct: its fields in id order, then STOP.
    pub fn write_struct(buf: &mut BytesMut, value: &Struct) -> Result<(), ProtocolError> {
        write_struct_at(buf, value, 1)
    }
}

fn write_struct_at(buf: &mut BytesMut, value: &Struct, depth: usize) -> Result<(), ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::DepthLimit(depth));
    }
    for (id, field) in value.iter() {
        buf.put_u8(field.ttype().as_u8());
        buf.put_i16(id);
        write_value(buf, field, depth)?;
    }
    buf.put_u8(TType::Stop.as_u8());
    Ok(())
}

fn write_value(buf: &mut BytesMut, value: &Value, depth: usize) -> Result<(), ProtocolError> {
    match value {
        Value::Bool(v) => buf.put_u8(*v as u8),
        Value::Byte(v) => buf.put_i8(*v),
        Value::Double(v) => buf.put_f64(*v),
        Value::I16(v) => buf.put_i16(*v),
        Value::I32(v) => buf.put_i32(*v),
        Value::I64(v) => buf.put_i64(*v),
        Value::String(v) => write_bytes(buf, v.as_bytes())?,
        Value::Binary(v) => write_bytes(buf, v)?,
        Value::Struct(v) => write_struct_at(buf, v, depth + 1)?,
        Value::List { elem, items } | Value::Set { elem, items } => {
            check_container(depth, items.len())?;
            buf.put_u8(elem.as_u8());
            buf.put_i32(items.len() as i32);
            for item in items {
                check_elem(*elem, item)?;
                write_value(buf, item, depth + 1)?;
            }
        }
        Value::Map {
            key,
            value: val,
            entries,
        } => {
            check_container(depth, entries.len())?;
            buf.put_u8(key.as_u8());
            buf.put_u8(val.as_u8());
            buf.put_i32(entries.len() as i32);
            for (k, v) in entries {
                check_elem(*key, k)?;
                check_elem(*val, v)?;
                write_value(buf, k, depth + 1)?;
                write_value(buf, v, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn write_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_STRING_SIZE {
        return Err(ProtocolError::SizeLimit {
            size: data.len(),
            max: MAX_STRING_SIZE,
        });
    }
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
    Ok(())
}

fn check_container(depth: usize, len: usize) -> Result<(), ProtocolError> {
    if depth + 1 > MAX_DEPTH {
        return Err(ProtocolError::DepthLimit(depth + 1));
    }
    if len > MAX_CONTAINER_SIZE {
        return Err(ProtocolError::SizeLimit {
            size: len,
            max: MAX_CONTAINER_SIZE,
        });
    }
    Ok(())
}

fn check_message_size(buf: BytesMut) -> Result<BytesMut, ProtocolError> {
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: buf.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(buf)
}

fn check_elem(expected: TType, item: &Value) -> Result<(), ProtocolError> {
    let actual = item.ttype();
    if actual != expected {
        return Err(ProtocolError::TypeMismatch { expected, actual });
    }
    Ok(())
}

/// Decodes messages from bytes accumulated across reads.
///
/// Decoding is all-or-nothing: when the buffer holds only part of a message
/// nothing is consumed and `Ok(None)` is returned. The structure of a partial
/// message is scanned as bytes arrive and the scan resumes where it stopped,
/// so a message is parsed into values once, after its last byte is buffered.
pub struct Decoder {
    buffer: BytesMut,
    scan: Option<Scan>,
    max_message_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scan: None,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Sets the largest message accepted, in bytes.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next envelope and payload.
    pub fn decode_message(&mut self) -> Result<Option<(MessageHeader, Struct)>, ProtocolError> {
        let len = match self.scan_message(false)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut reader = Reader::new(&self.buffer[..len]);
        let message = reader.read_message()?;
        self.buffer.advance(len);
        Ok(Some(message))
    }

    /// Attempts to decode the next inbound request. When `upgraded` is set a
    /// tracing header struct is expected before the envelope.
    pub fn decode_request(&mut self, upgraded: bool) -> Result<Option<InboundMessage>, ProtocolError> {
        let len = match self.scan_message(upgraded)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut reader = Reader::new(&self.buffer[..len]);
        let message = reader.read_request(upgraded)?;
        self.buffer.advance(len);
        Ok(Some(message))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan = None;
    }

    /// Scans the front of the buffer, returning the length of the first
    /// message once all of it has arrived.
    fn scan_message(&mut self, upgraded: bool) -> Result<Option<usize>, ProtocolError> {
        if matches!(&self.scan, Some(scan) if scan.upgraded != upgraded) {
            self.scan = None;
        }
        let scan = self.scan.get_or_insert_with(|| Scan::new(upgraded));
        match scan.advance(&self.buffer) {
            Ok(Some(len)) => {
                self.scan = None;
                if len > self.max_message_size {
                    return Err(ProtocolError::MessageTooLarge {
                        size: len,
                        max: self.max_message_size,
                    });
                }
                Ok(Some(len))
            }
            Ok(None) => {
                if self.buffer.len() > self.max_message_size {
                    return Err(ProtocolError::MessageTooLarge {
                        size: self.buffer.len(),
                        max: self.max_message_size,
                    });
                }
                Ok(None)
            }
            Err(e) => {
                self.scan = None;
                Err(e)
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resumable structural scan of the message at the front of the buffer.
///
/// Each step consumes one whole token (a field header, a scalar, a string or
/// a container header) or nothing at all.
struct Scan {
    upgraded: bool,
    pos: usize,
    stage: Stage,
    stack: Vec<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Envelope,
    Body,
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    /// Inside a struct, expecting a field header or STOP.
    Fields { depth: usize },
    /// `remaining` values of type `elem`.
    Values {
        elem: TType,
        remaining: usize,
        depth: usize,
    },
    /// `remaining` map entries; `key_next` is set between entries.
    Entries {
        key: TType,
        value: TType,
        remaining: usize,
        key_next: bool,
        depth: usize,
    },
}

impl Scan {
    fn new(upgraded: bool) -> Self {
        if upgraded {
            Self {
                upgraded,
                pos: 0,
                stage: Stage::Header,
                stack: vec![Frame::Fields { depth: 1 }],
            }
        } else {
            Self {
                upgraded,
                pos: 0,
                stage: Stage::Envelope,
                stack: Vec::new(),
            }
        }
    }

    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        loop {
            let top = match self.stack.last().copied() {
                Some(frame) => frame,
                None => match self.stage {
                    Stage::Header => {
                        self.stage = Stage::Envelope;
                        continue;
                    }
                    Stage::Envelope => {
                        let mut reader = Reader::new(&buf[self.pos..]);
                        match reader.read_message_header() {
                            Ok(_) => {}
                            Err(e) if e.is_incomplete() => return Ok(None),
                            Err(e) => return Err(e),
                        }
                        self.pos += reader.pos;
                        self.stage = Stage::Body;
                        self.stack.push(Frame::Fields { depth: 1 });
                        continue;
                    }
                    Stage::Body => return Ok(Some(self.pos)),
                },
            };
            match Self::step(&buf[self.pos..], top) {
                Ok((consumed, next, child)) => {
                    self.pos += consumed;
                    self.stack.pop();
                    self.stack.extend(next);
                    self.stack.extend(child);
                }
                Err(e) if e.is_incomplete() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Consumes the next token under `top`. Returns the bytes consumed, the
    /// frame replacing `top` (none once it is finished) and a nested frame to
    /// enter.
    fn step(
        buf: &[u8],
        top: Frame,
    ) -> Result<(usize, Option<Frame>, Option<Frame>), ProtocolError> {
        let mut reader = Reader::new(buf);
        let (next, child) = match top {
            Frame::Fields { depth } => {
                let ttype = TType::from_u8(reader.read_u8()?)?;
                if ttype == TType::Stop {
                    (None, None)
                } else {
                    reader.read_i16()?;
                    let value = Frame::Values {
                        elem: ttype,
                        remaining: 1,
                        depth,
                    };
                    (Some(top), Some(value))
                }
            }
            Frame::Values { remaining: 0, .. } | Frame::Entries { remaining: 0, .. } => {
                (None, None)
            }
            Frame::Values {
                elem,
                remaining,
                depth,
            } => match fixed_width(elem) {
                Some(width) => {
                    let count = remaining.min(buf.len() / width);
                    if count == 0 {
                        return Err(ProtocolError::IncompleteFrame {
                            needed: width - buf.len(),
                        });
                    }
                    reader.take(count * width)?;
                    let next = Frame::Values {
                        elem,
                        remaining: remaining - count,
                        depth,
                    };
                    (Some(next), None)
                }
                None => {
                    let child = reader.scan_value(elem, depth)?;
                    let next = Frame::Values {
                        elem,
                        remaining: remaining - 1,
                        depth,
                    };
                    (Some(next), child)
                }
            },
            Frame::Entries {
                key,
                value,
                remaining,
                key_next,
                depth,
            } => {
                let child = reader.scan_value(if key_next { key } else { value }, depth)?;
                let next = Frame::Entries {
                    key,
                    value,
                    remaining: if key_next { remaining } else { remaining - 1 },
                    key_next: !key_next,
                    depth,
                };
                (Some(next), child)
            }
        };
        Ok((reader.pos, next, child))
    }
}

fn fixed_width(ttype: TType) -> Option<usize> {
    match ttype {
        TType::Bool | TType::Byte => Some(1),
        TType::I16 => Some(2),
        TType::I32 => Some(4),
        TType::I64 | TType::Double => Some(8),
        _ => None,
    }
}

/// Cursor over buffered bytes. Running out of input yields
/// [`ProtocolError::IncompleteFrame`].
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(ProtocolError::IncompleteFrame {
                needed: n - remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        let mut b = self.take(2)?;
        Ok(b.get_i16())
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let mut b = self.take(4)?;
        Ok(b.get_i32())
    }

    fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let mut b = self.take(8)?;
        Ok(b.get_i64())
    }

    fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        let mut b = self.take(8)?;
        Ok(b.get_f64())
    }

    fn read_size(&mut self, max: usize) -> Result<usize, ProtocolError> {
        let size = self.read_i32()?;
        if size < 0 {
            return Err(ProtocolError::NegativeSize(size));
        }
        let size = size as usize;
        if size > max {
            return Err(ProtocolError::SizeLimit { size, max });
        }
        Ok(size)
    }

    fn read_binary(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_size(MAX_STRING_SIZE)?;
        self.take(len)
    }

    fn read_name(&mut self, len: usize) -> Result<String, ProtocolError> {
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_message_header(&mut self) -> Result<MessageHeader, ProtocolError> {
        let first = self.read_i32()?;
        if first < 0 {
            let word = first as u32;
            let version = word & VERSION_MASK;
            if version != VERSION_1 {
                return Err(ProtocolError::BadVersion(version));
            }
            let kind = MessageKind::from_u8((word & 0xff) as u8)?;
            let len = self.read_size(MAX_STRING_SIZE)?;
            let name = self.read_name(len)?;
            let seq_id = self.read_i32()?;
            Ok(MessageHeader { name, kind, seq_id })
        } else {
            // Non-strict: name length first, then name, kind byte and seq id.
            let len = first as usize;
            if len > MAX_STRING_SIZE {
                return Err(ProtocolError::SizeLimit {
                    size: len,
                    max: MAX_STRING_SIZE,
                });
            }
            let name = self.read_name(len)?;
            let kind = MessageKind::from_u8(self.read_u8()?)?;
            let seq_id = self.read_i32()?;
            Ok(MessageHeader { name, kind, seq_id })
        }
    }

    fn read_message(&mut self) -> Result<(MessageHeader, Struct), ProtocolError> {
        let header = self.read_message_header()?;
        let body = self.read_struct(1)?;
        Ok((header, body))
    }

    fn read_request(&mut self, upgraded: bool) -> Result<InboundMessage, ProtocolError> {
        let header = if upgraded {
            Some(RequestHeader::from_struct(&self.read_struct(1)?))
        } else {
            None
        };
        let (envelope, body) = self.read_message()?;
        Ok(InboundMessage {
            header,
            envelope,
            body,
        })
    }

    fn read_struct(&mut self, depth: usize) -> Result<Struct, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::DepthLimit(depth));
        }
        let mut value = Struct::new();
        loop {
            let tag = self.read_u8()?;
            let ttype = TType::from_u8(tag)?;
            if ttype == TType::Stop {
                break;
            }
            let id = self.read_i16()?;
            let field = self.read_value(ttype, depth)?;
            value.set(id, field);
        }
        Ok(value)
    }

    fn read_value(&mut self, ttype: TType, depth: usize) -> Result<Value, ProtocolError> {
        let value = match ttype {
            TType::Stop => return Err(ProtocolError::InvalidType(TType::Stop.as_u8())),
            TType::Bool => Value::Bool(self.read_u8()? != 0),
            TType::Byte => Value::Byte(self.read_u8()? as i8),
            TType::Double => Value::Double(self.read_f64()?),
            TType::I16 => Value::I16(self.read_i16()?),
            TType::I32 => Value::I32(self.read_i32()?),
            TType::I64 => Value::I64(self.read_i64()?),
            TType::String => {
                let raw = self.read_binary()?;
                match std::str::from_utf8(raw) {
                    Ok(s) => Value::String(s.to_string()),
                    Err(_) => Value::Binary(Bytes::copy_from_slice(raw)),
                }
            }
            TType::Struct => Value::Struct(self.read_struct(depth + 1)?),
            TType::List | TType::Set => {
                self.check_depth(depth + 1)?;
                let elem = TType::from_u8(self.read_u8()?)?;
                let len = self.read_size(MAX_CONTAINER_SIZE)?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.read_value(elem, depth + 1)?);
                }
                if ttype == TType::List {
                    Value::List { elem, items }
                } else {
                    Value::Set { elem, items }
                }
            }
            TType::Map => {
                self.check_depth(depth + 1)?;
                let key = TType::from_u8(self.read_u8()?)?;
                let val = TType::from_u8(self.read_u8()?)?;
                let len = self.read_size(MAX_CONTAINER_SIZE)?;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let k = self.read_value(key, depth + 1)?;
                    let v = self.read_value(val, depth + 1)?;
                    entries.push((k, v));
                }
                Value::Map {
                    key,
                    value: val,
                    entries,
                }
            }
        };
        Ok(value)
    }

    /// Skips a value at `depth` without building it. Scalars and strings are
    /// consumed whole; for structs and containers only the header is
    /// consumed and the frame to scan their contents is returned.
    fn scan_value(&mut self, ttype: TType, depth: usize) -> Result<Option<Frame>, ProtocolError> {
        let frame = match ttype {
            TType::Stop => return Err(ProtocolError::InvalidType(TType::Stop.as_u8())),
            TType::String => {
                self.read_binary()?;
                None
            }
            TType::Struct => {
                self.check_depth(depth + 1)?;
                Some(Frame::Fields { depth: depth + 1 })
            }
            TType::List | TType::Set => {
                self.check_depth(depth + 1)?;
                let elem = TType::from_u8(self.read_u8()?)?;
                let remaining = self.read_size(MAX_CONTAINER_SIZE)?;
                Some(Frame::Values {
                    elem,
                    remaining,
                    depth: depth + 1,
                })
            }
            TType::Map => {
                self.check_depth(depth + 1)?;
                let key = TType::from_u8(self.read_u8()?)?;
                let value = TType::from_u8(self.read_u8()?)?;
                let remaining = self.read_size(MAX_CONTAINER_SIZE)?;
                Some(Frame::Entries {
                    key,
                    value,
                    remaining,
                    key_next: true,
                    depth: depth + 1,
                })
            }
            scalar => {
                self.take(fixed_width(scalar).unwrap_or(0))?;
                None
            }
        };
        Ok(frame)
    }

    fn check_depth(&self, depth: usize) -> Result<(), ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::DepthLimit(depth));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApplicationExceptionKind;

    fn echo_call(seq_id: i32) -> BytesMut {
        Encoder::encode_message(
            &MessageHeader::new("echo", MessageKind::Call, seq_id),
            &Struct::new().with(1, "hi"),
        )
        .unwrap()
    }

    #[test]
    fn test_strict_envelope_layout() {
        let buf = echo_call(7);
        assert_eq!(&buf[0..4], &[0x80, 0x01, 0x00, 0x01]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 4]);
        assert_eq!(&buf[8..12], b"echo");
        assert_eq!(&buf[12..16], &[0, 0, 0, 7]);
        // field header: string type, id 1
        assert_eq!(&buf[16..19], &[11, 0, 1]);
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn test_decode_message() {
        let mut decoder = Decoder::new();
        decoder.extend(&echo_call(3));

        let (header, body) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(header, MessageHeader::new("echo", MessageKind::Call, 3));
        assert_eq!(body.get(1).and_then(Value::as_str), Some("hi"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_partial_input() {
        let data = echo_call(1);
        let mut decoder = Decoder::new();

        for chunk in data.chunks(3) {
            assert!(decoder.buffered() < data.len());
            if let Some((header, _)) = decoder.decode_message().unwrap() {
                panic!("decoded {:?} before all bytes arrived", header);
            }
            decoder.extend(chunk);
        }

        let (header, _) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(header.name, "echo");
    }

    #[test]
    fn test_decode_multiple_messages() {
        let mut decoder = Decoder::new();
        decoder.extend(&echo_call(1));
        decoder.extend(&echo_call(2));

        let (first, _) = decoder.decode_message().unwrap().unwrap();
        let (second, _) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(first.seq_id, 1);
        assert_eq!(second.seq_id, 2);
        assert!(decoder.decode_message().unwrap().is_none());
    }

    #[test]
    fn test_decode_non_strict_envelope() {
        let mut buf = BytesMut::new();
        buf.put_i32(4);
        buf.put_slice(b"ping");
        buf.put_u8(MessageKind::Oneway.as_u8());
        buf.put_i32(9);
        buf.put_u8(0);

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        let (header, body) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(header, MessageHeader::new("ping", MessageKind::Oneway, 9));
        assert!(body.is_empty());
    }

    #[test]
    fn test_decode_bad_version() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x8002_0001);

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::BadVersion(0x8002_0000))
        ));
    }

    #[test]
    fn test_decode_string_limit() {
        let mut buf = BytesMut::new();
        buf.put_u32(VERSION_1 | 1);
        buf.put_i32((MAX_STRING_SIZE + 1) as i32);

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::SizeLimit { .. })
        ));
    }

    #[test]
    fn test_decode_negative_container_size() {
        let mut buf = BytesMut::new();
        Encoder::write_message_header(&mut buf, &MessageHeader::new("m", MessageKind::Call, 0))
            .unwrap();
        buf.put_u8(TType::List.as_u8());
        buf.put_i16(1);
        buf.put_u8(TType::I32.as_u8());
        buf.put_i32(-1);

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::NegativeSize(-1))
        ));
    }

    #[test]
    fn test_decode_large_message_in_chunks() {
        let numbers: Vec<Value> = (0..1_000_000).map(Value::I32).collect();
        let words: Vec<Value> = (0..10_000).map(|i| Value::from(format!("item-{}", i))).collect();
        let body = Struct::new()
            .with(1, Value::list(TType::I32, numbers))
            .with(2, Value::list(TType::String, words))
            .with(
                3,
                Value::Map {
                    key: TType::String,
                    value: TType::Struct,
                    entries: vec![("a".into(), Struct::new().with(1, 7i64).into())],
                },
            );
        let header = MessageHeader::new("bulk", MessageKind::Call, 9);
        let data = Encoder::encode_message(&header, &body).unwrap();
        assert!(data.len() > 4_000_000);

        let mut decoder = Decoder::new();
        let chunks: Vec<&[u8]> = data.chunks(8192).collect();
        let (last, rest) = chunks.split_last().unwrap();
        for (i, chunk) in rest.iter().enumerate() {
            decoder.extend(chunk);
            assert!(decoder.decode_message().unwrap().is_none());
            if i == rest.len() / 4 {
                // The scan has kept up with the buffer instead of restarting.
                let scanned = decoder.scan.as_ref().unwrap().pos;
                assert!(decoder.buffered() - scanned < 4);
            }
        }
        decoder.extend(last);

        let (decoded_header, decoded) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded, body);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_message_size_limit() {
        let body = Struct::new().with(1, "x".repeat(4096));
        let data =
            Encoder::encode_message(&MessageHeader::new("echo", MessageKind::Call, 1), &body)
                .unwrap();

        // Rejected as soon as the partial message outgrows the limit.
        let mut decoder = Decoder::new().with_max_message_size(1024);
        decoder.extend(&data[..512]);
        assert!(decoder.decode_message().unwrap().is_none());
        decoder.extend(&data[512..2048]);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::MessageTooLarge {
                size: 2048,
                max: 1024
            })
        ));

        // A complete message over the limit is rejected too.
        let mut decoder = Decoder::new().with_max_message_size(1024);
        decoder.extend(&data);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::MessageTooLarge { .. })
        ));

        let mut decoder = Decoder::new().with_max_message_size(1024);
        decoder.extend(&echo_call(1));
        assert!(decoder.decode_message().unwrap().is_some());
    }

    #[test]
    fn test_decode_depth_limit() {
        let mut nested = Struct::new();
        for _ in 0..MAX_DEPTH + 1 {
            nested = Struct::new().with(1, nested);
        }
        // Build the bytes by hand since the encoder refuses this payload.
        let mut buf = BytesMut::new();
        Encoder::write_message_header(&mut buf, &MessageHeader::new("m", MessageKind::Call, 0))
            .unwrap();
        for _ in 0..MAX_DEPTH + 1 {
            buf.put_u8(TType::Struct.as_u8());
            buf.put_i16(1);
        }
        for _ in 0..MAX_DEPTH + 2 {
            buf.put_u8(0);
        }

        assert!(matches!(
            Encoder::encode_message(&MessageHeader::new("m", MessageKind::Call, 0), &nested),
            Err(ProtocolError::DepthLimit(_))
        ));
        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::DepthLimit(_))
        ));
    }

    #[test]
    fn test_non_utf8_string_decodes_as_binary() {
        let body = Struct::new().with(1, Value::Binary(Bytes::from_static(b"\xff\xfe")));
        let buf =
            Encoder::encode_message(&MessageHeader::new("m", MessageKind::Call, 0), &body).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        let (_, decoded) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.get(1).and_then(Value::as_bytes), Some(&b"\xff\xfe"[..]));
    }

    #[test]
    fn test_containers_decode() {
        let body = Struct::new()
            .with(1, Value::list(TType::I64, vec![Value::I64(1), Value::I64(2)]))
            .with(
                2,
                Value::Map {
                    key: TType::String,
                    value: TType::Bool,
                    entries: vec![(Value::from("on"), Value::Bool(true))],
                },
            )
            .with(3, 2.5f64);
        let buf =
            Encoder::encode_message(&MessageHeader::new("m", MessageKind::Call, 0), &body).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        let (_, decoded) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_encode_rejects_mistyped_list_item() {
        let body = Struct::new().with(1, Value::list(TType::I32, vec![Value::from("x")]));
        assert!(matches!(
            Encoder::encode_message(&MessageHeader::new("m", MessageKind::Call, 0), &body),
            Err(ProtocolError::TypeMismatch {
                expected: TType::I32,
                actual: TType::String
            })
        ));
    }

    #[test]
    fn test_decode_request_with_header() {
        let request_header = RequestHeader::new(100, 200).with_parent(50);
        let buf = Encoder::encode_call(
            Some(&request_header),
            &MessageHeader::new("echo", MessageKind::Call, 1),
            &Struct::new().with(1, "hi"),
        )
        .unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        let message = decoder.decode_request(true).unwrap().unwrap();
        assert_eq!(message.header, Some(request_header));
        assert_eq!(message.envelope.name, "echo");
        assert_eq!(message.body.get(1).and_then(Value::as_str), Some("hi"));
    }

    #[test]
    fn test_decode_request_without_header() {
        let mut decoder = Decoder::new();
        decoder.extend(&echo_call(5));
        let message = decoder.decode_request(false).unwrap().unwrap();
        assert!(message.header.is_none());
        assert_eq!(message.envelope.seq_id, 5);
    }

    #[test]
    fn test_decode_request_header_partial() {
        let buf = Encoder::encode_call(
            Some(&RequestHeader::new(1, 2)),
            &MessageHeader::new("echo", MessageKind::Call, 1),
            &Struct::new(),
        )
        .unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&buf[..buf.len() - 1]);
        assert!(decoder.decode_request(true).unwrap().is_none());
        assert_eq!(decoder.buffered(), buf.len() - 1);
        decoder.extend(&buf[buf.len() - 1..]);
        assert!(decoder.decode_request(true).unwrap().is_some());
    }

    #[test]
    fn test_exception_encoding() {
        let exc = ApplicationException::unknown_method("nope");
        let buf = Encoder::encode_exception("nope", 4, &exc).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        let (header, body) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(header.kind, MessageKind::Exception);
        assert_eq!(header.seq_id, 4);
        let decoded = ApplicationException::from_struct(&body);
        assert_eq!(decoded.kind, ApplicationExceptionKind::UnknownMethod);
    }

    #[test]
    fn test_unknown_fields_are_kept_for_skipping() {
        let body = Struct::new()
            .with(1, "known")
            .with(99, Struct::new().with(1, 5i32));
        let buf =
            Encoder::encode_message(&MessageHeader::new("m", MessageKind::Call, 0), &body).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        decoder.extend(&echo_call(8));
        let (_, decoded) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded.len(), 2);
        let (next, _) = decoder.decode_message().unwrap().unwrap();
        assert_eq!(next.seq_id, 8);
    }
}
