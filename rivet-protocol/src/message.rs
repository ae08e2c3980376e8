//! Message envelopes and the structs exchanged by the upgrade handshake.

use crate::types::MessageKind;
use crate::value::{Struct, Value};

/// Message envelope: method name, kind and sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub kind: MessageKind,
    pub seq_id: i32,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, kind: MessageKind, seq_id: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            seq_id,
        }
    }
}

/// Tracing header sent before every envelope on an upgraded connection.
///
/// Field layout follows the finagle tracing header; fields other than the
/// ones below are skipped when decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeader {
    pub trace_id: Option<i64>,
    pub span_id: Option<i64>,
    pub parent_span_id: Option<i64>,
    pub sampled: Option<bool>,
    pub flags: Option<i64>,
}

impl RequestHeader {
    const TRACE_ID: i16 = 1;
    const SPAN_ID: i16 = 2;
    const PARENT_SPAN_ID: i16 = 3;
    const SAMPLED: i16 = 5;
    const FLAGS: i16 = 7;

    pub fn new(trace_id: i64, span_id: i64) -> Self {
        Self {
            trace_id: Some(trace_id),
            span_id: Some(span_id),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_span_id: i64) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }

    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = Some(sampled);
        self
    }

    pub fn to_struct(&self) -> Struct {
        let mut s = Struct::new();
        if let Some(v) = self.trace_id {
            s.set(Self::TRACE_ID, v);
        }
        if let Some(v) = self.span_id {
            s.set(Self::SPAN_ID, v);
        }
        if let Some(v) = self.parent_span_id {
            s.set(Self::PARENT_SPAN_ID, v);
        }
        if let Some(v) = self.sampled {
            s.set(Self::SAMPLED, v);
        }
        if let Some(v) = self.flags {
            s.set(Self::FLAGS, v);
        }
        s
    }

    /// Reads the known fields of a decoded header struct. Mistyped fields are
    /// treated as absent.
    pub fn from_struct(value: &Struct) -> Self {
        Self {
            trace_id: value.get(Self::TRACE_ID).and_then(Value::as_i64),
            span_id: value.get(Self::SPAN_ID).and_then(Value::as_i64),
            parent_span_id: value.get(Self::PARENT_SPAN_ID).and_then(Value::as_i64),
            sampled: value.get(Self::SAMPLED).and_then(Value::as_bool),
            flags: value.get(Self::FLAGS).and_then(Value::as_i64),
        }
    }
}

/// Payload of the upgrade request. Carries no fields; any content is ignored.
pub fn connection_options() -> Struct {
    Struct::new()
}

/// Reply to the upgrade request.
pub fn upgrade_reply() -> Struct {
    Struct::new()
}
