//! Protocol error types and application exceptions.

use crate::types::{MessageKind, TType};
use crate::value::{Struct, Value};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur while encoding or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad protocol version: {0:#x}")]
    BadVersion(u32),

    #[error("invalid type tag: {0}")]
    InvalidType(u8),

    #[error("invalid message kind: {0}")]
    InvalidMessageKind(u8),

    #[error("unexpected message kind: {0}")]
    UnexpectedMessageKind(MessageKind),

    #[error("negative size: {0}")]
    NegativeSize(i32),

    #[error("size limit exceeded: {size} (max {max})")]
    SizeLimit { size: usize, max: usize },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("nesting depth limit exceeded: {0}")]
    DepthLimit(usize),

    #[error("incomplete message: need {needed} more bytes")]
    IncompleteFrame { needed: usize },

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: TType, actual: TType },

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

impl ProtocolError {
    /// Returns whether more input could still complete the message.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::IncompleteFrame { .. })
    }
}

/// Stable application exception types.
///
/// These values are part of the wire contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationExceptionKind {
    Unknown,
    UnknownMethod,
    InvalidMessageType,
    WrongMethodName,
    BadSequenceId,
    MissingResult,
    InternalError,
    ProtocolError,
}

impl ApplicationExceptionKind {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ApplicationExceptionKind::UnknownMethod,
            2 => ApplicationExceptionKind::InvalidMessageType,
            3 => ApplicationExceptionKind::WrongMethodName,
            4 => ApplicationExceptionKind::BadSequenceId,
            5 => ApplicationExceptionKind::MissingResult,
            6 => ApplicationExceptionKind::InternalError,
            7 => ApplicationExceptionKind::ProtocolError,
            _ => ApplicationExceptionKind::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ApplicationExceptionKind::Unknown => 0,
            ApplicationExceptionKind::UnknownMethod => 1,
            ApplicationExceptionKind::InvalidMessageType => 2,
            ApplicationExceptionKind::WrongMethodName => 3,
            ApplicationExceptionKind::BadSequenceId => 4,
            ApplicationExceptionKind::MissingResult => 5,
            ApplicationExceptionKind::InternalError => 6,
            ApplicationExceptionKind::ProtocolError => 7,
        }
    }
}

impl fmt::Display for ApplicationExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationExceptionKind::Unknown => write!(f, "UNKNOWN"),
            ApplicationExceptionKind::UnknownMethod => write!(f, "UNKNOWN_METHOD"),
            ApplicationExceptionKind::InvalidMessageType => write!(f, "INVALID_MESSAGE_TYPE"),
            ApplicationExceptionKind::WrongMethodName => write!(f, "WRONG_METHOD_NAME"),
            ApplicationExceptionKind::BadSequenceId => write!(f, "BAD_SEQUENCE_ID"),
            ApplicationExceptionKind::MissingResult => write!(f, "MISSING_RESULT"),
            ApplicationExceptionKind::InternalError => write!(f, "INTERNAL_ERROR"),
            ApplicationExceptionKind::ProtocolError => write!(f, "PROTOCOL_ERROR"),
        }
    }
}

/// Protocol-native exception carried by EXCEPTION envelopes.
///
/// Wire layout: `{1: message string, 2: type i32}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ApplicationException {
    pub kind: ApplicationExceptionKind,
    pub message: String,
}

impl ApplicationException {
    const MESSAGE_FIELD: i16 = 1;
    const TYPE_FIELD: i16 = 2;

    pub fn new(kind: ApplicationExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(
            ApplicationExceptionKind::UnknownMethod,
            format!("unknown method: {}", method),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApplicationExceptionKind::InternalError, message)
    }

    pub fn to_struct(&self) -> Struct {
        Struct::new()
            .with(Self::MESSAGE_FIELD, Value::String(self.message.clone()))
            .with(Self::TYPE_FIELD, Value::I32(self.kind.as_i32()))
    }

    /// Builds an exception from a decoded struct. Missing or mistyped fields
    /// fall back to an empty message and `UNKNOWN`.
    pub fn from_struct(value: &Struct) -> Self {
        let message = value
            .get(Self::MESSAGE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = value
            .get(Self::TYPE_FIELD)
            .and_then(Value::as_i32)
            .map(ApplicationExceptionKind::from_i32)
            .unwrap_or(ApplicationExceptionKind::Unknown);
        Self { kind, message }
    }
}
