//! Type tags and message kinds.

use crate::error::ProtocolError;
use std::fmt;

/// Wire type tag of a field or container element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl TType {
    /// Parses a type tag byte.
    pub fn from_u8(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(TType::Stop),
            2 => Ok(TType::Bool),
            3 => Ok(TType::Byte),
            4 => Ok(TType::Double),
            6 => Ok(TType::I16),
            8 => Ok(TType::I32),
            10 => Ok(TType::I64),
            11 => Ok(TType::String),
            12 => Ok(TType::Struct),
            13 => Ok(TType::Map),
            14 => Ok(TType::Set),
            15 => Ok(TType::List),
            other => Err(ProtocolError::InvalidType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TType::Stop => "stop",
            TType::Bool => "bool",
            TType::Byte => "byte",
            TType::Double => "double",
            TType::I16 => "i16",
            TType::I32 => "i32",
            TType::I64 => "i64",
            TType::String => "string",
            TType::Struct => "struct",
            TType::Map => "map",
            TType::Set => "set",
            TType::List => "list",
        };
        f.write_str(name)
    }
}

/// Kind of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageKind {
    pub fn from_u8(kind: u8) -> Result<Self, ProtocolError> {
        match kind {
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Exception),
            4 => Ok(MessageKind::Oneway),
            other => Err(ProtocolError::InvalidMessageKind(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns whether a server may receive this kind.
    pub fn is_inbound(self) -> bool {
        matches!(self, MessageKind::Call | MessageKind::Oneway)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Call => write!(f, "CALL"),
            MessageKind::Reply => write!(f, "REPLY"),
            MessageKind::Exception => write!(f, "EXCEPTION"),
            MessageKind::Oneway => write!(f, "ONEWAY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttype_from_u8() {
        assert_eq!(TType::from_u8(11).unwrap(), TType::String);
        assert_eq!(TType::from_u8(15).unwrap(), TType::List);
        assert!(matches!(
            TType::from_u8(1),
            Err(ProtocolError::InvalidType(1))
        ));
        assert!(matches!(
            TType::from_u8(16),
            Err(ProtocolError::InvalidType(16))
        ));
    }

    #[test]
    fn test_message_kind_inbound() {
        assert!(MessageKind::Call.is_inbound());
        assert!(MessageKind::Oneway.is_inbound());
        assert!(!MessageKind::Reply.is_inbound());
        assert!(!MessageKind::Exception.is_inbound());
    }

    #[test]
    fn test_message_kind_display() {
        assert_eq!(MessageKind::Call.to_string(), "CALL");
        assert_eq!(MessageKind::Oneway.to_string(), "ONEWAY");
        assert!(matches!(
            MessageKind::from_u8(9),
            Err(ProtocolError::InvalidMessageKind(9))
        ));
    }
}
