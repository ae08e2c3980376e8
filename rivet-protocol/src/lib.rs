//! # rivet-protocol
//!
//! Wire protocol implementation for rivet (Thrift binary protocol compatible).
//!
//! This crate provides:
//! - Message envelopes (method name, message kind, sequence id)
//! - A dynamic, typed value model for struct payloads
//! - An encoder and an incremental decoder
//! - Application exceptions and the tracing header used after the upgrade handshake

pub mod codec;
pub mod error;
pub mod message;
pub mod types;
pub mod value;

pub use codec::{Decoder, Encoder, InboundMessage};
pub use error::{ApplicationException, ApplicationExceptionKind, ProtocolError};
pub use message::{MessageHeader, RequestHeader};
pub use types::{MessageKind, TType};
pub use value::{Struct, Value};

/// Version tag carried by strict binary envelopes.
pub const VERSION_1: u32 = 0x8001_0000;

/// Mask selecting the version bits of a strict envelope.
pub const VERSION_MASK: u32 = 0xffff_0000;

/// Reserved method name a client sends to upgrade the connection to
/// header-carrying mode.
pub const UPGRADE_METHOD: &str = "__can__finagle__trace__v3__";

/// Maximum size of a single string or binary value (16 MiB).
pub const MAX_STRING_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of elements in a single container.
pub const MAX_CONTAINER_SIZE: usize = 1024 * 1024;

/// Maximum nesting depth of structs and containers.
pub const MAX_DEPTH: usize = 64;

/// Field id of the success value in a REPLY result struct. Declared
/// exceptions use the other field ids.
pub const SUCCESS_FIELD: i16 = 0;

/// Maximum size of a whole message, header and envelope included (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
