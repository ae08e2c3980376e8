//! # rivet-server
//!
//! TCP server for rivet services.
//!
//! This crate provides:
//! - Service registries mapping method names to descriptors and handlers
//! - A per-connection request processor with the tracing-header upgrade
//! - Server spans and observer hooks for request tracing
//! - A connection server with admission control and graceful shutdown
//! - YAML and environment based configuration

pub mod config;
pub mod context;
pub mod error;
pub mod processor;
pub mod server;
pub mod service;
pub mod trace;

pub use config::{Config, ConfigError, NetworkConfig, TelemetryConfig};
pub use context::RequestContext;
pub use error::ServerError;
pub use processor::RequestProcessor;
pub use server::{shutdown_signal, ConnectionServer, ServerConfig, ServerStats};
pub use service::{
    Arguments, ExceptionSpec, FieldSpec, Handler, HandlerError, HandlerResult, MethodDescriptor,
    Service, ServiceBuilder,
};
pub use trace::{
    LoggingObserver, ServerObserver, ServerSpan, SpanInfo, SpanObserver, Telemetry, TraceError,
    TraceInfo,
};
