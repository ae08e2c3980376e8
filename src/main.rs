//! rivet - Thrift binary RPC server
//!
//! Serves a built-in health and echo service until SIGINT or SIGTERM.

use rivet_protocol::{TType, Value};
use rivet_server::{
    shutdown_signal, Arguments, Config, ConnectionServer, HandlerResult, LoggingObserver,
    MethodDescriptor, RequestContext, Service, Telemetry,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

async fn is_healthy(_ctx: RequestContext, _args: Arguments) -> HandlerResult {
    Ok(Some(Value::Bool(true)))
}

async fn echo(ctx: RequestContext, args: Arguments) -> HandlerResult {
    let message = args.get("message").cloned();
    if let (Some(span), Some(message)) = (ctx.span(), message.as_ref().and_then(Value::as_str)) {
        span.set_tag("echo.length", message.len());
    }
    Ok(message)
}

fn builtin_service() -> Result<Service, rivet_server::ServerError> {
    Service::builder("rivet")
        .method(
            MethodDescriptor::new("is_healthy").returns(TType::Bool),
            is_healthy,
        )
        .method(
            MethodDescriptor::new("echo")
                .arg(1, "message", TType::String)
                .returns(TType::String),
            echo,
        )
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RIVET_CONFIG is set, then env overrides)
    let config = match std::env::var("RIVET_CONFIG") {
        Ok(path) => match Config::load() {
            Ok(c) => {
                tracing::info!("Loaded config from {}", path);
                c
            }
            Err(e) => {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
        },
        Err(_) => {
            tracing::info!("Using default configuration with environment overrides");
            Config::from_env()
        }
    };

    tracing::info!("Starting rivet server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    match config.network.max_concurrency {
        Some(limit) => tracing::info!("  Max concurrency: {}", limit),
        None => tracing::info!("  Max concurrency: unlimited"),
    }
    tracing::info!("  Stop timeout: {:?}", config.network.stop_timeout());

    let telemetry = if config.telemetry.log_spans {
        tracing::info!("  Span logging: enabled");
        Telemetry::new().with_observer(LoggingObserver)
    } else {
        Telemetry::new()
    };

    let server = Arc::new(ConnectionServer::new(
        config.server_config(),
        Arc::new(builtin_service()?),
        Arc::new(telemetry),
    ));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    Ok(())
}
