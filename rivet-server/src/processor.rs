//! Per-connection request processor.
//!
//! Each call to [`RequestProcessor::process`] reads one message, dispatches
//! it and writes the reply (if any). Bytes read past the end of a message
//! stay buffered for the next call.

use crate::context::RequestContext;
use crate::error::ServerError;
use crate::server::ServerStats;
use crate::service::{HandlerError, Method, Service, SUCCESS_FIELD};
use crate::trace::{ServerSpan, Telemetry, TraceInfo};
use futures::FutureExt;
use rivet_protocol::message::upgrade_reply;
use rivet_protocol::{
    ApplicationException, Decoder, Encoder, InboundMessage, MessageKind, ProtocolError, Struct,
    Value, UPGRADE_METHOD,
};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

const READ_BUFFER_SIZE: usize = 8192;

/// Reported to span observers when a request is dropped mid-dispatch.
#[derive(Debug, Error)]
#[error("request cancelled")]
pub struct RequestCancelled;

/// Finishes a span if the dispatch future is dropped before completing.
struct FinishOnDrop(ServerSpan);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            self.0.finish(Some(&RequestCancelled));
        }
    }
}

/// Decodes, dispatches and answers messages on one connection.
pub struct RequestProcessor {
    service: Arc<Service>,
    telemetry: Arc<Telemetry>,
    decoder: Decoder,
    upgraded: bool,
    peer: String,
    stats: Option<Arc<ServerStats>>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl RequestProcessor {
    pub fn new(service: Arc<Service>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            service,
            telemetry,
            decoder: Decoder::new(),
            upgraded: false,
            peer: "local".to_string(),
            stats: None,
            shutdown: None,
        }
    }

    /// Sets the peer label used in log lines.
    pub fn with_peer(mut self, peer: impl fmt::Display) -> Self {
        self.peer = peer.to_string();
        self
    }

    pub(crate) fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Stops waiting for a new message once `shutdown` fires. A message that
    /// has started arriving is still read and answered.
    pub(crate) fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Returns whether the peer has completed the tracing upgrade.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Processes one message.
    ///
    /// Returns [`ServerError::TransportClosed`] when the peer closes the
    /// connection between messages. Protocol violations and I/O failures are
    /// returned as errors; handler failures are answered and are not.
    pub async fn process<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let message = self.read_message(reader).await?;
        let envelope = &message.envelope;
        if !envelope.kind.is_inbound() {
            return Err(ProtocolError::UnexpectedMessageKind(envelope.kind).into());
        }
        if let Some(stats) = &self.stats {
            stats.requests_total.fetch_add(1, Ordering::Relaxed);
        }

        let name = envelope.name.clone();
        let seq_id = envelope.seq_id;
        let oneway = envelope.kind == MessageKind::Oneway;
        tracing::debug!(
            "[{}] {} {} seq={}",
            self.peer,
            envelope.kind,
            name,
            seq_id
        );

        if name == UPGRADE_METHOD {
            self.upgraded = true;
            tracing::debug!("[{}] Connection upgraded to tracing headers", self.peer);
            if !oneway {
                let reply = Encoder::encode_reply(&name, seq_id, &upgrade_reply())?;
                write_flush(writer, &reply).await?;
            }
            return Ok(());
        }

        let service = self.service.clone();
        let method = match service.method(&name) {
            Some(method) => method,
            None => {
                tracing::warn!("[{}] Unknown method: {}", self.peer, name);
                self.count_error();
                if !oneway {
                    let exception = ApplicationException::unknown_method(&name);
                    let bytes = Encoder::encode_exception(&name, seq_id, &exception)?;
                    write_flush(writer, &bytes).await?;
                }
                return Ok(());
            }
        };
        let oneway = oneway || method.descriptor.is_oneway();

        let outcome = self.dispatch(method, message).await;
        if let Err(exception) = &outcome {
            self.count_error();
            if oneway {
                tracing::debug!(
                    "[{}] Dropping error from oneway method {}: {}",
                    self.peer,
                    name,
                    exception
                );
            }
        }
        if oneway {
            return Ok(());
        }

        let bytes = match outcome {
            Ok(result) => Encoder::encode_reply(&name, seq_id, &result)?,
            Err(exception) => Encoder::encode_exception(&name, seq_id, &exception)?,
        };
        write_flush(writer, &bytes).await?;
        Ok(())
    }

    async fn read_message<R>(&mut self, reader: &mut R) -> Result<InboundMessage, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(message) = self.decoder.decode_request(self.upgraded)? {
                return Ok(message);
            }

            let n = match self.shutdown.as_mut() {
                Some(shutdown) if self.decoder.buffered() == 0 => {
                    tokio::select! {
                        n = reader.read(&mut buf) => n?,
                        _ = shutdown.recv() => return Err(ServerError::ShuttingDown),
                    }
                }
                _ => reader.read(&mut buf).await?,
            };
            if n == 0 {
                if self.decoder.buffered() == 0 {
                    tracing::debug!("[{}] Connection closed by client", self.peer);
                    return Err(ServerError::TransportClosed);
                }
                tracing::debug!(
                    "[{}] Connection closed mid-message ({} bytes buffered)",
                    self.peer,
                    self.decoder.buffered()
                );
                return Err(ServerError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    /// Runs the handler inside a server span and maps its outcome to a
    /// result struct or an exception for the peer.
    async fn dispatch(
        &self,
        method: &Method,
        message: InboundMessage,
    ) -> Result<Struct, ApplicationException> {
        let descriptor = &method.descriptor;
        let mut context = RequestContext::new();

        let trace = match message.header.as_ref().map(TraceInfo::from_header) {
            Some(Ok(trace)) => trace,
            Some(Err(e)) => {
                tracing::debug!("[{}] Ignoring malformed trace header: {}", self.peer, e);
                TraceInfo::new_root()
            }
            None => TraceInfo::new_root(),
        };
        let span = self
            .telemetry
            .make_server_span(&mut context, descriptor.name(), trace);
        span.start();
        let _guard = FinishOnDrop(span.clone());

        let args = descriptor.extract_arguments(message.body);
        let handler = method.handler.call(context, args);
        let result = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Internal(panic_message(panic))),
        };

        let result = result.and_then(|value| self.success_struct(descriptor.success(), value));
        match result {
            Ok(result) => {
                span.finish(None);
                Ok(result)
            }
            Err(err) => {
                span.finish(Some(&err));
                if let HandlerError::Declared { kind, payload } = &err {
                    if let Some(exc) = descriptor.exception_for(kind) {
                        tracing::debug!(
                            "[{}] {} raised declared exception {}",
                            self.peer,
                            descriptor.name(),
                            exc.name
                        );
                        return Ok(Struct::new().with(exc.id, payload.clone()));
                    }
                }
                tracing::error!(
                    "[{}] Unexpected error in method {}: {}",
                    self.peer,
                    descriptor.name(),
                    err
                );
                Err(err.into_application_exception())
            }
        }
    }

    fn success_struct(
        &self,
        success: Option<rivet_protocol::TType>,
        value: Option<Value>,
    ) -> Result<Struct, HandlerError> {
        match (success, value) {
            (Some(expected), Some(value)) if value.ttype() != expected => {
                Err(HandlerError::Internal(format!(
                    "handler returned {}, expected {}",
                    value.ttype(),
                    expected
                )))
            }
            (Some(_), Some(value)) => Ok(Struct::new().with(SUCCESS_FIELD, value)),
            (None, Some(_)) => {
                tracing::debug!("[{}] Discarding value returned by void method", self.peer);
                Ok(Struct::new())
            }
            (_, None) => Ok(Struct::new()),
        }
    }

    fn count_error(&self) {
        if let Some(stats) = &self.stats {
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn write_flush<W>(writer: &mut W, bytes: &[u8]) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Arguments, HandlerResult, MethodDescriptor};
    use crate::trace::{ServerObserver, SpanInfo, SpanObserver};
    use parking_lot::Mutex;
    use rivet_protocol::{ApplicationExceptionKind, MessageHeader, RequestHeader, TType};
    use std::error::Error;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    async fn echo(_ctx: RequestContext, args: Arguments) -> HandlerResult {
        Ok(args.get("message").cloned())
    }

    async fn lookup(_ctx: RequestContext, args: Arguments) -> HandlerResult {
        let key = args.get("key").and_then(Value::as_str).unwrap_or_default();
        Err(HandlerError::declared(
            "NotFound",
            Struct::new().with(1, format!("no such key: {}", key)),
        ))
    }

    async fn fail(_ctx: RequestContext, _args: Arguments) -> HandlerResult {
        Err(HandlerError::declared("Unlisted", Struct::new()))
    }

    async fn explode(_ctx: RequestContext, _args: Arguments) -> HandlerResult {
        panic!("handler exploded")
    }

    async fn trace_id(ctx: RequestContext, _args: Arguments) -> HandlerResult {
        let trace = ctx.trace().map(|t| t.trace_id as i64).unwrap_or(-1);
        Ok(Some(Value::I64(trace)))
    }

    async fn notify(_ctx: RequestContext, _args: Arguments) -> HandlerResult {
        Err(HandlerError::internal("oneway failure"))
    }

    fn test_service() -> Arc<Service> {
        let service = Service::builder("test")
            .method(
                MethodDescriptor::new("echo")
                    .arg(1, "message", TType::String)
                    .returns(TType::String),
                echo,
            )
            .method(
                MethodDescriptor::new("lookup")
                    .arg(1, "key", TType::String)
                    .returns(TType::String)
                    .throws(1, "not_found", "NotFound"),
                lookup,
            )
            .method(MethodDescriptor::new("fail"), fail)
            .method(MethodDescriptor::new("panic"), explode)
            .method(
                MethodDescriptor::new("trace_id").returns(TType::I64),
                trace_id,
            )
            .method(MethodDescriptor::oneway("notify"), notify)
            .build()
            .unwrap();
        Arc::new(service)
    }

    struct Harness {
        processor: RequestProcessor,
        server_read: ReadHalf<DuplexStream>,
        server_write: WriteHalf<DuplexStream>,
        client: DuplexStream,
        decoder: Decoder,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_telemetry(Telemetry::new())
        }

        fn with_telemetry(telemetry: Telemetry) -> Self {
            let (client, server) = duplex(64 * 1024);
            let (server_read, server_write) = tokio::io::split(server);
            Self {
                processor: RequestProcessor::new(test_service(), Arc::new(telemetry)),
                server_read,
                server_write,
                client,
                decoder: Decoder::new(),
            }
        }

        async fn send(&mut self, header: Option<&RequestHeader>, kind: MessageKind, name: &str, args: Struct) {
            let bytes =
                Encoder::encode_call(header, &MessageHeader::new(name, kind, 1), &args).unwrap();
            self.client.write_all(&bytes).await.unwrap();
        }

        async fn process(&mut self) -> Result<(), ServerError> {
            self.processor
                .process(&mut self.server_read, &mut self.server_write)
                .await
        }

        async fn reply(&mut self) -> (MessageHeader, Struct) {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(message) = self.decoder.decode_message().unwrap() {
                    return message;
                }
                let n = self.client.read(&mut buf).await.unwrap();
                assert!(n > 0);
                self.decoder.extend(&buf[..n]);
            }
        }

        async fn call(&mut self, name: &str, args: Struct) -> (MessageHeader, Struct) {
            self.send(None, MessageKind::Call, name, args).await;
            self.process().await.unwrap();
            self.reply().await
        }
    }

    #[tokio::test]
    async fn test_echo_reply() {
        let mut h = Harness::new();
        let (header, result) = h.call("echo", Struct::new().with(1, "hi")).await;

        assert_eq!(header.kind, MessageKind::Reply);
        assert_eq!(header.name, "echo");
        assert_eq!(header.seq_id, 1);
        assert_eq!(result.get(0).and_then(Value::as_str), Some("hi"));
    }

    #[tokio::test]
    async fn test_declared_exception_is_a_reply() {
        let mut h = Harness::new();
        let (header, result) = h.call("lookup", Struct::new().with(1, "k")).await;

        assert_eq!(header.kind, MessageKind::Reply);
        assert!(!result.contains(0));
        let exc = result.get(1).and_then(Value::as_struct).unwrap();
        assert_eq!(exc.get(1).and_then(Value::as_str), Some("no such key: k"));

        // The connection stays usable.
        let (header, result) = h.call("echo", Struct::new().with(1, "again")).await;
        assert_eq!(header.kind, MessageKind::Reply);
        assert_eq!(result.get(0).and_then(Value::as_str), Some("again"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let mut h = Harness::new();
        let (header, body) = h.call("frobnicate", Struct::new().with(1, 5i32)).await;

        assert_eq!(header.kind, MessageKind::Exception);
        let exc = ApplicationException::from_struct(&body);
        assert_eq!(exc.kind, ApplicationExceptionKind::UnknownMethod);
        assert!(exc.message.contains("frobnicate"));

        let (header, _) = h.call("echo", Struct::new().with(1, "still here")).await;
        assert_eq!(header.kind, MessageKind::Reply);
    }

    #[tokio::test]
    async fn test_unmatched_error_is_internal_error() {
        let mut h = Harness::new();
        let (header, body) = h.call("fail", Struct::new()).await;

        assert_eq!(header.kind, MessageKind::Exception);
        let exc = ApplicationException::from_struct(&body);
        assert_eq!(exc.kind, ApplicationExceptionKind::InternalError);
        assert!(exc.message.contains("Unlisted"));

        let (header, _) = h.call("echo", Struct::new().with(1, "ok")).await;
        assert_eq!(header.kind, MessageKind::Reply);
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let mut h = Harness::new();
        let (header, body) = h.call("panic", Struct::new()).await;

        assert_eq!(header.kind, MessageKind::Exception);
        let exc = ApplicationException::from_struct(&body);
        assert_eq!(exc.kind, ApplicationExceptionKind::InternalError);
        assert_eq!(exc.message, "handler exploded");
    }

    #[tokio::test]
    async fn test_oneway_never_replies() {
        let mut h = Harness::new();

        h.send(None, MessageKind::Oneway, "notify", Struct::new()).await;
        h.process().await.unwrap();
        h.send(None, MessageKind::Oneway, "no_such_method", Struct::new()).await;
        h.process().await.unwrap();
        h.send(None, MessageKind::Oneway, "fail", Struct::new()).await;
        h.process().await.unwrap();

        // The next reply on the wire belongs to the CALL that follows.
        let (header, result) = h.call("echo", Struct::new().with(1, "after")).await;
        assert_eq!(header.kind, MessageKind::Reply);
        assert_eq!(result.get(0).and_then(Value::as_str), Some("after"));
    }

    #[tokio::test]
    async fn test_upgrade_then_header() {
        let mut h = Harness::new();
        let (header, body) = h.call(UPGRADE_METHOD, Struct::new()).await;
        assert_eq!(header.kind, MessageKind::Reply);
        assert!(body.is_empty());
        assert!(h.processor.is_upgraded());

        let request_header = RequestHeader::new(1234, 99);
        h.send(Some(&request_header), MessageKind::Call, "trace_id", Struct::new())
            .await;
        h.process().await.unwrap();
        let (_, result) = h.reply().await;
        assert_eq!(result.get(0), Some(&Value::I64(1234)));
    }

    #[tokio::test]
    async fn test_malformed_header_starts_new_trace() {
        let mut h = Harness::new();
        h.call(UPGRADE_METHOD, Struct::new()).await;

        // No span id: not a usable trace context.
        let request_header = RequestHeader {
            trace_id: Some(1234),
            ..Default::default()
        };
        h.send(Some(&request_header), MessageKind::Call, "trace_id", Struct::new())
            .await;
        h.process().await.unwrap();
        let (header, result) = h.reply().await;
        assert_eq!(header.kind, MessageKind::Reply);
        let trace_id = result.get(0).and_then(Value::as_i64).unwrap();
        assert_ne!(trace_id, 1234);
        assert!(trace_id >= 0);
    }

    #[tokio::test]
    async fn test_reply_kind_is_protocol_violation() {
        let mut h = Harness::new();
        h.send(None, MessageKind::Reply, "echo", Struct::new()).await;
        let err = h.process().await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::Protocol(ProtocolError::UnexpectedMessageKind(MessageKind::Reply))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_transport_closed() {
        let mut h = Harness::new();
        h.send(None, MessageKind::Call, "echo", Struct::new().with(1, "x")).await;
        h.process().await.unwrap();

        drop(h.client);
        let err = h
            .processor
            .process(&mut h.server_read, &mut h.server_write)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::TransportClosed));
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let (tx, rx) = broadcast::channel(1);
        let mut h = Harness::new();
        h.processor = RequestProcessor::new(test_service(), Arc::new(Telemetry::new()))
            .with_shutdown(rx);

        let (header, _) = h.call("echo", Struct::new().with(1, "before")).await;
        assert_eq!(header.kind, MessageKind::Reply);

        tx.send(()).unwrap();
        let err = h.process().await.unwrap_err();
        assert!(matches!(err, ServerError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_mistyped_argument_is_absent() {
        let mut h = Harness::new();
        let (_, result) = h.call("echo", Struct::new().with(1, 42i32)).await;
        assert!(result.is_empty());
    }

    struct SpanLog(Arc<Mutex<Vec<(String, Option<String>)>>>);

    impl SpanObserver for SpanLog {
        fn on_finish(&mut self, span: &SpanInfo, error: Option<&(dyn Error + 'static)>) {
            self.0
                .lock()
                .push((span.name.clone(), error.map(|e| e.to_string())));
        }
    }

    struct SpanLogObserver(Arc<Mutex<Vec<(String, Option<String>)>>>);

    impl ServerObserver for SpanLogObserver {
        fn on_server_span_created(&self, _context: &mut RequestContext, span: &ServerSpan) {
            span.register(Box::new(SpanLog(self.0.clone())));
        }
    }

    #[tokio::test]
    async fn test_spans_finish_on_every_path() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let telemetry = Telemetry::new().with_observer(SpanLogObserver(finished.clone()));
        let mut h = Harness::with_telemetry(telemetry);

        h.call("echo", Struct::new().with(1, "a")).await;
        h.call("lookup", Struct::new().with(1, "b")).await;
        h.call("panic", Struct::new()).await;
        h.call("missing", Struct::new()).await;

        let finished = finished.lock().clone();
        assert_eq!(
            finished,
            vec![
                ("echo".to_string(), None),
                (
                    "lookup".to_string(),
                    Some("unhandled exception: NotFound".to_string())
                ),
                ("panic".to_string(), Some("handler exploded".to_string())),
            ]
        );
    }
}
