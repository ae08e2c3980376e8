//! Connection management.

use crate::endpoint::Endpoint;
use crate::error::{ClientError, TransportError};
use crate::stream::ClientStream;
use futures::future::BoxFuture;
use rivet_protocol::message::connection_options;
use rivet_protocol::{
    ApplicationException, ApplicationExceptionKind, Decoder, Encoder, MessageHeader, MessageKind,
    ProtocolError, RequestHeader, Struct, Value, SUCCESS_FIELD, UPGRADE_METHOD,
};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opens transports to an endpoint.
///
/// The pool applies its own timeout around each attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<ClientStream>>;
}

/// Connects over TCP or Unix domain sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl Connector for SocketConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<ClientStream>> {
        Box::pin(async move {
            match endpoint {
                Endpoint::Inet { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", endpoint, e);
                    }
                    Ok(ClientStream::from(stream))
                }
                #[cfg(unix)]
                Endpoint::Unix(path) => {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    Ok(ClientStream::from(stream))
                }
                #[cfg(not(unix))]
                Endpoint::Unix(_) => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                )),
            }
        })
    }
}

/// A single RPC transport.
///
/// Calls are strictly sequential; each one writes a request and reads its
/// reply before returning. Any I/O failure, EOF or timeout marks the
/// connection closed.
pub struct Connection {
    id: u64,
    peer: String,
    reader: Option<ReadHalf<ClientStream>>,
    writer: Option<WriteHalf<ClientStream>>,
    decoder: Decoder,
    timeout: Duration,
    next_seq_id: i32,
    upgraded: bool,
    trace_header: Option<RequestHeader>,
}

impl Connection {
    /// Wraps an established transport. `timeout` bounds each call.
    pub fn new(stream: impl Into<ClientStream>, peer: impl Into<String>, timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(stream.into());
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            reader: Some(reader),
            writer: Some(writer),
            decoder: Decoder::new(),
            timeout,
            next_seq_id: 0,
            upgraded: false,
            trace_header: None,
        }
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some() && self.writer.is_some()
    }

    /// Returns whether the tracing upgrade handshake has completed.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Sets the tracing header sent before each call once upgraded.
    pub fn set_trace_header(&mut self, header: Option<RequestHeader>) {
        self.trace_header = header;
    }

    /// Calls `method` and returns the result struct of its REPLY.
    pub async fn call(&mut self, method: &str, args: &Struct) -> Result<Struct, ClientError> {
        let seq_id = self.next_seq_id();
        let timeout = self.timeout;
        let result = match tokio::time::timeout(timeout, self.exchange(method, seq_id, args)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("[conn {}] call {} timed out", self.id, method);
                Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "call timed out",
                )))
            }
        };
        self.close_on_failure(&result);
        result
    }

    /// Sends a ONEWAY message. No reply is read.
    pub async fn call_oneway(&mut self, method: &str, args: &Struct) -> Result<(), ClientError> {
        let seq_id = self.next_seq_id();
        let header = MessageHeader::new(method, MessageKind::Oneway, seq_id);
        let timeout = self.timeout;
        let result = match tokio::time::timeout(timeout, self.send(&header, args)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "oneway send timed out",
            ))),
        };
        self.close_on_failure(&result);
        result
    }

    /// Sends the tracing upgrade request.
    ///
    /// Returns `false` when the server does not support the upgrade; the
    /// connection then stays in plain mode.
    pub async fn upgrade(&mut self) -> Result<bool, ClientError> {
        if self.upgraded {
            return Ok(true);
        }
        match self.call(UPGRADE_METHOD, &connection_options()).await {
            Ok(_) => {
                tracing::debug!("[conn {}] upgraded to tracing headers", self.id);
                self.upgraded = true;
                Ok(true)
            }
            Err(ClientError::Application(exc))
                if exc.kind == ApplicationExceptionKind::UnknownMethod =>
            {
                tracing::debug!("[conn {}] server does not support upgrade", self.id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Shuts the transport down.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            tracing::debug!("[conn {}] closing connection to {}", self.id, self.peer);
            let _ = writer.shutdown().await;
        }
        self.reader = None;
        self.decoder.clear();
    }

    fn mark_closed(&mut self) {
        self.reader = None;
        self.writer = None;
        self.decoder.clear();
    }

    fn close_on_failure<T>(&mut self, result: &Result<T, ClientError>) {
        if let Err(ClientError::Io(_) | ClientError::Protocol(_) | ClientError::Transport(_)) =
            result
        {
            self.mark_closed();
        }
    }

    fn next_seq_id(&mut self) -> i32 {
        let seq_id = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);
        seq_id
    }

    async fn send(&mut self, header: &MessageHeader, args: &Struct) -> Result<(), ClientError> {
        let request_header = if self.upgraded {
            Some(self.trace_header.clone().unwrap_or_default())
        } else {
            None
        };
        let encoded = Encoder::encode_call(request_header.as_ref(), header, args)?;

        let writer = self
            .writer
            .as_mut()
            .ok_or(ClientError::Transport(TransportError::Closed))?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        tracing::debug!(
            "[conn {}] sent {} {} seq={} ({} bytes)",
            self.id,
            header.kind,
            header.name,
            header.seq_id,
            encoded.len()
        );
        Ok(())
    }

    async fn exchange(
        &mut self,
        method: &str,
        seq_id: i32,
        args: &Struct,
    ) -> Result<Struct, ClientError> {
        self.send(&MessageHeader::new(method, MessageKind::Call, seq_id), args)
            .await?;

        let (header, body) = self.read_message().await?;
        match header.kind {
            // The stream is out of step with our calls; it cannot be reused.
            MessageKind::Reply | MessageKind::Exception if header.seq_id != seq_id => {
                self.mark_closed();
                Err(ClientError::Application(ApplicationException::new(
                    ApplicationExceptionKind::BadSequenceId,
                    format!("expected seq id {}, got {}", seq_id, header.seq_id),
                )))
            }
            MessageKind::Reply if header.name != method => {
                self.mark_closed();
                Err(ClientError::Application(ApplicationException::new(
                    ApplicationExceptionKind::WrongMethodName,
                    format!("expected reply to {}, got {}", method, header.name),
                )))
            }
            MessageKind::Reply => reply_result(body),
            MessageKind::Exception => Err(ClientError::Application(
                ApplicationException::from_struct(&body),
            )),
            other => Err(ClientError::Protocol(ProtocolError::UnexpectedMessageKind(
                other,
            ))),
        }
    }

    async fn read_message(&mut self) -> Result<(MessageHeader, Struct), ClientError> {
        let mut buf = [0u8; DEFAULT_READ_BUFFER_SIZE];
        loop {
            if let Some(message) = self.decoder.decode_message()? {
                return Ok(message);
            }

            let reader = self
                .reader
                .as_mut()
                .ok_or(ClientError::Transport(TransportError::Closed))?;
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!("[conn {}] connection closed by peer", self.id);
                return Err(ClientError::Transport(TransportError::Closed));
            }
            self.decoder.extend(&buf[..n]);
        }
    }
}

/// Splits a REPLY into its result. A reply with no success value that
/// carries a struct in another field is a declared exception.
fn reply_result(mut body: Struct) -> Result<Struct, ClientError> {
    if body.contains(SUCCESS_FIELD) {
        return Ok(body);
    }
    let declared = body
        .iter()
        .find_map(|(id, value)| matches!(value, Value::Struct(_)).then_some(id));
    match declared {
        Some(field_id) => match body.take(field_id).and_then(Value::into_struct) {
            Some(payload) => Err(ClientError::Declared { field_id, payload }),
            None => Ok(body),
        },
        None => Ok(body),
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("upgraded", &self.upgraded)
            .finish()
    }
}
