//! Client stream abstraction over TCP, Unix sockets and in-memory pipes.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(unix)]
pin_project! {
    /// A client transport.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Tcp { #[pin] stream: TcpStream },
        Unix { #[pin] stream: UnixStream },
        Memory { #[pin] stream: DuplexStream },
    }
}

#[cfg(not(unix))]
pin_project! {
    /// A client transport.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Tcp { #[pin] stream: TcpStream },
        Memory { #[pin] stream: DuplexStream },
    }
}

impl ClientStream {
    /// Returns a short transport name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientStream::Tcp { .. } => "tcp",
            #[cfg(unix)]
            ClientStream::Unix { .. } => "unix",
            ClientStream::Memory { .. } => "memory",
        }
    }
}

impl From<TcpStream> for ClientStream {
    fn from(stream: TcpStream) -> Self {
        ClientStream::Tcp { stream }
    }
}

#[cfg(unix)]
impl From<UnixStream> for ClientStream {
    fn from(stream: UnixStream) -> Self {
        ClientStream::Unix { stream }
    }
}

impl From<DuplexStream> for ClientStream {
    fn from(stream: DuplexStream) -> Self {
        ClientStream::Memory { stream }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            #[cfg(unix)]
            ClientStreamProj::Unix { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Memory { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            #[cfg(unix)]
            ClientStreamProj::Unix { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Memory { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_flush(cx),
            #[cfg(unix)]
            ClientStreamProj::Unix { stream } => stream.poll_flush(cx),
            ClientStreamProj::Memory { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            #[cfg(unix)]
            ClientStreamProj::Unix { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Memory { stream } => stream.poll_shutdown(cx),
        }
    }
}
