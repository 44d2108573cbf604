//! Stream abstractions shared by the dial path
//!
//! Hops hand connections to each other as boxed trait objects so a
//! Shadowsocks hop can swap the plain transport for its cipher stream
//! without the chain dialer caring.

use crate::error::{Result, SockchainError};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::{sleep_until, Instant, Sleep};

/// Object-safe alias for the duplex byte streams passed between hops.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<boxed async stream>")
    }
}

/// A boxed duplex stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Open a transport connection for the entry hop of a chain.
///
/// `network` is `tcp` for a `host:port` address or `unix` for a
/// socket path.
pub async fn connect(network: &str, address: &str) -> Result<BoxedStream> {
    match network {
        "tcp" => {
            let stream = TcpStream::connect(address).await?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = UnixStream::connect(address).await?;
            Ok(Box::new(stream))
        }
        other => Err(SockchainError::Config(format!(
            "unsupported network `{other}`"
        ))),
    }
}

/// Stream wrapper enforcing absolute read/write deadlines
///
/// Tokio sockets have no equivalent of socket deadlines, so the
/// `ReadTimeout`/`WriteTimeout` options on a chain's last hop are
/// applied by wrapping the finished tunnel in this type. A deadline is
/// absolute: once it passes, every read (or write) fails with
/// [`io::ErrorKind::TimedOut`].
pub struct DeadlineStream {
    inner: BoxedStream,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl DeadlineStream {
    /// Wrap a stream with no deadlines set.
    pub fn new(inner: BoxedStream) -> Self {
        DeadlineStream {
            inner,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Fail reads after `timeout` from now.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_deadline = Some(Box::pin(sleep_until(Instant::now() + timeout)));
    }

    /// Fail writes after `timeout` from now.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_deadline = Some(Box::pin(sleep_until(Instant::now() + timeout)));
    }
}

fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

impl AsyncRead for DeadlineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DeadlineStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
