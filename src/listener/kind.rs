//! Concrete listener kinds and the streams they produce.

use super::TlsAcceptor;
use pin_project_lite::pin_project;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::server::TlsStream;

/// How long a TLS handshake may take before the connection is dropped.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    /// TCP listener whose connections are wrapped in TLS after accept.
    Tls {
        inner: TcpListener,
        acceptor: TlsAcceptor,
    },
}

/// Local address of a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(Option<PathBuf>),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(Some(path)) => write!(f, "{}", path.display()),
            ListenAddr::Unix(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

/// Address of the peer on an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => f.write_str("unix"),
        }
    }
}

impl Listener {
    /// Wrap a TCP listener in TLS.
    ///
    /// Fails for Unix listeners. Re-wrapping a TLS listener replaces its
    /// acceptor.
    pub fn with_tls(self, acceptor: TlsAcceptor) -> io::Result<Listener> {
        match self {
            Listener::Tcp(inner) | Listener::Tls { inner, .. } => Ok(Listener::Tls { inner, acceptor }),
            Listener::Unix(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS is only supported on TCP listeners",
            )),
        }
    }

    /// Whether this is a Unix domain socket listener.
    pub fn is_unix(&self) -> bool {
        matches!(self, Listener::Unix(_))
    }

    /// Whether accepted connections are TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self, Listener::Tls { .. })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            Listener::Tcp(l) | Listener::Tls { inner: l, .. } => l.local_addr().map(ListenAddr::Tcp),
            Listener::Unix(l) => l
                .local_addr()
                .map(|addr| ListenAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf()))),
        }
    }

    /// Poll for the next connection.
    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<Incoming>> {
        match self {
            Listener::Tcp(l) => l.poll_accept(cx).map_ok(|(stream, peer)| Incoming {
                stream: Stream::Tcp { inner: stream },
                peer: PeerAddr::Tcp(peer),
                tls: None,
            }),
            Listener::Tls { inner, acceptor } => inner.poll_accept(cx).map_ok(|(stream, peer)| Incoming {
                stream: Stream::Tcp { inner: stream },
                peer: PeerAddr::Tcp(peer),
                tls: Some(acceptor.clone()),
            }),
            Listener::Unix(l) => l.poll_accept(cx).map_ok(|(stream, _)| Incoming {
                stream: Stream::Unix { inner: stream },
                peer: PeerAddr::Unix,
                tls: None,
            }),
        }
    }

    /// Duplicate the socket into an independent listener of the same kind.
    ///
    /// TLS listeners cannot be duplicated directly; use
    /// [`Listener::try_clone_transport`] and re-wrap the result.
    pub fn try_clone(&self) -> io::Result<Listener> {
        match self {
            Listener::Tls { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot duplicate a TLS listener, clone the plaintext transport and re-wrap it",
            )),
            _ => self.try_clone_transport(),
        }
    }

    /// Duplicate the plaintext transport socket, dropping any TLS layer.
    pub fn try_clone_transport(&self) -> io::Result<Listener> {
        match self {
            Listener::Tcp(l) | Listener::Tls { inner: l, .. } => {
                let socket = SockRef::from(l).try_clone()?;
                socket.set_nonblocking(true)?;
                Ok(Listener::Tcp(TcpListener::from_std(socket.into())?))
            }
            Listener::Unix(l) => {
                let fd = l.as_fd().try_clone_to_owned()?;
                let std_listener = std::os::unix::net::UnixListener::from(fd);
                std_listener.set_nonblocking(true)?;
                Ok(Listener::Unix(UnixListener::from_std(std_listener)?))
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) | Listener::Tls { inner: l, .. } => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Listener::Tcp(_) => "tcp",
            Listener::Unix(_) => "unix",
            Listener::Tls { .. } => "tls",
        };
        f.debug_struct("Listener")
            .field("kind", &kind)
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

impl From<TcpListener> for Listener {
    fn from(listener: TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

impl From<UnixListener> for Listener {
    fn from(listener: UnixListener) -> Self {
        Listener::Unix(listener)
    }
}

/// A freshly accepted connection whose TLS handshake (if any) is still
/// pending.
pub struct Incoming {
    stream: Stream,
    peer: PeerAddr,
    tls: Option<TlsAcceptor>,
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("peer", &self.peer)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Incoming {
    /// Peer address of the connection.
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Enable TCP keep-alive probing. No-op on Unix sockets.
    pub fn set_tcp_keepalive(&self, period: Duration) -> io::Result<()> {
        if let Stream::Tcp { inner } = &self.stream {
            let keepalive = TcpKeepalive::new().with_time(period).with_interval(period);
            SockRef::from(inner).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }

    /// Finish setting up the stream, running the TLS handshake when the
    /// listener is TLS-wrapped.
    pub async fn establish(self) -> io::Result<Stream> {
        let Some(acceptor) = self.tls else {
            return Ok(self.stream);
        };
        let inner = match self.stream {
            Stream::Tcp { inner } => inner,
            other => return Ok(other),
        };

        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(inner)).await {
            Ok(Ok(tls)) => Ok(Stream::Tls { inner: Box::new(tls) }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")),
        }
    }
}

pin_project! {
    /// Byte stream of an accepted connection.
    #[project = StreamProj]
    pub enum Stream {
        Tcp { #[pin] inner: TcpStream },
        Unix { #[pin] inner: UnixStream },
        Tls { #[pin] inner: Box<TlsStream<TcpStream>> },
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            StreamProj::Tcp { inner } => inner.poll_read(cx, buf),
            StreamProj::Unix { inner } => inner.poll_read(cx, buf),
            StreamProj::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.project() {
            StreamProj::Tcp { inner } => inner.poll_write(cx, buf),
            StreamProj::Unix { inner } => inner.poll_write(cx, buf),
            StreamProj::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            StreamProj::Tcp { inner } => inner.poll_write_vectored(cx, bufs),
            StreamProj::Unix { inner } => inner.poll_write_vectored(cx, bufs),
            StreamProj::Tls { inner } => inner.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Tcp { inner } => inner.is_write_vectored(),
            Stream::Unix { inner } => inner.is_write_vectored(),
            Stream::Tls { inner } => inner.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            StreamProj::Tcp { inner } => inner.poll_flush(cx),
            StreamProj::Unix { inner } => inner.poll_flush(cx),
            StreamProj::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            StreamProj::Tcp { inner } => inner.poll_shutdown(cx),
            StreamProj::Unix { inner } => inner.poll_shutdown(cx),
            StreamProj::Tls { inner } => inner.poll_shutdown(cx),
        }
    }
}
