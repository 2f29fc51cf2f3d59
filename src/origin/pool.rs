//! Pooled upstream connections
//!
//! Each server behind an origin gets its own idle pool keyed by
//! (host, port). Connections are created with tuned sockets, health-checked
//! with a one-byte peek on return, and handed out wrapped in
//! [`PooledStream`] so the rest of the crate sees a plain async stream.

use deadpool::managed::{self, Metrics, Object, Pool, RecycleError, RecycleResult, Timeouts};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::constants::pool::GET_TIMEOUT_SECS;
use crate::constants::socket::{ORIGIN_RECV_BUFFER, ORIGIN_SEND_BUFFER};
use crate::error::ProxyError;
use crate::types::OriginName;

/// Deadpool manager dialing one origin server
#[derive(Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }

    fn tune(&self, stream: &TcpStream) {
        let sock = SockRef::from(stream);
        if let Err(e) = sock.set_tcp_nodelay(true) {
            debug!(host = %self.host, "failed to set nodelay: {e}");
        }
        if let Err(e) = sock.set_recv_buffer_size(ORIGIN_RECV_BUFFER) {
            debug!(host = %self.host, "failed to set recv buffer: {e}");
        }
        if let Err(e) = sock.set_send_buffer_size(ORIGIN_SEND_BUFFER) {
            debug!(host = %self.host, "failed to set send buffer: {e}");
        }
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10));
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            debug!(host = %self.host, "failed to set keepalive: {e}");
        }
    }
}

impl managed::Manager for TcpConnector {
    type Type = TcpStream;
    type Error = io::Error;

    async fn create(&self) -> Result<TcpStream, io::Error> {
        debug!(host = %self.host, port = self.port, "dialing origin server");
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "connect to {}:{} timed out after {:?}",
                        self.host, self.port, self.connect_timeout
                    ),
                )
            })??;
        self.tune(&stream);
        Ok(stream)
    }

    async fn recycle(&self, conn: &mut TcpStream, _: &Metrics) -> RecycleResult<io::Error> {
        // One-byte peek distinguishes idle, closed, and dirty connections
        let mut peek_buf = [0u8; crate::constants::pool::TCP_PEEK_BUFFER_SIZE];
        match conn.try_read(&mut peek_buf) {
            Ok(0) => {
                debug!(host = %self.host, "pooled connection closed by origin");
                Err(RecycleError::Message("connection closed".into()))
            }
            Ok(_) => {
                debug!(host = %self.host, "unexpected data on idle origin connection");
                Err(RecycleError::Message("unexpected data on idle connection".into()))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                debug!(host = %self.host, "pooled connection failed health check: {e}");
                Err(RecycleError::Message(
                    format!("connection error: {e}").into(),
                ))
            }
        }
    }
}

pub(crate) type OriginPool = Pool<TcpConnector>;

/// Build the idle pool for one origin server
pub(crate) fn build_pool(
    host: &str,
    port: u16,
    max_size: usize,
    connect_timeout: Duration,
) -> Result<OriginPool, ProxyError> {
    let manager = TcpConnector::new(host, port, connect_timeout);
    Pool::builder(manager)
        .max_size(max_size)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| ProxyError::IoError(io::Error::other(format!("pool build failed: {e}"))))
}

/// Lease a connection from a server's pool
pub(crate) async fn acquire(
    pool: &OriginPool,
    origin: &OriginName,
    host: &str,
    port: u16,
) -> Result<PooledStream, ProxyError> {
    let mut timeouts = Timeouts::new();
    timeouts.wait = Some(Duration::from_secs(GET_TIMEOUT_SECS));

    match pool.timeout_get(&timeouts).await {
        Ok(object) => Ok(PooledStream { inner: object }),
        Err(managed::PoolError::Timeout(_)) => Err(ProxyError::PoolExhausted {
            origin: origin.as_str().to_string(),
            max_size: pool.status().max_size,
        }),
        Err(managed::PoolError::Backend(source)) => Err(ProxyError::OriginConnectFailure {
            origin: origin.as_str().to_string(),
            host: host.to_string(),
            port,
            source,
        }),
        Err(other) => Err(ProxyError::OriginConnectFailure {
            origin: origin.as_str().to_string(),
            host: host.to_string(),
            port,
            source: io::Error::other(other.to_string()),
        }),
    }
}

/// A leased upstream connection
///
/// Dropping it returns the connection to the pool, where the recycle peek
/// decides whether it is clean enough to reuse. A stream dropped with
/// unread response bytes fails that peek and is discarded, so an aborted
/// exchange can never poison the next request.
#[derive(Debug)]
pub struct PooledStream {
    inner: Object<TcpConnector>,
}

impl PooledStream {
    /// Address of the origin server this lease points at
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Remove the connection from the pool permanently
    #[must_use]
    pub fn detach(self) -> TcpStream {
        Object::take(self.inner)
    }
}

impl AsyncRead for PooledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn origin_name() -> OriginName {
        OriginName::new("api".to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&buf).await.unwrap();
        });

        let pool = build_pool(&addr.ip().to_string(), addr.port(), 2, Duration::from_secs(2))
            .unwrap();
        let mut stream = acquire(&pool, &origin_name(), &addr.ip().to_string(), addr.port())
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connect_failure() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = build_pool(&addr.ip().to_string(), addr.port(), 1, Duration::from_secs(2))
            .unwrap();
        let error = acquire(&pool, &origin_name(), &addr.ip().to_string(), addr.port())
            .await
            .unwrap_err();

        assert!(matches!(error, ProxyError::OriginConnectFailure { .. }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_clean_connection_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept once and hold the connection open
            let (_server, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let pool = build_pool(&addr.ip().to_string(), addr.port(), 4, Duration::from_secs(2))
            .unwrap();
        let first = acquire(&pool, &origin_name(), &addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        drop(first);

        let _second = acquire(&pool, &origin_name(), &addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        // One server accept, two leases: the connection came back from the pool
        assert_eq!(pool.status().size, 1);
    }
}
