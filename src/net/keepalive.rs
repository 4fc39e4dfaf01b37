//! TCP keep-alive on accepted connections.
use std::{io, net::SocketAddr, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// Listener decorator that enables TCP keep-alive with a fixed probe period
/// on every accepted connection, so dead peers (a laptop closed
/// mid-download) eventually go away. Accept errors propagate to the caller;
/// nothing is retried here.
#[derive(Debug)]
pub struct KeepAliveListener {
    inner: TcpListener,
    period: Duration,
}

impl KeepAliveListener {
    pub fn new(inner: TcpListener, period: Duration) -> Self {
        Self { inner, period }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        let keepalive = TcpKeepalive::new()
            .with_time(self.period)
            .with_interval(self.period);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepted_connections_get_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = KeepAliveListener::new(listener, Duration::from_secs(60));

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();

        let sock = SockRef::from(&stream);
        assert!(sock.keepalive().unwrap());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn local_addr_is_passed_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = KeepAliveListener::new(listener, Duration::from_secs(60));
        assert_eq!(listener.local_addr().unwrap(), addr);
    }
}
