//! Backend transports and proxy forwarding.
//!
//! Each socket-style backend (TCP, filesystem Unix socket, Linux abstract
//! socket) gets its own hyper client over a [`SocketConnector`] that always
//! dials the configured target, ignoring the request URI's authority. HTTP
//! and HTTPS upstreams share one rustls-backed client. Upstream failures
//! become a 502 for the affected request only; nothing is retried.
use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::body::Body;
use http::{header, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{
        connect::{Connect, Connected, Connection, HttpConnector},
        Client,
    },
    rt::{TokioExecutor, TokioIo},
};
use rustls_native_certs::load_native_certs;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tower::Service;
use url::Url;

use crate::{
    core::{backend::DIAL_TIMEOUT, director},
    utils::BufferPool,
};

/// Where a socket-style backend lives on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// Literal `host:port` dial string.
    Tcp(String),
    /// Filesystem Unix socket path.
    Unix(PathBuf),
    /// Abstract Unix socket address bytes, NUL-suffixed, including the
    /// leading `@` marker.
    Abstract(Vec<u8>),
}

impl DialTarget {
    async fn connect(&self) -> io::Result<BackendStream> {
        match self {
            DialTarget::Tcp(addr) => Ok(BackendStream::Tcp(TcpStream::connect(addr).await?)),
            DialTarget::Unix(path) => connect_unix(path).await,
            DialTarget::Abstract(dial) => connect_abstract(dial).await,
        }
    }
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> io::Result<BackendStream> {
    Ok(BackendStream::Unix(
        tokio::net::UnixStream::connect(path).await?,
    ))
}

#[cfg(not(unix))]
async fn connect_unix(_path: &std::path::Path) -> io::Result<BackendStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix socket backends require a unix platform",
    ))
}

#[cfg(target_os = "linux")]
async fn connect_abstract(dial: &[u8]) -> io::Result<BackendStream> {
    use std::os::linux::net::SocketAddrExt;

    // `dial` is the literal mapping address plus one trailing NUL; the
    // abstract namespace name starts after the `@` marker and keeps the
    // NUL so connect(2) sees the uwsgi-compatible address length.
    let name = dial.strip_prefix(b"@").unwrap_or(dial).to_vec();
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
    let std_stream = tokio::task::spawn_blocking(move || {
        let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        Ok::<_, io::Error>(stream)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(BackendStream::Unix(tokio::net::UnixStream::from_std(
        std_stream,
    )?))
}

#[cfg(not(target_os = "linux"))]
async fn connect_abstract(_dial: &[u8]) -> io::Result<BackendStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets are linux-only",
    ))
}

/// A dialed backend connection.
#[derive(Debug)]
pub enum BackendStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for BackendStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector that dials one fixed [`DialTarget`] with a bounded connect
/// timeout, regardless of the URI hyper asks for.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    target: DialTarget,
    timeout: Duration,
}

impl SocketConnector {
    pub fn new(target: DialTarget) -> Self {
        Self {
            target,
            timeout: DIAL_TIMEOUT,
        }
    }
}

impl Service<Uri> for SocketConnector {
    type Response = TokioIo<BackendStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let target = self.target.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let stream = tokio::time::timeout(timeout, target.connect())
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, format!("dial {target:?} timed out"))
                })??;
            Ok(TokioIo::new(stream))
        })
    }
}

/// Shared client for http(s) upstreams: HTTP/1.1 with ALPN-negotiated h2,
/// rustls with the platform trust store.
pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

pub fn https_client() -> HttpsClient {
    // Install the default crypto provider for rustls if not already set.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = load_native_certs();
    for cert in native_certs.certs {
        if root_cert_store.add(cert).is_err() {
            tracing::warn!("failed to add a native certificate to the root store");
        }
    }
    if !native_certs.errors.is_empty() {
        tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector)
}

/// Proxy handler for a socket-style backend. The inbound Host header is
/// preserved; the connection goes to the configured socket.
#[derive(Debug, Clone)]
pub struct SocketUpstream {
    client: Client<SocketConnector, Body>,
    pool: BufferPool,
}

impl SocketUpstream {
    pub fn new(target: DialTarget, pool: BufferPool) -> Self {
        let client =
            Client::builder(TokioExecutor::new()).build::<_, Body>(SocketConnector::new(target));
        Self { client, pool }
    }

    pub async fn forward(
        &self,
        mut req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        if let Err(error) = director::prepare_socket_request(&mut req, client_addr) {
            tracing::error!(%error, "failed to rewrite request for socket backend");
            return bad_gateway();
        }
        send_with_upgrades(&self.client, req, &self.pool).await
    }
}

/// Proxy handler for an `http://` or `https://` upstream. The inbound Host
/// header is replaced with the upstream's own.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: HttpsClient,
    target: Url,
    pool: BufferPool,
}

impl HttpUpstream {
    pub fn new(target: Url, client: HttpsClient, pool: BufferPool) -> Self {
        Self {
            client,
            target,
            pool,
        }
    }

    pub async fn forward(
        &self,
        mut req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        if let Err(error) = director::prepare_http_request(&mut req, &self.target, client_addr) {
            tracing::error!(%error, target = %self.target, "failed to rewrite request for http upstream");
            return bad_gateway();
        }
        send_with_upgrades(&self.client, req, &self.pool).await
    }
}

/// Send a rewritten request upstream. A `101 Switching Protocols` response
/// bridges the two upgraded streams through the buffer pool; any client
/// error becomes a single 502.
async fn send_with_upgrades<C>(
    client: &Client<C, Body>,
    mut req: Request<Body>,
    pool: &BufferPool,
) -> Response<Body>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let downstream_upgrade = req
        .headers()
        .contains_key(header::UPGRADE)
        .then(|| hyper::upgrade::on(&mut req));
    let uri = req.uri().clone();

    match client.request(req).await {
        Ok(mut response) => {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS
                && let Some(downstream) = downstream_upgrade
            {
                let upstream = hyper::upgrade::on(&mut response);
                let pool = pool.clone();
                tokio::spawn(async move {
                    match tokio::try_join!(upstream, downstream) {
                        Ok((upstream, downstream)) => {
                            if let Err(error) = relay_upgraded(
                                TokioIo::new(upstream),
                                TokioIo::new(downstream),
                                pool,
                            )
                            .await
                            {
                                tracing::debug!(%error, "upgraded relay closed");
                            }
                        }
                        Err(error) => tracing::debug!(%error, "upgrade handshake failed"),
                    }
                });
            }
            response.map(Body::new)
        }
        Err(error) => {
            tracing::error!(%error, %uri, "upstream request failed");
            bad_gateway()
        }
    }
}

/// Bidirectional copy between two upgraded connections. Both directions use
/// buffers checked out of the pool; the guards return them when this
/// future completes, whether cleanly or through an error.
async fn relay_upgraded<A, B>(a: A, b: B, pool: BufferPool) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);
    let mut buf_ab = pool.get();
    let mut buf_ba = pool.get();

    let a_to_b = async {
        loop {
            let n = read_a.read(&mut buf_ab[..]).await?;
            if n == 0 {
                break;
            }
            write_b.write_all(&buf_ab[..n]).await?;
        }
        write_b.shutdown().await
    };
    let b_to_a = async {
        loop {
            let n = read_b.read(&mut buf_ba[..]).await?;
            if n == 0 {
                break;
            }
            write_a.write_all(&buf_ba[..n]).await?;
        }
        write_a.shutdown().await
    };

    tokio::try_join!(a_to_b, b_to_a).map(|_| ())
}

fn bad_gateway() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from("bad gateway"))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
