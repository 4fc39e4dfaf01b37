//! Server orchestration.
//!
//! Up to four tasks run under one cancellation token: the TLS accept loop,
//! the HTTPS connection server, the optional plain-HTTP redirect listener
//! and the signal watcher, plus the ACME event driver. The first task that
//! fails cancels the token; the remaining tasks drain their in-flight
//! connections within a bounded grace period and the first error becomes
//! the process result.
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    extract::{ConnectInfo, Request},
    Extension, Router,
};
use eyre::{eyre, Result, WrapErr};
use http::{header, HeaderValue};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::{conn::auto, graceful::GracefulShutdown},
    service::TowerToHyperService,
};
use rustls_acme::AcmeAcceptor;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::{
    compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
    sync::CancellationToken,
};
use tower_http::{set_header::SetResponseHeaderLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    adapters::{acme, CertificateGate},
    config::{RunConfig, KEEPALIVE_PERIOD, SHUTDOWN_GRACE},
    core::RoutingTable,
    net::{IdleTimeout, KeepAliveListener},
};

/// Header-read guard on TLS connections; the handshake has already
/// happened, a well-behaved client sends headers promptly.
const TLS_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Header-read guard on the plain redirect listener.
const PLAIN_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Backlog of handshake-complete TLS connections awaiting an HTTP server.
const TLS_CONN_BACKLOG: usize = 64;

/// Bind the listeners and run every server task to completion. Returns the
/// first task error, or `Ok` after a signal-initiated shutdown.
pub async fn run(cfg: RunConfig, table: RoutingTable, mut gate: CertificateGate) -> Result<()> {
    // Bind before spawning anything so a taken port fails fast.
    let https_listener = TcpListener::bind(cfg.https_addr)
        .await
        .wrap_err_with(|| format!("failed to bind https listener on {}", cfg.https_addr))?;
    let http_listener = match cfg.http_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .wrap_err_with(|| format!("failed to bind http listener on {addr}"))?,
        ),
        None => None,
    };
    tracing::info!(
        https = %cfg.https_addr,
        http = ?cfg.http_addr,
        routes = table.len(),
        "listeners bound"
    );

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    tasks.spawn(signal_watcher(shutdown.clone()));

    if let Some(state) = gate.take_state() {
        let token = shutdown.clone();
        tasks.spawn(async move {
            acme::drive_events(state, token).await;
            Ok(())
        });
    }

    if let Some(listener) = http_listener {
        tasks.spawn(serve_plain(
            listener,
            acme::http_redirect_router(),
            shutdown.clone(),
        ));
    }

    let app = https_app(Arc::new(table), &cfg);
    let (conn_tx, conn_rx) = mpsc::channel(TLS_CONN_BACKLOG);
    let listener = if cfg.uses_idle_strategy() {
        HttpsListener::KeepAlive(KeepAliveListener::new(https_listener, KEEPALIVE_PERIOD))
    } else {
        HttpsListener::Plain(https_listener)
    };
    tasks.spawn(tls_accept_loop(
        listener,
        gate.acceptor(),
        gate.tls_config(),
        cfg.idle_timeout,
        conn_tx,
        shutdown.clone(),
    ));
    tasks.spawn(serve_https(conn_rx, app, shutdown.clone()));

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|join_error| Err(eyre!("server task panicked: {join_error}")));
        if let Err(error) = result
            && first_error.is_none()
        {
            tracing::error!(%error, "server task failed");
            first_error = Some(error);
        }
        // Whether this task failed or finished, the rest should stop too.
        shutdown.cancel();
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// The HTTPS application: every request falls through to the routing table,
/// wrapped with request tracing, the optional request timeout and the
/// optional HSTS response header.
fn https_app(table: Arc<RoutingTable>, cfg: &RunConfig) -> Router {
    let handler = move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
        let table = table.clone();
        async move { table.dispatch(req, Some(client_addr)).await }
    };
    let mut app = Router::new()
        .fallback(handler)
        .layer(TraceLayer::new_for_http());
    if let Some(timeout) = cfg.request_timeout() {
        app = app.layer(TimeoutLayer::new(timeout));
    }
    if cfg.hsts {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ));
    }
    app
}

async fn signal_watcher(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let sigterm = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .wrap_err("failed to register SIGTERM handler")?;
        sigterm.recv().await;
        Ok::<_, eyre::Report>(())
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<Result<()>>();

    tokio::select! {
        () = shutdown.cancelled() => return Ok(()),
        result = tokio::signal::ctrl_c() => {
            result.wrap_err("failed to listen for interrupt")?;
            tracing::info!("received interrupt, shutting down");
        }
        result = sigterm => {
            result?;
            tracing::info!("received SIGTERM, shutting down");
        }
    }
    shutdown.cancel();
    Ok(())
}

/// The TLS listener, optionally applying keep-alive probes to accepted
/// connections when the idle-timeout strategy is active.
enum HttpsListener {
    Plain(TcpListener),
    KeepAlive(KeepAliveListener),
}

impl HttpsListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match self {
            HttpsListener::Plain(listener) => listener.accept().await,
            HttpsListener::KeepAlive(listener) => listener.accept().await,
        }
    }
}

/// An accepted client connection, idle-wrapped when that strategy is on.
enum ClientStream {
    Plain(TcpStream),
    Idle(IdleTimeout<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Idle(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Idle(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Idle(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Idle(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

type TlsConn = Compat<rustls_acme::futures_rustls::server::TlsStream<Compat<ClientStream>>>;

/// Accept TCP connections and run the ACME handshake for each in its own
/// task, so a stalled handshake never blocks the accept loop. Completed
/// connections go to [`serve_https`]; TLS-ALPN-01 challenge connections
/// are fully handled inside the acceptor and never surface here.
async fn tls_accept_loop(
    listener: HttpsListener,
    acceptor: AcmeAcceptor,
    tls_config: Arc<rustls::ServerConfig>,
    idle: Option<Duration>,
    conns: mpsc::Sender<(TlsConn, SocketAddr)>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(error) if is_transient_accept_error(&error) => {
                tracing::warn!(%error, "transient accept error on https listener");
                continue;
            }
            Err(error) => {
                return Err(error).wrap_err("accept failed on https listener");
            }
        };
        let stream = match idle {
            Some(idle) => ClientStream::Idle(IdleTimeout::new(stream, idle)),
            None => ClientStream::Plain(stream),
        };

        let acceptor = acceptor.clone();
        let tls_config = tls_config.clone();
        let conns = conns.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream.compat()).await {
                Ok(Some(start)) => match start.into_stream(tls_config).await {
                    Ok(tls) => {
                        // Send fails only during shutdown; the connection
                        // is simply dropped then.
                        let _ = conns.send((tls.compat(), peer)).await;
                    }
                    Err(error) => tracing::debug!(%peer, %error, "tls stream setup failed"),
                },
                Ok(None) => tracing::debug!(%peer, "answered tls-alpn-01 challenge"),
                Err(error) => tracing::debug!(%peer, %error, "tls handshake failed"),
            }
        });
    }
}

fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
    )
}

/// Serve HTTP over handshake-complete TLS connections until shutdown, then
/// drain in-flight connections within the grace period.
async fn serve_https(
    mut conns: mpsc::Receiver<(TlsConn, SocketAddr)>,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let graceful = GracefulShutdown::new();
    let builder = conn_builder(TLS_HEADER_READ_TIMEOUT);
    loop {
        let received = tokio::select! {
            () = shutdown.cancelled() => break,
            received = conns.recv() => received,
        };
        let Some((stream, peer)) = received else {
            break;
        };
        let service =
            TowerToHyperService::new(app.clone().layer(Extension(ConnectInfo(peer))));
        let conn = graceful.watch(
            builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .into_owned(),
        );
        tokio::spawn(async move {
            if let Err(error) = conn.await {
                tracing::debug!(%error, "https connection error");
            }
        });
    }
    drain(graceful).await;
    Ok(())
}

/// The plain-HTTP redirect listener.
async fn serve_plain(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let graceful = GracefulShutdown::new();
    let builder = conn_builder(PLAIN_HEADER_READ_TIMEOUT);
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(error) if is_transient_accept_error(&error) => {
                tracing::warn!(%error, "transient accept error on http listener");
                continue;
            }
            Err(error) => {
                return Err(error).wrap_err("accept failed on http listener");
            }
        };
        let service =
            TowerToHyperService::new(app.clone().layer(Extension(ConnectInfo(peer))));
        let conn = graceful.watch(
            builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .into_owned(),
        );
        tokio::spawn(async move {
            if let Err(error) = conn.await {
                tracing::debug!(%error, "http connection error");
            }
        });
    }
    drain(graceful).await;
    Ok(())
}

fn conn_builder(header_read_timeout: Duration) -> auto::Builder<TokioExecutor> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);
    builder.http2().timer(TokioTimer::new());
    builder
}

async fn drain(graceful: GracefulShutdown) {
    tokio::select! {
        () = graceful.shutdown() => {}
        () = tokio::time::sleep(SHUTDOWN_GRACE) => {
            tracing::debug!("shutdown grace expired with connections still in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::{adapters::upstream::https_client, config::Mapping, utils::BufferPool};

    fn table_for(entries: &[(&str, &str)]) -> RoutingTable {
        let mapping: Mapping = entries
            .iter()
            .map(|(h, a)| (h.to_string(), a.to_string()))
            .collect();
        RoutingTable::build(&mapping, &https_client(), &BufferPool::default()).unwrap()
    }

    fn request(host: &str) -> Request {
        let mut req = http::Request::builder()
            .uri("/")
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.0.0.1:4242".parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn app_dispatches_by_host() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "front page").unwrap();
        let root = format!("{}/", dir.path().display());

        let table = table_for(&[("a.example.com", root.as_str())]);
        let app = https_app(Arc::new(table), &RunConfig::default());

        let response = app.clone().oneshot(request("a.example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(request("other.example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hsts_header_is_added_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "ok").unwrap();
        let root = format!("{}/", dir.path().display());

        let cfg = RunConfig {
            hsts: true,
            ..RunConfig::default()
        };
        let table = table_for(&[("a.example.com", root.as_str())]);
        let app = https_app(Arc::new(table), &cfg);

        let response = app.oneshot(request("a.example.com")).await.unwrap();
        assert_eq!(
            response.headers()[header::STRICT_TRANSPORT_SECURITY],
            "max-age=31536000; includeSubDomains"
        );
    }

    #[tokio::test]
    async fn hsts_header_is_absent_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "ok").unwrap();
        let root = format!("{}/", dir.path().display());

        let table = table_for(&[("a.example.com", root.as_str())]);
        let app = https_app(Arc::new(table), &RunConfig::default());

        let response = app.oneshot(request("a.example.com")).await.unwrap();
        assert!(!response
            .headers()
            .contains_key(header::STRICT_TRANSPORT_SECURITY));
    }

    #[test]
    fn transient_accept_errors_are_classified() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient_accept_error(&io::Error::from(kind)));
        }
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::OutOfMemory
        )));
    }
}
