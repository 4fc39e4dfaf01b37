//! ACME certificate provisioning via rustls-acme.
//!
//! Certificates are obtained through the TLS-ALPN-01 challenge, negotiated
//! on the same port 443 the proxy already listens on. The plain-HTTP
//! listener therefore only redirects to HTTPS; it plays no part in
//! challenge solving.
use std::{io, path::Path, sync::Arc};

use axum::{body::Body, Router};
use eyre::{Result, WrapErr};
use futures_util::StreamExt;
use http::{header, Method, Request, Response, StatusCode};
use rustls_acme::{caches::DirCache, AcmeAcceptor, AcmeConfig, AcmeState};
use tokio_util::sync::CancellationToken;

use crate::core::director;

/// TLS entry point: every handshake goes through the ACME acceptor, which
/// answers TLS-ALPN-01 challenges itself and hands ordinary connections on
/// with certificates from the managed resolver. Only configured hostnames
/// ever get a certificate ordered.
pub struct CertificateGate {
    acceptor: AcmeAcceptor,
    tls_config: Arc<rustls::ServerConfig>,
    state: Option<AcmeState<io::Error, io::Error>>,
}

impl CertificateGate {
    /// Build the gate for the given hostnames. The cache directory is
    /// created up front; failure to do so is fatal since account keys and
    /// certificates could not be persisted across restarts.
    pub fn new(
        hostnames: Vec<String>,
        cache_dir: &Path,
        email: Option<&str>,
        production: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).wrap_err_with(|| {
            format!(
                "failed to create certificate cache directory {}",
                cache_dir.display()
            )
        })?;

        let mut config = AcmeConfig::new(hostnames)
            .cache_option(Some(DirCache::new(cache_dir.to_path_buf())))
            .directory_lets_encrypt(production);
        if let Some(email) = email {
            config = config.contact([format!("mailto:{email}")]);
        }
        let state = config.state();

        let acceptor = state.acceptor();
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(state.resolver());
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            acceptor,
            tls_config: Arc::new(tls_config),
            state: Some(state),
        })
    }

    pub fn acceptor(&self) -> AcmeAcceptor {
        self.acceptor.clone()
    }

    pub fn tls_config(&self) -> Arc<rustls::ServerConfig> {
        self.tls_config.clone()
    }

    /// The event stream driving certificate orders and renewals. Taken once
    /// by the orchestrator and polled for the lifetime of the server.
    pub fn take_state(&mut self) -> Option<AcmeState<io::Error, io::Error>> {
        self.state.take()
    }
}

/// Poll the ACME state machine until shutdown. Order failures are logged
/// and retried internally by rustls-acme; they never take the proxy down.
pub async fn drive_events(
    mut state: AcmeState<io::Error, io::Error>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = state.next() => match event {
                Some(Ok(event)) => tracing::info!(?event, "acme event"),
                Some(Err(error)) => tracing::warn!(?error, "acme error"),
                None => break,
            },
        }
    }
}

/// Router for the plain-HTTP listener: permanent redirect to the HTTPS
/// origin for safe methods, 400 for everything else.
pub fn http_redirect_router() -> Router {
    Router::new().fallback(redirect_to_https)
}

async fn redirect_to_https(req: Request<Body>) -> Response<Body> {
    match *req.method() {
        Method::GET | Method::HEAD => {}
        _ => return status_only(StatusCode::BAD_REQUEST),
    }
    let Some(host) = director::request_host(&req) else {
        return status_only(StatusCode::BAD_REQUEST);
    };
    let host = director::strip_port(&host);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let location = format!("https://{host}{path_and_query}");

    match Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(_) => status_only(StatusCode::BAD_REQUEST),
    }
}

fn status_only(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, uri: &str, host: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn get_redirects_to_https_origin_without_port() {
        let req = request(Method::GET, "/a/b?q=1", Some("a.example.com:80"));
        let response = redirect_to_https(req).await;

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://a.example.com/a/b?q=1"
        );
    }

    #[tokio::test]
    async fn head_is_redirected_too() {
        let req = request(Method::HEAD, "/", Some("a.example.com"));
        let response = redirect_to_https(req).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://a.example.com/");
    }

    #[tokio::test]
    async fn unsafe_methods_get_bad_request() {
        for method in [Method::POST, Method::PUT, Method::DELETE] {
            let req = request(method, "/", Some("a.example.com"));
            let response = redirect_to_https(req).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn missing_host_gets_bad_request() {
        let req = request(Method::GET, "/", None);
        let response = redirect_to_https(req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
