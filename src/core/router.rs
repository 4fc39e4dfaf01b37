//! Hostname routing table.
//!
//! Built once at startup from the mapping file and never mutated after;
//! dispatch is a plain HashMap lookup on the request's host with any port
//! suffix stripped and ASCII case folded.
use std::{collections::HashMap, net::SocketAddr};

use axum::body::Body;
use http::{Request, Response, StatusCode};

use crate::{
    adapters::{
        upstream::DialTarget, HttpUpstream, HttpsClient, SocketUpstream, StaticDir, WellKnownDoc,
    },
    config::Mapping,
    core::{
        backend::{Backend, ResolveError},
        director,
    },
    utils::BufferPool,
};

/// The per-hostname handler a request is dispatched to.
#[derive(Debug, Clone)]
pub enum RouteHandler {
    Socket(SocketUpstream),
    Http(HttpUpstream),
    Static(StaticDir),
    WellKnown(WellKnownDoc),
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, RouteHandler>,
}

impl RoutingTable {
    /// Build the table from a parsed mapping. An invalid hostname aborts
    /// startup; an unreadable well-known document only drops that hostname,
    /// so one bad file does not take down every other site. Dropped
    /// hostnames are excluded from the certificate whitelist too.
    pub fn build(
        mapping: &Mapping,
        https_client: &HttpsClient,
        pool: &BufferPool,
    ) -> Result<Self, ResolveError> {
        if mapping.is_empty() {
            return Err(ResolveError::EmptyMapping);
        }

        let mut routes = HashMap::with_capacity(mapping.len());
        for (hostname, addr) in mapping {
            let handler = match Backend::classify(hostname, addr)? {
                Backend::Tcp { addr } => {
                    RouteHandler::Socket(SocketUpstream::new(DialTarget::Tcp(addr), pool.clone()))
                }
                Backend::Unix { path } => {
                    RouteHandler::Socket(SocketUpstream::new(DialTarget::Unix(path), pool.clone()))
                }
                Backend::AbstractUnix { dial } => RouteHandler::Socket(SocketUpstream::new(
                    DialTarget::Abstract(dial),
                    pool.clone(),
                )),
                Backend::StaticDir { root } => RouteHandler::Static(StaticDir::new(root)),
                Backend::WellKnown { path, .. } => match WellKnownDoc::load(&path) {
                    Ok(doc) => RouteHandler::WellKnown(doc),
                    Err(error) => {
                        tracing::warn!(
                            %error,
                            hostname,
                            path = %path.display(),
                            "skipping well-known document host"
                        );
                        continue;
                    }
                },
                Backend::HttpUpstream { url } => RouteHandler::Http(HttpUpstream::new(
                    url,
                    https_client.clone(),
                    pool.clone(),
                )),
            };
            routes.insert(hostname.to_ascii_lowercase(), handler);
        }
        Ok(Self { routes })
    }

    /// Hostnames the table actually serves; this is also the certificate
    /// whitelist.
    pub fn hostnames(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let Some(host) = director::request_host(&req) else {
            return not_found();
        };
        let key = director::strip_port(&host).to_ascii_lowercase();
        match self.routes.get(&key) {
            None => not_found(),
            Some(RouteHandler::Socket(upstream)) => upstream.forward(req, client_addr).await,
            Some(RouteHandler::Http(upstream)) => upstream.forward(req, client_addr).await,
            Some(RouteHandler::Static(dir)) => dir.handle(req).await,
            Some(RouteHandler::WellKnown(doc)) => doc.handle(&req),
        }
    }
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use http::header;

    use super::*;
    use crate::adapters::upstream::https_client;

    fn build(entries: &[(&str, &str)]) -> Result<RoutingTable, ResolveError> {
        let mapping: Mapping = entries
            .iter()
            .map(|(h, a)| (h.to_string(), a.to_string()))
            .collect();
        RoutingTable::build(&mapping, &https_client(), &BufferPool::default())
    }

    fn get(host: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn empty_mapping_is_an_error() {
        assert_eq!(build(&[]).unwrap_err(), ResolveError::EmptyMapping);
    }

    #[tokio::test]
    async fn invalid_hostname_aborts_the_build() {
        let err = build(&[("bad/host", "127.0.0.1:9000")]).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidHostname(_)));
    }

    #[tokio::test]
    async fn one_route_per_valid_hostname() {
        let table = build(&[
            ("a.example.com", "127.0.0.1:9000"),
            ("b.example.com", "http://127.0.0.1:8080"),
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        let mut hostnames = table.hostnames();
        hostnames.sort();
        assert_eq!(hostnames, ["a.example.com", "b.example.com"]);
    }

    #[tokio::test]
    async fn unreadable_well_known_document_drops_only_that_host() {
        let table = build(&[
            ("a.example.com", "127.0.0.1:9000"),
            ("b.example.com", "/definitely/not/here/nostr.json"),
        ])
        .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.hostnames(), ["a.example.com"]);
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let table = build(&[("a.example.com", "127.0.0.1:9000")]).unwrap();
        let response = table.dispatch(get("other.example.com"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_host_is_not_found() {
        let table = build(&[("a.example.com", "127.0.0.1:9000")]).unwrap();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = table.dispatch(req, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn host_matching_folds_case_and_ignores_port() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "ok").unwrap();
        let root = format!("{}/", dir.path().display());

        let table = build(&[("a.example.com", root.as_str())]).unwrap();
        for host in ["a.example.com", "A.Example.COM", "a.example.com:443"] {
            let response = table.dispatch(get(host), None).await;
            assert_eq!(response.status(), StatusCode::OK, "{host}");
        }
    }
}
