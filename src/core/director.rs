//! Request rewriting for proxied backends.
//!
//! The director mutates an inbound request so the upstream client can send
//! it on: target scheme/authority, joined paths, merged query strings and
//! the forwarding headers. The proxy is only ever reached over TLS, so
//! `X-Forwarded-Proto` is always `https`.
use std::net::SocketAddr;

use axum::body::Body;
use eyre::{eyre, Result, WrapErr};
use http::{header, uri::Uri, HeaderValue, Request};
use url::Url;

pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Permissive CORS method list attached to well-known documents.
pub const CORS_ALLOW_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Join two URL path segments with exactly one separating slash.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Merge the upstream's fixed query with the request query, separated by
/// `&` only when both are non-empty.
pub fn merge_query(target: Option<&str>, request: Option<&str>) -> Option<String> {
    match (target.unwrap_or(""), request.unwrap_or("")) {
        ("", "") => None,
        (t, "") => Some(t.to_string()),
        ("", r) => Some(r.to_string()),
        (t, r) => Some(format!("{t}&{r}")),
    }
}

/// Rewrite a request for a socket backend (TCP, Unix, abstract Unix).
///
/// The request keeps its original Host and path; only the scheme is pinned
/// to `http` and the forwarding headers are added. The connector dials the
/// configured socket regardless of the authority in the URI.
pub fn prepare_socket_request(
    req: &mut Request<Body>,
    client_addr: Option<SocketAddr>,
) -> Result<()> {
    let host = request_host(req).unwrap_or_else(|| "upstream".to_string());
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();

    *req.uri_mut() = format!("http://{host}{path_and_query}")
        .parse::<Uri>()
        .wrap_err("rebuilding socket upstream URI")?;

    apply_forwarding_headers(req, client_addr)?;
    Ok(())
}

/// Rewrite a request for an http(s) upstream: the target's scheme and
/// authority, joined paths, merged queries, and the target's own Host
/// header in place of the inbound one.
pub fn prepare_http_request(
    req: &mut Request<Body>,
    target: &Url,
    client_addr: Option<SocketAddr>,
) -> Result<()> {
    let authority = url_authority(target)?;
    let path = single_joining_slash(target.path(), req.uri().path());
    let uri = match merge_query(target.query(), req.uri().query()) {
        Some(query) => format!("{}://{authority}{path}?{query}", target.scheme()),
        None => format!("{}://{authority}{path}", target.scheme()),
    };
    *req.uri_mut() = uri.parse::<Uri>().wrap_err("rebuilding http upstream URI")?;

    // The inbound Host is dropped; the upstream sees its own.
    req.headers_mut().insert(
        header::HOST,
        HeaderValue::from_str(&authority).wrap_err("upstream authority as Host header")?,
    );

    apply_forwarding_headers(req, client_addr)?;
    Ok(())
}

/// Headers every proxied request carries: an empty User-Agent when the
/// client sent none (so the HTTP library's default does not leak),
/// `X-Forwarded-Proto: https`, and the observed remote address appended to
/// the `X-Forwarded-For` chain.
fn apply_forwarding_headers(
    req: &mut Request<Body>,
    client_addr: Option<SocketAddr>,
) -> Result<()> {
    let headers = req.headers_mut();
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
            _ => ip,
        };
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_str(&chain).wrap_err("client address as X-Forwarded-For")?,
        );
    }
    Ok(())
}

/// The inbound request's host: the Host header when present, otherwise the
/// URI authority.
pub fn request_host(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// Strip a trailing `:port` from a host, leaving bracketed IPv6 literals
/// intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        // `[::1]:443` or bare `[::1]`.
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, _)) => name,
        None => host,
    }
}

/// `host[:port]` for the upstream URL, omitting default ports.
fn url_authority(target: &Url) -> Result<String> {
    let host = target
        .host_str()
        .ok_or_else(|| eyre!("upstream URL {target} has no host"))?;
    Ok(match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
