//! Static-directory serving and pinned well-known documents.
use std::{
    io,
    path::{Path, PathBuf},
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::core::director::CORS_ALLOW_METHODS;

/// Serves files out of one directory root, with `index.html` resolution for
/// directory requests. Path traversal is rejected by ServeDir itself.
#[derive(Debug, Clone)]
pub struct StaticDir {
    serve_dir: ServeDir,
}

impl StaticDir {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            serve_dir: ServeDir::new(root).append_index_html_on_directories(true),
        }
    }

    pub async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        match self.serve_dir.clone().oneshot(req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let body = AxumBody::new(body.map_err(|error| {
                    tracing::error!(%error, "error streaming static file body");
                    axum::Error::new(error)
                }));
                Response::from_parts(parts, body)
            }
            Err(error) => {
                tracing::error!(%error, "static file service failed");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(AxumBody::empty())
                    .unwrap_or_else(|_| Response::new(AxumBody::empty()))
            }
        }
    }
}

/// One document served verbatim at `/.well-known/<name>`, loaded into
/// memory once at startup. Responses carry permissive CORS headers so
/// browser clients on other origins can fetch it.
#[derive(Debug, Clone)]
pub struct WellKnownDoc {
    name: String,
    body: Bytes,
    content_type: HeaderValue,
    serve_path: String,
}

impl WellKnownDoc {
    /// Reads the document from disk. An unreadable file is an error the
    /// caller decides how to handle; the route simply does not exist then.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("document path {} has no file name", path.display()),
                )
            })?
            .to_string();
        let body = Bytes::from(std::fs::read(&path)?);
        let content_type = if name.ends_with(".json") {
            HeaderValue::from_static("application/json")
        } else {
            HeaderValue::from_static("application/octet-stream")
        };
        let serve_path = format!("/.well-known/{name}");
        Ok(Self {
            name,
            body,
            content_type,
            serve_path,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self, req: &Request<AxumBody>) -> Response<AxumBody> {
        if req.uri().path() != self.serve_path {
            return status_only(StatusCode::NOT_FOUND);
        }
        match *req.method() {
            Method::GET | Method::HEAD => {}
            _ => return status_only(StatusCode::METHOD_NOT_ALLOWED),
        }

        let body = if req.method() == Method::HEAD {
            AxumBody::empty()
        } else {
            AxumBody::from(self.body.clone())
        };
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, self.content_type.clone())
            .header(header::CONTENT_LENGTH, self.body.len())
            .header(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            )
            .header(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(CORS_ALLOW_METHODS),
            )
            .body(body)
            .unwrap_or_else(|_| Response::new(AxumBody::empty()))
    }
}

fn status_only(status: StatusCode) -> Response<AxumBody> {
    Response::builder()
        .status(status)
        .body(AxumBody::empty())
        .unwrap_or_else(|_| Response::new(AxumBody::empty()))
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    use super::*;

    fn get(path: &str) -> Request<AxumBody> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(AxumBody::empty())
            .unwrap()
    }

    async fn body_bytes(response: Response<AxumBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn directory_request_serves_index_html() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();

        let static_dir = StaticDir::new(dir.path());
        let response = static_dir.handle(get("/")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "<h1>home</h1>");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let static_dir = StaticDir::new(dir.path());
        let response = static_dir.handle(get("/nope.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn well_known_doc_serves_verbatim_with_cors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nostr.json");
        let content = r#"{"names":{"alice":"deadbeef"}}"#;
        std::fs::write(&path, content).unwrap();

        let doc = WellKnownDoc::load(&path).unwrap();
        assert_eq!(doc.name(), "nostr.json");

        let response = doc.handle(&get("/.well-known/nostr.json"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET,HEAD,PUT,PATCH,POST,DELETE"
        );
        assert_eq!(body_bytes(response).await, content);
    }

    #[tokio::test]
    async fn well_known_doc_other_paths_are_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nostr.json");
        std::fs::write(&path, "{}").unwrap();

        let doc = WellKnownDoc::load(&path).unwrap();
        let response = doc.handle(&get("/other"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = doc.handle(&get("/.well-known/other.json"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn well_known_doc_rejects_mutating_methods() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nostr.json");
        std::fs::write(&path, "{}").unwrap();

        let doc = WellKnownDoc::load(&path).unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/.well-known/nostr.json")
            .body(AxumBody::empty())
            .unwrap();
        assert_eq!(doc.handle(&req).status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn head_request_omits_body_but_keeps_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nostr.json");
        std::fs::write(&path, "{\"names\":{}}").unwrap();

        let doc = WellKnownDoc::load(&path).unwrap();
        let req = Request::builder()
            .method(Method::HEAD)
            .uri("/.well-known/nostr.json")
            .body(AxumBody::empty())
            .unwrap();
        let response = doc.handle(&req);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "12");
        assert!(body_bytes(response).await.is_empty());
    }

    #[test]
    fn load_fails_for_missing_file() {
        assert!(WellKnownDoc::load("/definitely/not/here/nostr.json").is_err());
    }
}
