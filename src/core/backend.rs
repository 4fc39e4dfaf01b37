//! Backend classification.
//!
//! Every mapping entry resolves to exactly one [`Backend`] variant, decided
//! by a single ordered classification so the resolution order is one
//! testable unit instead of scattered conditionals.
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use thiserror::Error;
use url::Url;

/// File names recognized as well-known documents. A backend address naming
/// one of these is served verbatim at `/.well-known/<name>` instead of being
/// treated as a Unix socket.
pub const WELL_KNOWN_DOCUMENTS: &[&str] = &["nostr.json"];

/// Connect timeout for dialing socket backends.
pub const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("empty mapping")]
    EmptyMapping,

    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
}

/// One backend per hostname, derived from the mapping entry's address
/// string. Exactly one variant matches any given address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Dial the literal address string over TCP.
    Tcp { addr: String },
    /// Dial a filesystem Unix socket.
    Unix { path: PathBuf },
    /// Dial a Linux abstract Unix socket. `dial` is the literal address
    /// with one trailing NUL byte appended, so the address length used for
    /// connect(2) matches what uwsgi and friends expect. Deliberately
    /// non-portable.
    AbstractUnix { dial: Vec<u8> },
    /// Serve files from a directory root.
    StaticDir { root: PathBuf },
    /// Serve one document at `/.well-known/<name>` with permissive CORS.
    WellKnown { path: PathBuf, name: String },
    /// Forward to an http(s) origin; the inbound Host header is replaced
    /// with the upstream's own.
    HttpUpstream { url: Url },
}

impl Backend {
    /// Classify one mapping entry. First match wins:
    /// 1. `@`-prefixed address on Linux: abstract Unix socket.
    /// 2. Absolute path with a trailing separator: static directory.
    /// 3. Absolute path naming a recognized well-known document.
    /// 4. Any other absolute path: filesystem Unix socket.
    /// 5. URL with scheme `http` or `https`: HTTP upstream.
    /// 6. Anything else: TCP dial of the literal address.
    pub fn classify(hostname: &str, addr: &str) -> Result<Self, ResolveError> {
        if hostname.contains(MAIN_SEPARATOR) {
            return Err(ResolveError::InvalidHostname(hostname.to_string()));
        }

        if addr.starts_with('@') && cfg!(target_os = "linux") {
            return Ok(Backend::AbstractUnix {
                dial: abstract_dial_address(addr),
            });
        }

        let path = Path::new(addr);
        if path.is_absolute() {
            if addr.ends_with(MAIN_SEPARATOR) {
                return Ok(Backend::StaticDir {
                    root: PathBuf::from(addr),
                });
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && WELL_KNOWN_DOCUMENTS.contains(&name)
            {
                return Ok(Backend::WellKnown {
                    path: PathBuf::from(addr),
                    name: name.to_string(),
                });
            }
            return Ok(Backend::Unix {
                path: PathBuf::from(addr),
            });
        }

        if let Ok(url) = Url::parse(addr)
            && matches!(url.scheme(), "http" | "https")
        {
            return Ok(Backend::HttpUpstream { url });
        }

        Ok(Backend::Tcp {
            addr: addr.to_string(),
        })
    }
}

/// The wire address for an abstract Unix socket: the literal mapping
/// address with exactly one trailing zero byte appended.
pub fn abstract_dial_address(addr: &str) -> Vec<u8> {
    let mut dial = addr.as_bytes().to_vec();
    dial.push(0);
    dial
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_with_path_separator_is_rejected() {
        let err = Backend::classify("evil/host", "127.0.0.1:9000").unwrap_err();
        assert_eq!(err, ResolveError::InvalidHostname("evil/host".to_string()));

        // Rejection does not depend on the backend address being valid.
        let err = Backend::classify("evil/host", "").unwrap_err();
        assert!(matches!(err, ResolveError::InvalidHostname(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn at_prefix_selects_abstract_socket_with_trailing_nul() {
        let backend = Backend::classify("a.example.com", "@uwsgi").unwrap();
        assert_eq!(
            backend,
            Backend::AbstractUnix {
                dial: b"@uwsgi\0".to_vec()
            }
        );
    }

    #[test]
    fn abstract_dial_address_appends_exactly_one_zero_byte() {
        assert_eq!(abstract_dial_address("@web"), b"@web\0");
        assert_eq!(abstract_dial_address("@"), b"@\0");
    }

    #[test]
    fn trailing_separator_selects_static_directory() {
        let backend = Backend::classify("b.example.com", "/srv/static/").unwrap();
        assert_eq!(
            backend,
            Backend::StaticDir {
                root: PathBuf::from("/srv/static/")
            }
        );
    }

    #[test]
    fn recognized_document_name_selects_well_known() {
        let backend = Backend::classify("c.example.com", "/srv/nostr.json").unwrap();
        assert_eq!(
            backend,
            Backend::WellKnown {
                path: PathBuf::from("/srv/nostr.json"),
                name: "nostr.json".to_string()
            }
        );
    }

    #[test]
    fn other_absolute_path_selects_unix_socket() {
        let backend = Backend::classify("d.example.com", "/run/app.sock").unwrap();
        assert_eq!(
            backend,
            Backend::Unix {
                path: PathBuf::from("/run/app.sock")
            }
        );
    }

    #[test]
    fn http_and_https_urls_select_http_upstream() {
        for addr in ["http://127.0.0.1:8080/base", "https://origin.example.net"] {
            let backend = Backend::classify("e.example.com", addr).unwrap();
            assert!(matches!(backend, Backend::HttpUpstream { .. }), "{addr}");
        }
    }

    #[test]
    fn non_http_scheme_falls_back_to_tcp() {
        // `localhost:8080` parses as a URL with scheme `localhost`, which is
        // not http(s) and therefore dials TCP, same as a bare host:port.
        for addr in ["localhost:8080", "127.0.0.1:9000", "ftp://example.com"] {
            let backend = Backend::classify("f.example.com", addr).unwrap();
            assert_eq!(
                backend,
                Backend::Tcp {
                    addr: addr.to_string()
                },
                "{addr}"
            );
        }
    }

    #[test]
    fn static_directory_wins_over_well_known_name() {
        // A directory path always stays a directory, even if a contained
        // file would be recognized as a well-known document.
        let backend = Backend::classify("g.example.com", "/srv/nostr.json/").unwrap();
        assert!(matches!(backend, Backend::StaticDir { .. }));
    }
}
