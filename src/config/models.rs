//! Process configuration for hostgate.
//!
//! All of this is fixed for the lifetime of the process. The two connection
//! timeout strategies are mutually exclusive: either request-level
//! read/write timeouts, or idle-timeout based connection reclamation, never
//! both.
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use thiserror::Error;

/// How long TCP keep-alive waits before sending probes on accepted
/// connections when the idle-timeout strategy is active.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Bounded grace period for draining in-flight connections on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("certificate cache directory must not be empty")]
    EmptyCacheDir,

    #[error("idle timeout cannot be combined with read/write timeouts (set them to 0)")]
    ConflictingTimeouts,
}

/// Immutable run configuration assembled from command-line flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Address of the TLS listener.
    pub https_addr: SocketAddr,
    /// Address of the plain-HTTP redirect listener; `None` disables it.
    pub http_addr: Option<SocketAddr>,
    /// Path to the host/backend mapping file.
    pub mapping: PathBuf,
    /// Directory caching ACME account keys and certificates.
    pub cache_dir: PathBuf,
    /// Contact email presented to the certificate authority.
    pub email: Option<String>,
    /// Add `Strict-Transport-Security` to every response.
    pub hsts: bool,
    /// Maximum duration for reading a request.
    pub read_timeout: Option<Duration>,
    /// Maximum duration for writing a response.
    pub write_timeout: Option<Duration>,
    /// Idle-timeout based connection reclamation; requires the read/write
    /// timeouts to be disabled.
    pub idle_timeout: Option<Duration>,
    /// Use the production Let's Encrypt directory instead of staging.
    pub production: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCacheDir);
        }
        if self.idle_timeout.is_some()
            && (self.read_timeout.is_some() || self.write_timeout.is_some())
        {
            return Err(ConfigError::ConflictingTimeouts);
        }
        Ok(())
    }

    /// Whether TLS connections should be wrapped with keep-alive and
    /// idle-timeout decorators instead of request-level timeouts.
    pub fn uses_idle_strategy(&self) -> bool {
        self.idle_timeout.is_some()
    }

    /// Combined request/response budget for the request timeout layer.
    /// hyper exposes no socket-level read/write deadlines, so the two Go
    /// style timeouts collapse into one request-scoped window.
    pub fn request_timeout(&self) -> Option<Duration> {
        match (self.read_timeout, self.write_timeout) {
            (None, None) => None,
            (read, write) => {
                Some(read.unwrap_or(Duration::ZERO) + write.unwrap_or(Duration::ZERO))
            }
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            https_addr: "0.0.0.0:443".parse().expect("valid default address"),
            http_addr: Some("0.0.0.0:80".parse().expect("valid default address")),
            mapping: PathBuf::from("mapping.txt"),
            cache_dir: PathBuf::from("/var/cache/letsencrypt"),
            email: None,
            hsts: false,
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: Some(Duration::from_secs(5 * 60)),
            idle_timeout: None,
            production: true,
        }
    }
}
