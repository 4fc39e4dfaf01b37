//! Hostgate - a TLS-terminating reverse proxy with automatic certificates.
//!
//! Hostgate routes incoming HTTPS requests by hostname to backends listed in
//! a plain-text mapping file and obtains its certificates from Let's Encrypt
//! over TLS-ALPN-01, caching them on disk across restarts.
//!
//! # Backends
//! One mapping line is `hostname: address`, where the address selects the
//! backend kind:
//! - `host:port` dials TCP
//! - `/path/to/socket` dials a Unix socket
//! - `@name` dials a Linux abstract Unix socket
//! - `/path/to/dir/` (trailing slash) serves static files
//! - `/path/to/nostr.json` serves that document at `/.well-known/nostr.json`
//! - `http://…` or `https://…` forwards to an HTTP origin
//!
//! # Example
//! ```no_run
//! use hostgate::{
//!     adapters::{upstream::https_client, CertificateGate},
//!     config::{mapping, RunConfig},
//!     core::RoutingTable,
//!     utils::BufferPool,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = RunConfig::default();
//! let mapping = mapping::load(&cfg.mapping)?;
//! let table = RoutingTable::build(&mapping, &https_client(), &BufferPool::default())?;
//! let gate = CertificateGate::new(
//!     table.hostnames(),
//!     &cfg.cache_dir,
//!     cfg.email.as_deref(),
//!     cfg.production,
//! )?;
//! hostgate::server::run(cfg, table, gate).await
//! # }
//! ```
pub mod adapters;
pub mod config;
pub mod core;
pub mod net;
pub mod server;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::CertificateGate,
    config::{Mapping, RunConfig},
    core::{Backend, RoutingTable},
    utils::BufferPool,
};
