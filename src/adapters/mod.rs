//! Outward-facing integrations: backend transports, static files, ACME.
pub mod acme;
pub mod static_files;
pub mod upstream;

pub use acme::CertificateGate;
pub use static_files::{StaticDir, WellKnownDoc};
pub use upstream::{DialTarget, HttpUpstream, HttpsClient, SocketUpstream};
