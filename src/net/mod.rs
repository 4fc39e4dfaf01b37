//! Raw-socket decorators applied at the TLS listener boundary.
pub mod idle;
pub mod keepalive;

pub use idle::IdleTimeout;
pub use keepalive::KeepAliveListener;
