//! Routing decisions: backend classification, request rewriting, dispatch.
pub mod backend;
pub mod director;
pub mod router;

pub use backend::{Backend, ResolveError};
pub use router::{RouteHandler, RoutingTable};
