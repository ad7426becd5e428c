//! API Module
//!
//! HTTP handlers and routing for the relay REST API. The transport layer is a
//! thin consumer of the cache, mapping and pool services; everything it
//! touches goes through [`AppState`].
//!
//! [`AppState`]: handlers::AppState

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;
