//! Fan-out HTTP gateway for a content-routing indexer federation.
//!
//! This crate provides the request pipeline:
//! - Backend registry with per-backend circuit breakers
//! - Scatter/gather fan-out with per-target deadlines and cancellation
//! - JSON and NDJSON find aggregators
//! - Provider cache and top-provider accounting
//! - Delegated-routing and reframe protocol adapters

pub mod accept;
pub mod backend;
pub mod breaker;
pub mod delegated;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod pcache;
pub mod pcount;
pub mod reframe;
pub mod routes;
pub mod scatter;
pub mod state;

pub use backend::{Backend, BackendKind, Matcher, RequestClass, load_backends};
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
