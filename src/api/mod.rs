//! HTTP API for the task router.
//!
//! ## Endpoints
//!
//! - `POST /tasks` - Queue a prompt (202, processed asynchronously)
//! - `GET /tasks/{id}` - Active or finalized task record
//! - `GET /tasks` - In-flight tasks
//! - `GET /metrics` - Request counters, engine status and queue depth
//! - `GET /agents` - Registered agent roles
//! - `GET /engines` - Engine table with availability and routing rules
//! - `GET /health` - Health check

mod routes;
pub mod types;

pub use routes::{build_state, router, serve, AppState};
pub use types::*;
