//! Operator HTTP surface: queue inspection and maintenance under `/api`,
//! Prometheus text at `/metrics`.

pub mod queue;
pub mod server;

pub use server::{build_router, ApiState};
