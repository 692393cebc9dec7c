//! Intercepting HTTP/HTTPS proxy core: request-correlation RPC over a
//! message broker, a per-tenant persistence pipeline, and a worker-side
//! request executor. See `src/main.rs` for the CLI entry points.

pub mod broker;
pub mod codec;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod supervisor;
pub mod tls;
pub mod worker;
