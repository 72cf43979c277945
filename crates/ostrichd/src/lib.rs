//! ostrich relay daemon: admission, persistence and fan-out for Nostr events.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
mod auth;
/// Retry delays for failed identity checks.
pub mod backoff;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay operations.
pub mod error;
/// External admission service client.
pub mod external;
pub mod fanout;
pub mod gates;
pub mod identity;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Pay-to-relay ledger.
pub mod payment;
pub mod queue;
/// Rate limiters for events and subscriptions.
pub mod ratelimit;
pub mod registry;
/// Accept loop and shared server state.
pub mod server;
pub mod signup;
pub mod storage;

pub use server::{run, run_with_shutdown, ServerState};
