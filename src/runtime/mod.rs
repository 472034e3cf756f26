//! # Runtime
//!
//! Process bootstrap and the long-running watch loops.
//!
//! - `initialization.rs` - rustls, logging, metrics, HTTP server, client and reconciler setup
//! - `watch_loop.rs` - Tenant controller and namespace watch
//! - `error_policy.rs` - Reconcile error backoff and watch error classification

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
