//! # Configuration
//!
//! Environment-driven configuration for the controller.
//!
//! - `controller.rs` - Reconciliation, watch and retry settings
//! - `server.rs` - Metrics/probe server settings
//! - `flags.rs` - Feature flags re-read on every reconcile

mod controller;
mod flags;
mod server;

pub use controller::ControllerConfig;
pub use flags::{FeatureFlags, FLAG_NAMESPACE_MANAGEMENT};
pub use server::ServerConfig;
