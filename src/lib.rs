//! Tenant Controller Library
//!
//! This library provides the core functionality for the Tenant Controller:
//! namespace ownership tracking, the predicate/mapper layer on the watch
//! path, per-namespace RBAC and the generated secret lifecycle of each
//! tenant. Tests are included in the module files and under `tests/`.
//!
//! ## Quick Start
//!
//! ```rust
//! use tenant_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
