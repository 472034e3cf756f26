//! # Controller
//!
//! Core controller modules for the Tenant Controller.
//!
//! - `selector`: Label selector DSL shared by every list and delete
//! - `store`: CRUD over Kubernetes objects, API-backed and in-memory
//! - `tracker`: Namespace ownership transitions between predicates and mapper
//! - `predicates`, `events`, `mapper`: Watch delivery path for namespaces and tenants
//! - `rbac`: Roles and role bindings in managed namespaces
//! - `pki`, `secrets`: Certificate authority, TLS and the other generated secrets
//! - `namespace_management`: Labelling namespaces on request
//! - `reconciler`: Core reconciliation logic
//! - `retry`, `backoff`: Conflict retry and error backoff
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod events;
pub mod mapper;
pub mod namespace_management;
pub mod pki;
pub mod predicates;
pub mod rbac;
pub mod reconciler;
pub mod retry;
pub mod secrets;
pub mod selector;
pub mod server;
pub mod store;
pub mod tracker;
