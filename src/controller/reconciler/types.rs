//! # Types
//!
//! Core types for the reconciler.

use crate::config::{ControllerConfig, FeatureFlags};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::rbac::{AggregateError, RbacError};
use crate::controller::secrets::SecretError;
use crate::controller::store::StoreError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// The tenant spec is contradictory; recorded as a `ValidationFailed` condition
    #[error("tenant validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Rbac(#[from] RbacError),

    #[error("tenant cleanup incomplete: {0}")]
    Cleanup(#[from] AggregateError),

    #[error("failed to serialize status: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Backoff state for a specific tenant
/// Tracks error count and backoff calculator for progressive retries
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, 10),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Shared context of every tenant reconcile
pub struct Reconciler<S> {
    pub store: Arc<S>,
    pub config: ControllerConfig,
    // Backoff state per tenant (namespace/name), owned by the error policy
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    // Fixed flags instead of the environment, for tests
    feature_flags: Option<FeatureFlags>,
}

impl<S> std::fmt::Debug for Reconciler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("feature_flags", &self.feature_flags)
            .finish_non_exhaustive()
    }
}

impl<S> Reconciler<S> {
    pub fn new(store: Arc<S>, config: ControllerConfig) -> Self {
        Self {
            store,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            feature_flags: None,
        }
    }

    #[must_use]
    pub fn with_feature_flags(mut self, flags: FeatureFlags) -> Self {
        self.feature_flags = Some(flags);
        self
    }

    /// Flags for one reconcile pass, re-read from the environment each time
    pub fn feature_flags(&self) -> FeatureFlags {
        self.feature_flags.unwrap_or_else(FeatureFlags::from_env)
    }

    /// Forget the failure history of a tenant after a successful reconcile
    pub fn reset_backoff(&self, key: &str) {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.remove(key);
    }
}
