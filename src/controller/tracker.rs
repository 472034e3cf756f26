//! # Namespace Ownership Tracker
//!
//! Bookkeeping of namespaces whose RBAC must be removed or migrated.
//!
//! Predicates run when a watch event is delivered and record the management
//! label transitions they see; the mapper runs right after and consumes them.
//! The two phases share no call chain, so the transitions are parked here,
//! keyed by namespace name, behind a mutex of their own. Nothing is
//! persisted: after a restart the next label change (or requeue) derives the
//! same transition again.

use crate::controller::rbac::RbacType;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// One pending RBAC transition for a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedNsOpts {
    /// RBAC type whose management label changed
    pub resource_deletion_label_value: RbacType,
    /// Namespace of the tenant that owned the label before, empty if none
    pub prev_managing_ns: String,
    /// Namespace of the tenant that owns the label now, empty when released
    pub new_managing_ns: String,
}

impl ManagedNsOpts {
    pub fn new(rbac_type: RbacType, prev: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            resource_deletion_label_value: rbac_type,
            prev_managing_ns: prev.into(),
            new_managing_ns: new.into(),
        }
    }
}

/// Process-wide map of namespace name to pending transitions.
///
/// The map is allocated lazily by [`OwnershipTracker::initialize`]; until
/// then every read sees nothing and every write is dropped with a warning.
#[derive(Debug, Default)]
pub struct OwnershipTracker {
    scheduled: Mutex<Option<HashMap<String, Vec<ManagedNsOpts>>>>,
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<String, Vec<ManagedNsOpts>>>> {
        // A panic while holding the lock leaves a consistent map behind; keep using it.
        self.scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Allocate the map. No-op when already allocated.
    pub fn initialize(&self) {
        let mut scheduled = self.lock();
        if scheduled.is_none() {
            debug!("tracker.initialize");
            *scheduled = Some(HashMap::new());
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Append a transition for `namespace`
    pub fn record(&self, namespace: &str, opts: ManagedNsOpts) {
        let mut scheduled = self.lock();
        let Some(map) = scheduled.as_mut() else {
            warn!(
                namespace = namespace,
                "tracker.record called before initialize, dropping transition"
            );
            return;
        };
        debug!(
            namespace = namespace,
            rbac_type = opts.resource_deletion_label_value.as_str(),
            prev = opts.prev_managing_ns.as_str(),
            new = opts.new_managing_ns.as_str(),
            "tracker.record"
        );
        map.entry(namespace.to_string()).or_default().push(opts);
    }

    /// Copy of the pending transitions for `namespace`
    pub fn pending(&self, namespace: &str) -> Vec<ManagedNsOpts> {
        self.lock()
            .as_ref()
            .and_then(|map| map.get(namespace).cloned())
            .unwrap_or_default()
    }

    /// Take the pending transitions for `namespace`, leaving none behind
    pub fn drain(&self, namespace: &str) -> Vec<ManagedNsOpts> {
        self.lock()
            .as_mut()
            .and_then(|map| map.remove(namespace))
            .unwrap_or_default()
    }

    /// Put transitions whose mapping failed back in front of anything
    /// recorded for `namespace` since they were drained
    pub fn restore(&self, namespace: &str, mut opts: Vec<ManagedNsOpts>) {
        if opts.is_empty() {
            return;
        }
        let mut scheduled = self.lock();
        let Some(map) = scheduled.as_mut() else {
            warn!(
                namespace = namespace,
                "tracker.restore called before initialize, dropping transitions"
            );
            return;
        };
        let entry = map.entry(namespace.to_string()).or_default();
        opts.append(entry);
        *entry = opts;
    }

    /// Names of all namespaces with pending transitions, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .as_ref()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Forget everything pending for `namespace`
    pub fn clear(&self, namespace: &str) {
        if let Some(map) = self.lock().as_mut() {
            map.remove(namespace);
        }
    }

    /// Number of namespaces with pending transitions
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_before_initialize_is_dropped() {
        let tracker = OwnershipTracker::new();
        tracker.record(
            "ns2",
            ManagedNsOpts::new(RbacType::ResourceManagement, "ns1", ""),
        );
        assert!(!tracker.is_initialized());
        assert!(tracker.pending("ns2").is_empty());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let tracker = OwnershipTracker::new();
        tracker.initialize();
        tracker.record(
            "ns2",
            ManagedNsOpts::new(RbacType::ResourceManagement, "ns1", "ns3"),
        );
        tracker.initialize();
        assert_eq!(
            tracker.pending("ns2").len(),
            1,
            "second initialize must not wipe pending entries"
        );
    }

    #[test]
    fn test_entries_are_isolated_per_namespace() {
        let tracker = OwnershipTracker::new();
        tracker.initialize();
        tracker.record(
            "ns2",
            ManagedNsOpts::new(RbacType::ResourceManagement, "ns1", ""),
        );
        tracker.record("ns4", ManagedNsOpts::new(RbacType::AppManagement, "", "ns1"));

        assert_eq!(tracker.drain("ns2").len(), 1);
        assert!(tracker.pending("ns2").is_empty());
        assert_eq!(tracker.pending("ns4").len(), 1);

        tracker.clear("ns4");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_restore_keeps_failed_transitions_first() {
        let tracker = OwnershipTracker::new();
        tracker.initialize();
        let failed = ManagedNsOpts::new(RbacType::ResourceManagement, "ns1", "ns3");
        tracker.record("ns2", failed.clone());
        let drained = tracker.drain("ns2");

        let later = ManagedNsOpts::new(RbacType::ResourceManagement, "ns3", "ns4");
        tracker.record("ns2", later.clone());
        tracker.restore("ns2", drained);

        assert_eq!(tracker.pending("ns2"), vec![failed, later]);
        assert_eq!(tracker.namespaces(), vec!["ns2".to_string()]);

        tracker.restore("ns5", Vec::new());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_pending_returns_a_copy() {
        let tracker = OwnershipTracker::new();
        tracker.initialize();
        tracker.record(
            "ns2",
            ManagedNsOpts::new(RbacType::AppsetManagement, "ns1", ""),
        );
        let mut copy = tracker.pending("ns2");
        copy.clear();
        assert_eq!(tracker.pending("ns2").len(), 1);
    }

    #[test]
    fn test_concurrent_records() {
        let tracker = Arc::new(OwnershipTracker::new());
        tracker.initialize();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.record(
                            &format!("ns-{}", i % 2),
                            ManagedNsOpts::new(RbacType::ResourceManagement, "a", "b"),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.pending("ns-0").len(), 200);
        assert_eq!(tracker.pending("ns-1").len(), 200);
    }
}
