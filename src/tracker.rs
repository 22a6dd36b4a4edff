//! In-memory index of which namespaces hold a managed replica for each source.
//!
//! The tracker is a cache, not a source of truth. It is rebuilt at startup from
//! the replicas found in the cluster and only changes after the API confirms a
//! write.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

use crate::replica::{hash_of, owner_of};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaRecord {
    pub content_hash: String,
    pub last_applied_at: DateTime<Utc>,
    pub owner: String,
}

impl ReplicaRecord {
    /// Record what the API reports for a replica it just accepted.
    pub fn observed(secret: &Secret) -> Option<Self> {
        Some(Self {
            content_hash: hash_of(secret)?.to_owned(),
            last_applied_at: Utc::now(),
            owner: owner_of(secret)?.to_owned(),
        })
    }
}

type Index = BTreeMap<String, BTreeMap<String, ReplicaRecord>>;

#[derive(Debug, Default)]
pub struct ReplicaTracker {
    index: RwLock<Index>,
}

impl ReplicaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every replica bearing an owner marker. Replicas of sources that
    /// are not in `known_sources` are returned as orphans and not indexed,
    /// whether or not they still carry a content hash.
    pub fn rebuild(&self, replicas: &[Secret], known_sources: &BTreeSet<String>) -> Vec<Secret> {
        let mut index = Index::new();
        let mut orphans = Vec::new();

        for secret in replicas {
            let (Some(ns), Some(owner)) = (secret.namespace(), owner_of(secret)) else {
                continue;
            };
            if !known_sources.contains(owner) {
                orphans.push(secret.clone());
                continue;
            }
            // Without a hash the next sync adopts and rewrites it.
            let Some(record) = ReplicaRecord::observed(secret) else {
                continue;
            };
            debug!(source = %record.owner, namespace = %ns, "rediscovered replica");
            index.entry(record.owner.clone()).or_default().insert(ns, record);
        }

        *self.write() = index;
        orphans
    }

    pub fn get(&self, source: &str) -> BTreeMap<String, ReplicaRecord> {
        self.read().get(source).cloned().unwrap_or_default()
    }

    pub fn put(&self, source: &str, namespace: &str, record: ReplicaRecord) {
        self.write()
            .entry(source.to_owned())
            .or_default()
            .insert(namespace.to_owned(), record);
    }

    pub fn remove(&self, source: &str, namespace: &str) -> Option<ReplicaRecord> {
        let mut index = self.write();
        let records = index.get_mut(source)?;
        let removed = records.remove(namespace);
        if records.is_empty() {
            index.remove(source);
        }
        removed
    }

    pub fn remove_all(&self, source: &str) -> BTreeMap<String, ReplicaRecord> {
        self.write().remove(source).unwrap_or_default()
    }

    pub fn sources(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Sources holding a record in `namespace`.
    pub fn sources_in(&self, namespace: &str) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, records)| records.contains_key(namespace))
            .map(|(source, _)| source.clone())
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::replica::DesiredReplica;

    fn record(owner: &str, hash: &str) -> ReplicaRecord {
        ReplicaRecord {
            content_hash: hash.to_owned(),
            last_applied_at: Utc::now(),
            owner: owner.to_owned(),
        }
    }

    #[test]
    fn put_get_remove() {
        let tracker = ReplicaTracker::new();
        tracker.put("s1", "a", record("s1", "h1"));
        tracker.put("s1", "b", record("s1", "h1"));
        tracker.put("s2", "a", record("s2", "h2"));

        assert_eq!(tracker.get("s1").len(), 2);
        assert_eq!(tracker.sources_in("a"), vec!["s1".to_owned(), "s2".to_owned()]);

        assert!(tracker.remove("s1", "a").is_some());
        assert!(tracker.remove("s1", "a").is_none());
        assert_eq!(tracker.sources_in("a"), vec!["s2".to_owned()]);

        assert_eq!(tracker.remove_all("s1").len(), 1);
        assert!(tracker.get("s1").is_empty());
    }

    #[test]
    fn rebuild_indexes_known_sources_and_returns_orphans() {
        let replica = |source: &str, ns: &str| {
            let mut d = DesiredReplica::teardown(source);
            d.hash = format!("hash-{source}");
            d.to_secret(ns)
        };
        let replicas = vec![replica("s1", "a"), replica("s1", "b"), replica("gone", "a")];
        let known = BTreeSet::from(["s1".to_owned()]);

        let tracker = ReplicaTracker::new();
        tracker.put("stale", "x", record("stale", "h"));
        let orphans = tracker.rebuild(&replicas, &known);

        assert_eq!(orphans.len(), 1);
        assert_eq!(owner_of(&orphans[0]), Some("gone"));
        let s1: BTreeMap<_, _> = tracker.get("s1");
        assert_eq!(s1.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(s1["a"].content_hash, "hash-s1");
        assert!(tracker.get("stale").is_empty());
    }

    #[test]
    fn rebuild_reports_orphans_without_a_hash() {
        let mut stripped = DesiredReplica::teardown("gone").to_secret("a");
        stripped.metadata.annotations = None;
        let mut unhashed = DesiredReplica::teardown("s1").to_secret("b");
        unhashed.metadata.annotations = None;
        let known = BTreeSet::from(["s1".to_owned()]);

        let tracker = ReplicaTracker::new();
        let orphans = tracker.rebuild(&[stripped, unhashed], &known);

        assert_eq!(orphans.len(), 1);
        assert_eq!(owner_of(&orphans[0]), Some("gone"));
        assert!(tracker.get("s1").is_empty());
    }
}
