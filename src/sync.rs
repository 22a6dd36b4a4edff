//! Applies the create/update/delete operations that bring one source's
//! replicas in line with its target namespaces.
//!
//! Every namespace is handled on its own: a failure in one is recorded in the
//! outcome and never stops the others. The tracker is only touched after the
//! API has accepted a write, and is fed from what the API returned.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use futures::{StreamExt, stream};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::ClusterApi,
    error::{Error, Result},
    replica::{DesiredReplica, owner_of},
    tracker::{ReplicaRecord, ReplicaTracker},
};

#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Namespaces confirmed to hold an up-to-date replica.
    pub synced: BTreeSet<String>,
    pub created: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    /// Replicas that were due for deletion but were missing or not ours.
    pub skipped: BTreeSet<String>,
    pub failed: BTreeMap<String, Error>,
}

impl SyncOutcome {
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn has_transient_failures(&self) -> bool {
        self.failed.values().any(Error::is_transient)
    }

    fn record(&mut self, namespace: String, result: Result<Change>) {
        match result {
            Ok(Change::Created) => {
                self.created.insert(namespace.clone());
                self.synced.insert(namespace);
            }
            Ok(Change::Updated) => {
                self.updated.insert(namespace.clone());
                self.synced.insert(namespace);
            }
            Ok(Change::Unchanged) => {
                self.synced.insert(namespace);
            }
            Ok(Change::Deleted) => {
                self.deleted.insert(namespace);
            }
            Ok(Change::Skipped) => {
                self.skipped.insert(namespace);
            }
            Err(e) => {
                self.failed.insert(namespace, e);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Change {
    Created,
    Updated,
    Unchanged,
    Deleted,
    Skipped,
}

#[derive(Debug)]
enum Op {
    /// Target without a tracked replica. Carries a live replica of ours if one exists.
    Create(String, Option<Secret>),
    Check(String, Option<Secret>, ReplicaRecord),
    Delete(String, Option<Secret>),
}

impl Op {
    fn namespace(&self) -> &str {
        match self {
            Op::Create(ns, _) | Op::Check(ns, _, _) | Op::Delete(ns, _) => ns,
        }
    }
}

pub struct Synchronizer<C> {
    cluster: Arc<C>,
    tracker: Arc<ReplicaTracker>,
    max_concurrent: usize,
}

impl<C: ClusterApi> Synchronizer<C> {
    pub fn new(cluster: Arc<C>, tracker: Arc<ReplicaTracker>, max_concurrent: usize) -> Self {
        Self {
            cluster,
            tracker,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Fails as a whole only when the source's live replicas can't be listed.
    pub async fn sync(
        &self,
        desired: &DesiredReplica,
        targets: &BTreeSet<String>,
    ) -> Result<SyncOutcome> {
        let existing = self.tracker.get(&desired.source);
        let mut live: BTreeMap<String, Secret> = self
            .cluster
            .list_replicas(Some(&desired.source))
            .await?
            .into_iter()
            .filter(|s| s.name_any() == desired.source)
            .filter_map(|s| Some((s.namespace()?, s)))
            .collect();

        let mut ops = Vec::new();
        for ns in targets {
            match existing.get(ns) {
                Some(record) => ops.push(Op::Check(ns.clone(), live.remove(ns), record.clone())),
                None => ops.push(Op::Create(ns.clone(), live.remove(ns))),
            }
        }
        for ns in existing.keys().filter(|ns| !targets.contains(*ns)) {
            ops.push(Op::Delete(ns.clone(), live.remove(ns)));
        }
        // Ours on the cluster but unknown to the tracker.
        ops.extend(live.into_iter().map(|(ns, s)| Op::Delete(ns, Some(s))));

        let results: Vec<(String, Result<Change>)> = stream::iter(ops)
            .map(|op| async move {
                let ns = op.namespace().to_owned();
                let result = self.apply(desired, op).await;
                if let Err(e) = &result {
                    error!(
                        source = %desired.source,
                        namespace = %ns,
                        error = %e,
                        "replica operation failed"
                    );
                }
                (ns, result)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut outcome = SyncOutcome::default();
        for (ns, result) in results {
            outcome.record(ns, result);
        }
        Ok(outcome)
    }

    async fn apply(&self, desired: &DesiredReplica, op: Op) -> Result<Change> {
        match op {
            Op::Create(ns, None) => self.create(desired, &ns).await,
            Op::Check(ns, None, _) => {
                // The record no longer describes anything on the cluster.
                self.tracker.remove(&desired.source, &ns);
                self.create(desired, &ns).await
            }
            Op::Create(ns, Some(live)) => {
                self.update_if_drifted(desired, &ns, live, None).await
            }
            Op::Check(ns, Some(live), record) => {
                self.update_if_drifted(desired, &ns, live, Some(record)).await
            }
            Op::Delete(ns, live) => self.delete(desired, &ns, live).await,
        }
    }

    async fn create(&self, desired: &DesiredReplica, ns: &str) -> Result<Change> {
        match self.cluster.create_secret(&desired.to_secret(ns)).await {
            Ok(created) => {
                self.observe(desired, ns, &created);
                info!(source = %desired.source, namespace = %ns, "created replica");
                Ok(Change::Created)
            }
            Err(Error::AlreadyExists(_)) => {
                // Another writer got there first. Only adopt it if it is ours.
                let Some(live) = self.cluster.get_secret(ns, &desired.source).await? else {
                    return Err(Error::Transient(format!(
                        "secret '{ns}/{}' vanished after create conflict",
                        desired.source
                    )));
                };
                if owner_of(&live) != Some(desired.source.as_str()) {
                    warn!(
                        source = %desired.source,
                        namespace = %ns,
                        owner = ?owner_of(&live),
                        "refusing to overwrite secret owned by someone else"
                    );
                    return Err(Error::OwnershipConflict {
                        namespace: ns.to_owned(),
                        name: desired.source.clone(),
                        owner: owner_of(&live).map(str::to_owned),
                    });
                }
                self.update_if_drifted(desired, ns, live, None).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update_if_drifted(
        &self,
        desired: &DesiredReplica,
        ns: &str,
        live: Secret,
        record: Option<ReplicaRecord>,
    ) -> Result<Change> {
        let stale_record = record.as_ref().is_none_or(|r| r.content_hash != desired.hash);
        if !stale_record && !desired.drifted(&live) {
            debug!(source = %desired.source, namespace = %ns, "replica up to date");
            return Ok(Change::Unchanged);
        }
        if !desired.drifted(&live) {
            // Live object is already right, only our record was missing or old.
            self.observe(desired, ns, &live);
            return Ok(Change::Unchanged);
        }

        if live.type_.as_deref() != Some(desired.type_.as_str()) {
            return self.recreate(desired, ns, live).await;
        }

        let mut secret = desired.to_secret(ns);
        secret.metadata.resource_version = live.resource_version();
        let updated = self.cluster.replace_secret(&secret).await?;
        self.observe(desired, ns, &updated);
        info!(source = %desired.source, namespace = %ns, "updated replica");
        Ok(Change::Updated)
    }

    /// A Secret's type is immutable, so a type change means delete and create.
    async fn recreate(&self, desired: &DesiredReplica, ns: &str, live: Secret) -> Result<Change> {
        self.cluster
            .delete_secret(ns, &desired.source, live.uid(), live.resource_version())
            .await?;
        self.tracker.remove(&desired.source, ns);

        let created = self.cluster.create_secret(&desired.to_secret(ns)).await?;
        self.observe(desired, ns, &created);
        info!(
            source = %desired.source,
            namespace = %ns,
            from = ?live.type_,
            to = %desired.type_,
            "recreated replica with new type"
        );
        Ok(Change::Updated)
    }

    async fn delete(
        &self,
        desired: &DesiredReplica,
        ns: &str,
        live: Option<Secret>,
    ) -> Result<Change> {
        let Some(live) = live else {
            warn!(
                source = %desired.source,
                namespace = %ns,
                "replica missing or no longer carries our owner marker, treating as reclaimed"
            );
            self.tracker.remove(&desired.source, ns);
            return Ok(Change::Skipped);
        };

        self.cluster
            .delete_secret(ns, &desired.source, live.uid(), live.resource_version())
            .await?;
        self.tracker.remove(&desired.source, ns);
        info!(source = %desired.source, namespace = %ns, "deleted replica");
        Ok(Change::Deleted)
    }

    fn observe(&self, desired: &DesiredReplica, ns: &str, applied: &Secret) {
        match ReplicaRecord::observed(applied) {
            Some(record) => self.tracker.put(&desired.source, ns, record),
            None => {
                warn!(source = %desired.source, namespace = %ns, "applied replica lacks markers")
            }
        }
    }
}
