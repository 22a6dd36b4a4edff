//! Turns change notifications into per-source reconciles.
//!
//! At most one reconcile per ClusterSecret is in flight. A notification that
//! arrives while one is running marks the source pending, and the worker runs
//! once more with the latest snapshot when it finishes. Different sources
//! reconcile concurrently.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use k8s_openapi::{
    ByteString,
    api::core::v1::{Namespace, Secret},
};
use kube::{
    ResourceExt,
    runtime::reflector::{ObjectRef, Store},
};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{ClusterApi, FINALIZER},
    config::Config,
    crds::{ClusterSecret, Phase},
    error::{Error, Result},
    matcher::{NamespaceEntry, RuleSet},
    replica::{self, DesiredReplica},
    status::{Report, StatusReporter},
    sync::{SyncOutcome, Synchronizer},
    tracker::ReplicaTracker,
};

/// A change notification from the event runtime.
#[derive(Clone, Debug)]
pub enum Event {
    SourceApplied(ClusterSecret),
    SourceDeleted(ClusterSecret),
    NamespaceApplied(Namespace),
    NamespaceDeleted(Namespace),
    SecretApplied(Secret),
    SecretDeleted(Secret),
    Resync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileState {
    Idle,
    Reconciling,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl From<Phase> for ReconcileState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Pending => ReconcileState::Idle,
            Phase::Succeeded => ReconcileState::Succeeded,
            Phase::PartiallyFailed => ReconcileState::PartiallyFailed,
            Phase::Failed => ReconcileState::Failed,
        }
    }
}

/// How a sync attempt ended when it did not fully succeed.
#[derive(Debug)]
enum Attempt {
    Partial(SyncOutcome),
    Aborted(Error),
}

/// Source names with a worker running, and whether another run is pending.
#[derive(Debug, Default)]
struct WorkQueue {
    slots: Mutex<HashMap<String, bool>>,
}

impl WorkQueue {
    /// Returns true when the caller should start a worker.
    fn enqueue(&self, name: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(name) {
            Some(pending) => {
                *pending = true;
                false
            }
            None => {
                slots.insert(name.to_owned(), false);
                true
            }
        }
    }

    /// Returns true when the worker must run again.
    fn complete(&self, name: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(name) {
            Some(pending) if *pending => {
                *pending = false;
                true
            }
            _ => {
                slots.remove(name);
                false
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

pub struct Orchestrator<C> {
    cluster: Arc<C>,
    tracker: Arc<ReplicaTracker>,
    synchronizer: Synchronizer<C>,
    reporter: StatusReporter<C>,
    config: Config,
    namespaces: Store<Namespace>,
    sources: Store<ClusterSecret>,
    states: Mutex<HashMap<String, ReconcileState>>,
    queue: WorkQueue,
}

impl<C: ClusterApi> Orchestrator<C> {
    /// `namespaces` and `sources` are the reflector caches fed by the
    /// watchers. Every reconcile reads them, never an event payload.
    pub fn new(
        cluster: Arc<C>,
        config: Config,
        namespaces: Store<Namespace>,
        sources: Store<ClusterSecret>,
    ) -> Self {
        let tracker = Arc::new(ReplicaTracker::new());
        let synchronizer =
            Synchronizer::new(cluster.clone(), tracker.clone(), config.max_concurrent_writes);
        Self {
            synchronizer,
            reporter: StatusReporter::new(cluster.clone()),
            cluster,
            tracker,
            config,
            namespaces,
            sources,
            states: Mutex::default(),
            queue: WorkQueue::default(),
        }
    }

    pub fn tracker(&self) -> &ReplicaTracker {
        &self.tracker
    }

    pub fn state(&self, name: &str) -> ReconcileState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(ReconcileState::Idle)
    }

    fn set_state(&self, name: &str, state: ReconcileState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), state);
    }

    /// Rebuilds the tracker from the replicas already on the cluster and
    /// removes replicas whose source is gone. The stores must be ready.
    pub async fn bootstrap(&self) -> Result<()> {
        let known: BTreeSet<String> = self.sources.state().iter().map(|s| s.name_any()).collect();

        let replicas = self.cluster.list_replicas(None).await?;
        let orphans = self.tracker.rebuild(&replicas, &known);
        info!(
            namespaces = self.namespaces.state().len(),
            sources = known.len(),
            replicas = replicas.len() - orphans.len(),
            "bootstrapped"
        );

        for orphan in orphans {
            let (Some(ns), name) = (orphan.namespace(), orphan.name_any()) else {
                continue;
            };
            let owner = replica::owner_of(&orphan);
            warn!(namespace = %ns, name = %name, owner = ?owner, "deleting orphaned replica");
            if let Err(e) = self
                .cluster
                .delete_secret(&ns, &name, orphan.uid(), orphan.resource_version())
                .await
            {
                error!(
                    namespace = %ns,
                    name = %name,
                    error = %e,
                    "failed to delete orphaned replica"
                );
            }
        }

        Ok(())
    }

    /// Consumes events until the channel closes, resyncing every source on
    /// the configured interval. The first resync fires immediately.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        let mut resync = tokio::time::interval(self.config.resync_interval());
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = resync.tick() => self.handle(Event::Resync),
            }
        }
        info!("event channel closed, stopping");
    }

    pub fn handle(self: &Arc<Self>, event: Event) {
        match event {
            Event::SourceApplied(source) => self.source_applied(source),
            Event::SourceDeleted(source) => {
                let name = source.name_any();
                info!(source = %name, "ClusterSecret deleted");
                self.schedule(&name);
            }
            Event::NamespaceApplied(ns) => self.namespace_applied(NamespaceEntry::from(&ns)),
            Event::NamespaceDeleted(ns) => {
                let name = ns.name_any();
                for source in self.tracker.sources_in(&name) {
                    debug!(source = %source, namespace = %name, "namespace deleted");
                    self.schedule(&source);
                }
            }
            Event::SecretApplied(secret) => self.secret_changed(&secret, false),
            Event::SecretDeleted(secret) => self.secret_changed(&secret, true),
            Event::Resync => {
                debug!("resync");
                self.schedule_all();
            }
        }
    }

    fn source_applied(self: &Arc<Self>, source: ClusterSecret) {
        let name = source.name_any();

        // Status writes and other metadata-only updates need no work.
        let settled = source.metadata.deletion_timestamp.is_none()
            && source.finalizers().iter().any(|f| f == FINALIZER)
            && source.metadata.generation.is_some()
            && source.status.as_ref().and_then(|s| s.observed_generation)
                == source.metadata.generation;
        if settled {
            return;
        }

        info!(source = %name, "ClusterSecret created or updated");
        self.schedule(&name);
    }

    /// Schedules the sources whose replica set changes with `entry`.
    fn namespace_applied(self: &Arc<Self>, entry: NamespaceEntry) {
        let holding: BTreeSet<String> = self.tracker.sources_in(&entry.name).into_iter().collect();
        let selecting: BTreeSet<String> = self
            .live_sources()
            .into_iter()
            .filter(|s| {
                RuleSet::compile(&s.spec.match_namespaces, &s.spec.avoid_namespaces)
                    .is_ok_and(|rules| rules.selects(&entry))
            })
            .map(|s| s.name_any())
            .collect();

        for source in holding.symmetric_difference(&selecting) {
            debug!(source = %source, namespace = %entry.name, "namespace changed");
            self.schedule(&source);
        }
    }

    fn secret_changed(self: &Arc<Self>, secret: &Secret, deleted: bool) {
        if replica::is_noise(secret) {
            return;
        }
        let (Some(ns), name) = (secret.namespace(), secret.name_any()) else {
            return;
        };

        if replica::is_managed(secret) {
            if let Some(owner) = replica::owner_of(secret) {
                let recorded = self.tracker.get(owner).remove(&ns);
                let tampered = !deleted
                    && recorded.is_some_and(|r| {
                        replica::hash_of(secret) != Some(r.content_hash.as_str())
                            || replica::content_hash(
                                secret.type_.as_deref().unwrap_or_default(),
                                &secret.data.clone().unwrap_or_default(),
                            ) != r.content_hash
                    });
                if deleted || tampered {
                    debug!(
                        source = %owner,
                        namespace = %ns,
                        deleted,
                        "replica changed outside the controller"
                    );
                    self.schedule(owner);
                }
            }
        }

        for source in self.live_sources() {
            let Some(vf) = &source.spec.value_from else {
                continue;
            };
            if vf.secret_key_ref.name != name || vf.secret_key_ref.namespace != ns {
                continue;
            }
            let secret = format!("{ns}/{name}");
            if deleted {
                warn!(
                    source = %source.name_any(),
                    secret = %secret,
                    "source secret deleted, replicas are now stale"
                );
            } else {
                info!(source = %source.name_any(), secret = %secret, "source secret changed");
            }
            self.schedule(&source.name_any());
        }
    }

    fn live_sources(&self) -> Vec<Arc<ClusterSecret>> {
        self.sources
            .state()
            .into_iter()
            .filter(|s| s.metadata.deletion_timestamp.is_none())
            .collect()
    }

    fn schedule_all(self: &Arc<Self>) {
        let mut names: BTreeSet<String> =
            self.sources.state().iter().map(|s| s.name_any()).collect();
        // Anything still holding replicas gets a chance to clean up.
        names.extend(self.tracker.sources());
        for name in names {
            self.schedule(&name);
        }
    }

    pub fn schedule(self: &Arc<Self>, name: &str) {
        if !self.queue.enqueue(name) {
            debug!(source = %name, "reconcile already in flight, coalescing");
            return;
        }

        let this = Arc::clone(self);
        let name = name.to_owned();
        tokio::spawn(async move {
            loop {
                this.reconcile(&name).await;
                if !this.queue.complete(&name) {
                    break;
                }
            }
        });
    }

    /// Runs one reconcile of `name` against the current snapshot.
    pub async fn reconcile(&self, name: &str) -> ReconcileState {
        self.set_state(name, ReconcileState::Reconciling);

        let source = self
            .sources
            .get(&ObjectRef::new(name))
            .map(|s| ClusterSecret::clone(&s));

        let state = match source {
            Some(source) if source.metadata.deletion_timestamp.is_none() => {
                self.apply(source).await
            }
            source => self.teardown(name, source).await,
        };

        self.set_state(name, state);
        state
    }

    async fn apply(&self, mut source: ClusterSecret) -> ReconcileState {
        let name = source.name_any();

        if !source.finalizers().iter().any(|f| f == FINALIZER) {
            match self.cluster.add_finalizer(&source).await {
                Ok(updated) => source = updated,
                Err(e) => warn!(source = %name, error = %e, "failed to add finalizer"),
            }
        }

        let catalog: Vec<NamespaceEntry> = self
            .namespaces
            .state()
            .iter()
            .map(|ns| NamespaceEntry::from(ns.as_ref()))
            .collect();
        let plan = RuleSet::compile(&source.spec.match_namespaces, &source.spec.avoid_namespaces)
            .map(|rules| rules.resolve(&catalog, &self.config.controller_namespace));
        let targets = match plan {
            Ok(targets) => targets,
            Err(e) => {
                error!(source = %name, error = %e, "invalid ClusterSecret, not retrying");
                return self.fail(&source, e).await;
            }
        };

        let data = match self.payload(&source).await {
            Ok(data) => data,
            Err(e) => {
                error!(source = %name, error = %e, "cannot resolve payload");
                return self.fail(&source, e).await;
            }
        };

        let desired = DesiredReplica::new(&source, data);
        debug!(source = %name, targets = ?targets, "syncing");

        let (phase, report_outcome, report_error) =
            match self.sync_with_retry(&desired, &targets).await {
                Ok(outcome) | Err(Attempt::Partial(outcome)) => {
                    (Phase::of(&outcome), Some(outcome), None)
                }
                Err(Attempt::Aborted(e)) => (Phase::Failed, None, Some(e)),
            };

        if let Some(outcome) = &report_outcome {
            info!(
                source = %name,
                synced = outcome.synced.len(),
                failed = outcome.failed.len(),
                writes = outcome.writes(),
                "reconciled"
            );
        }
        if let Some(e) = &report_error {
            error!(source = %name, error = %e, "reconcile failed, retrying on next resync");
        }

        let report = Report {
            phase,
            outcome: report_outcome.as_ref(),
            error: report_error.as_ref(),
        };
        self.reporter.report(&source, report).await;

        phase.into()
    }

    async fn fail(&self, source: &ClusterSecret, e: Error) -> ReconcileState {
        let report = Report {
            phase: Phase::Failed,
            outcome: None,
            error: Some(&e),
        };
        self.reporter.report(source, report).await;
        ReconcileState::Failed
    }

    /// Removes every replica of `name`, then releases the finalizer.
    async fn teardown(&self, name: &str, source: Option<ClusterSecret>) -> ReconcileState {
        if source.is_none() && self.tracker.get(name).is_empty() {
            return ReconcileState::Succeeded;
        }

        let desired = DesiredReplica::teardown(name);
        let outcome = match self.sync_with_retry(&desired, &BTreeSet::new()).await {
            Ok(outcome) => outcome,
            Err(Attempt::Partial(outcome)) => {
                let failed = outcome.failed.len();
                error!(source = %name, failed, "teardown incomplete, retrying on next resync");
                return ReconcileState::Failed;
            }
            Err(Attempt::Aborted(e)) => {
                error!(source = %name, error = %e, "teardown failed, retrying on next resync");
                return ReconcileState::Failed;
            }
        };
        if !outcome.failed.is_empty() {
            let failed = outcome.failed.len();
            error!(source = %name, failed, "teardown incomplete, retrying on next resync");
            return ReconcileState::Failed;
        }

        self.tracker.remove_all(name);
        if let Some(source) = source.filter(|s| s.finalizers().iter().any(|f| f == FINALIZER)) {
            if let Err(e) = self.cluster.remove_finalizer(&source).await {
                error!(source = %name, error = %e, "failed to release finalizer");
                return ReconcileState::Failed;
            }
        }

        info!(source = %name, deleted = outcome.deleted.len(), "replicas torn down");
        ReconcileState::Succeeded
    }

    async fn payload(&self, source: &ClusterSecret) -> Result<BTreeMap<String, ByteString>> {
        match (&source.spec.data, &source.spec.value_from) {
            (Some(_), Some(_)) => Err(Error::InvalidSpec(
                "data and valueFrom are mutually exclusive".to_owned(),
            )),
            (Some(data), None) => Ok(data.clone()),
            (None, None) => Ok(BTreeMap::new()),
            (None, Some(vf)) => {
                let r = &vf.secret_key_ref;
                let unavailable = || Error::SourceUnavailable {
                    namespace: r.namespace.clone(),
                    name: r.name.clone(),
                };
                let secret = self
                    .cluster
                    .get_secret(&r.namespace, &r.name)
                    .await?
                    .ok_or_else(unavailable)?;
                let mut data = secret.data.unwrap_or_default();
                if r.keys.is_empty() {
                    return Ok(data);
                }
                r.keys
                    .iter()
                    .map(|k| {
                        data.remove_entry(k).ok_or_else(|| {
                            Error::NotFound(format!(
                                "key '{k}' in secret '{}/{}'",
                                r.namespace, r.name
                            ))
                        })
                    })
                    .collect()
            }
        }
    }

    async fn sync_with_retry(
        &self,
        desired: &DesiredReplica,
        targets: &BTreeSet<String>,
    ) -> std::result::Result<SyncOutcome, Attempt> {
        let synchronizer = &self.synchronizer;
        Retry::spawn(self.config.retry_strategy(), move || async move {
            match synchronizer.sync(desired, targets).await {
                Ok(outcome) if outcome.has_transient_failures() => {
                    let failed = outcome.failed.len();
                    debug!(source = %desired.source, failed, "transient failures, backing off");
                    Err(RetryError::transient(Attempt::Partial(outcome)))
                }
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_transient() => Err(RetryError::transient(Attempt::Aborted(e))),
                Err(e) => Err(RetryError::permanent(Attempt::Aborted(e))),
            }
        })
        .await
    }
}
