//! Publishes the outcome of a reconcile on the ClusterSecret status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::{
    cluster::ClusterApi,
    crds::{ClusterSecret, ClusterSecretStatus, Condition, NamespaceFailure, Phase},
    error::Error,
    sync::SyncOutcome,
};

pub const READY_CONDITION: &str = "Ready";

impl Phase {
    pub fn of(outcome: &SyncOutcome) -> Self {
        match (outcome.synced.is_empty(), outcome.failed.is_empty()) {
            (_, true) => Phase::Succeeded,
            (false, false) => Phase::PartiallyFailed,
            (true, false) => Phase::Failed,
        }
    }
}

/// What a reconcile ended with. `error` aborted the cycle before or during sync.
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    pub phase: Phase,
    pub outcome: Option<&'a SyncOutcome>,
    pub error: Option<&'a Error>,
}

pub fn build_status(
    source: &ClusterSecret,
    report: Report<'_>,
    now: DateTime<Utc>,
) -> ClusterSecretStatus {
    let previous = source.status.as_ref();

    // Never move lastSyncTime backwards, even if the clock does.
    let now = previous
        .and_then(|s| s.last_sync_time.as_deref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .map_or(now, |prev| prev.max(now));

    let (synced_namespaces, failed_namespaces) = match report.outcome {
        Some(outcome) => (
            outcome.synced.iter().cloned().collect::<Vec<_>>(),
            outcome
                .failed
                .iter()
                .map(|(ns, e)| NamespaceFailure {
                    namespace: ns.clone(),
                    message: e.to_string(),
                })
                .collect::<Vec<_>>(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let last_error = report.error.map(ToString::to_string).or_else(|| {
        failed_namespaces
            .first()
            .map(|f| format!("{}: {}", f.namespace, f.message))
    });

    let ready = if report.phase == Phase::Succeeded { "True" } else { "False" };
    let reason = match report.error {
        Some(e) if e.is_configuration() => "InvalidSpec".to_owned(),
        _ => format!("{:?}", report.phase),
    };
    let message = match &last_error {
        Some(e) if report.outcome.is_none() => e.clone(),
        _ => format!(
            "{} namespace(s) synced, {} failed",
            synced_namespaces.len(),
            failed_namespaces.len()
        ),
    };
    let last_transition_time = previous
        .and_then(|s| s.conditions.iter().find(|c| c.r#type == READY_CONDITION))
        .filter(|c| c.status == ready)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_rfc3339());

    ClusterSecretStatus {
        phase: report.phase,
        synced_count: synced_namespaces.len() as u32,
        failed_count: failed_namespaces.len() as u32,
        synced_namespaces,
        failed_namespaces,
        last_error,
        observed_generation: source.metadata.generation,
        last_sync_time: Some(now.to_rfc3339()),
        conditions: vec![Condition {
            r#type: READY_CONDITION.to_owned(),
            status: ready.to_owned(),
            reason,
            message: Some(message),
            last_transition_time: Some(last_transition_time),
        }],
    }
}

/// Equal apart from timestamps.
fn same_content(a: &ClusterSecretStatus, b: &ClusterSecretStatus) -> bool {
    let strip = |s: &ClusterSecretStatus| {
        let mut s = s.clone();
        s.last_sync_time = None;
        for c in &mut s.conditions {
            c.last_transition_time = None;
        }
        s
    };
    strip(a) == strip(b)
}

pub struct StatusReporter<C> {
    cluster: Arc<C>,
}

impl<C: ClusterApi> StatusReporter<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    /// Returns the status written, or `None` when nothing changed or the write
    /// failed. A failed write never fails the reconcile.
    pub async fn report(
        &self,
        source: &ClusterSecret,
        report: Report<'_>,
    ) -> Option<ClusterSecretStatus> {
        let status = build_status(source, report, Utc::now());
        if source.status.as_ref().is_some_and(|prev| same_content(prev, &status)) {
            debug!(source = %source.name_any(), "status unchanged");
            return None;
        }

        match self.cluster.patch_status(&source.name_any(), &status).await {
            Ok(()) => Some(status),
            Err(e) => {
                warn!(source = %source.name_any(), error = %e, "failed to write status");
                None
            }
        }
    }
}
