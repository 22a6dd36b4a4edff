//! Feeds watch events for sources, namespaces and secrets into the orchestrator.
//!
//! Sources and namespaces are reflected into stores the orchestrator reads
//! from. A completed relist is forwarded as a resync so that deletes missed
//! while the watch was down are acted on.

use futures::{StreamExt, stream::BoxStream};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{
    Api, Client,
    runtime::{
        WatchStreamExt,
        reflector::{self, Store},
        watcher,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{crds::ClusterSecret, orchestrator::Event};

type WatchStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Starts the three watchers and returns the namespace and source stores.
/// The stores are ready once their first list has completed.
pub fn spawn_watchers(
    client: &Client,
    tx: mpsc::Sender<Event>,
) -> (Store<Namespace>, Store<ClusterSecret>) {
    let (sources, source_writer) = reflector::store::<ClusterSecret>();
    let (namespaces, namespace_writer) = reflector::store::<Namespace>();

    let source_api = Api::<ClusterSecret>::all(client.clone());
    spawn_watch(
        watcher(source_api, watcher::Config::default())
            .reflect(source_writer)
            .default_backoff()
            .boxed(),
        tx.clone(),
        "ClusterSecret",
        Event::SourceApplied,
        Event::SourceDeleted,
    );

    let namespace_api = Api::<Namespace>::all(client.clone());
    spawn_watch(
        watcher(namespace_api, watcher::Config::default())
            .reflect(namespace_writer)
            .default_backoff()
            .boxed(),
        tx.clone(),
        "Namespace",
        Event::NamespaceApplied,
        Event::NamespaceDeleted,
    );

    let secret_api = Api::<Secret>::all(client.clone());
    spawn_watch(
        watcher(secret_api, watcher::Config::default())
            .default_backoff()
            .boxed(),
        tx,
        "Secret",
        Event::SecretApplied,
        Event::SecretDeleted,
    );

    (namespaces, sources)
}

fn spawn_watch<K: Send + 'static>(
    mut stream: WatchStream<K>,
    tx: mpsc::Sender<Event>,
    kind: &'static str,
    applied: fn(K) -> Event,
    deleted: fn(K) -> Event,
) {
    tokio::spawn(async move {
        while let Some(res) = stream.next().await {
            let event = match res {
                Ok(watcher::Event::Apply(o)) => applied(o),
                Ok(watcher::Event::Delete(o)) => deleted(o),
                // Objects seen during a relist are covered by the resync at its end.
                Ok(watcher::Event::Init | watcher::Event::InitApply(_)) => continue,
                Ok(watcher::Event::InitDone) => {
                    info!(kind, "relist complete");
                    Event::Resync
                }
                Err(e) => {
                    error!(kind, error = %e, "watcher error");
                    continue;
                }
            };
            if tx.send(event).await.is_err() {
                debug!(kind, "event channel closed");
                break;
            }
        }
    });
}
