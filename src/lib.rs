use std::sync::Arc;

use kube::{Client, config::KubeConfigOptions};
use tokio::sync::mpsc;
use tracing::info;

pub mod cluster;
pub mod config;
pub mod crds;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod replica;
pub mod status;
pub mod sync;
pub mod tracker;
pub mod watch;

#[cfg(test)]
mod fake;

use cluster::KubeCluster;
use config::Config;
use orchestrator::Orchestrator;

const EVENT_BUFFER: usize = 1024;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let options = KubeConfigOptions::default();

    // Load kubeconfig if it's present otherwise fall back to cluster config
    let kube_config = kube::Config::from_kubeconfig(&options)
        .await
        .or_else(|_| kube::Config::incluster())?;
    let client = Client::try_from(kube_config)?;

    info!(
        controller_namespace = %config.controller_namespace,
        resync_secs = config.resync_interval_secs,
        "starting cluster secret controller"
    );

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let (namespaces, sources) = watch::spawn_watchers(&client, tx);

    namespaces
        .wait_until_ready()
        .await
        .map_err(|_| anyhow::anyhow!("namespace watcher stopped before its first list"))?;
    sources
        .wait_until_ready()
        .await
        .map_err(|_| anyhow::anyhow!("ClusterSecret watcher stopped before its first list"))?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(KubeCluster::new(client)),
        config,
        namespaces,
        sources,
    ));
    orchestrator.bootstrap().await?;

    orchestrator.run(rx).await;

    Ok(())
}
