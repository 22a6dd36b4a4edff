use std::time::Duration;

use tokio_retry2::strategy::{ExponentialBackoff, jitter};

pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "cluster-secret";

#[derive(clap::Args, Clone, Debug)]
pub struct Config {
    /// Namespace the controller runs in. Never receives replicas.
    #[arg(long, env = "CONTROLLER_NAMESPACE", default_value = DEFAULT_CONTROLLER_NAMESPACE)]
    pub controller_namespace: String,

    /// Seconds between full resyncs of every ClusterSecret
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Retries of transient API failures within one reconcile
    #[arg(long, env = "MAX_RETRIES", default_value_t = 4)]
    pub max_retries: usize,

    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 10)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "MAX_BACKOFF_SECS", default_value_t = 10)]
    pub max_backoff_secs: u64,

    /// Replica writes in flight per ClusterSecret
    #[arg(long, env = "MAX_CONCURRENT_WRITES", default_value_t = 8)]
    pub max_concurrent_writes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_owned(),
            resync_interval_secs: 300,
            max_retries: 4,
            backoff_base_ms: 10,
            max_backoff_secs: 10,
            max_concurrent_writes: 8,
        }
    }
}

impl Config {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    pub fn retry_strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBackoff::from_millis(self.backoff_base_ms.max(1))
            .max_delay(Duration::from_secs(self.max_backoff_secs))
            .map(jitter)
            .take(self.max_retries)
    }
}
