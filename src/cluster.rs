//! The slice of the Kubernetes API the controller talks to.
//!
//! Everything that may suspend or fail remotely goes through [`ClusterApi`], so
//! the reconcile logic can be driven against an in-memory cluster in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
};
use serde_json::json;

use crate::{
    crds::{ClusterSecret, ClusterSecretStatus},
    error::{Error, Result},
    replica::{MANAGED_BY_LABEL, MANAGER, OWNER_LABEL},
};

pub const FIELD_MANAGER: &str = "clustersecret.homerow.ca";
pub const FINALIZER: &str = "homerow.ca/cluster-secret-cleanup";

#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Replicas bearing our managed-by label, optionally only those of one source.
    async fn list_replicas(&self, source: Option<&str>) -> Result<Vec<Secret>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Full replace, guarded by the `resourceVersion` carried in `secret`.
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Delete guarded by uid and resource version of the object last observed.
    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<String>,
        resource_version: Option<String>,
    ) -> Result<()>;

    /// Idempotent. Returns the source as stored after the call.
    async fn add_finalizer(&self, source: &ClusterSecret) -> Result<ClusterSecret>;

    /// Idempotent. A source that is already gone counts as released.
    async fn remove_finalizer(&self, source: &ClusterSecret) -> Result<()>;

    async fn patch_status(&self, name: &str, status: &ClusterSecretStatus) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn sources(&self) -> Api<ClusterSecret> {
        Api::all(self.client.clone())
    }
}

fn namespace_of(secret: &Secret) -> Result<String> {
    secret
        .namespace()
        .ok_or_else(|| {
            Error::InvalidSpec(format!("secret '{}' has no namespace", secret.name_any()))
        })
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_replicas(&self, source: Option<&str>) -> Result<Vec<Secret>> {
        let mut selector = format!("{MANAGED_BY_LABEL}={MANAGER}");
        if let Some(source) = source {
            selector.push_str(&format!(",{OWNER_LABEL}={source}"));
        }
        let api = Api::<Secret>::all(self.client.clone());
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_owned()),
            ..PostParams::default()
        };
        Ok(self.secrets(&namespace_of(secret)?).create(&pp, secret).await?)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_owned()),
            ..PostParams::default()
        };
        Ok(self
            .secrets(&namespace_of(secret)?)
            .replace(&secret.name_any(), &pp, secret)
            .await?)
    }

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                uid,
                resource_version,
            }),
            ..DeleteParams::default()
        };
        match self.secrets(namespace).delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from(e) {
                Error::NotFound(_) => Ok(()),
                e => Err(e),
            },
        }
    }

    async fn add_finalizer(&self, source: &ClusterSecret) -> Result<ClusterSecret> {
        // The cached copy may lag behind our own earlier patch.
        let live = self.sources().get(&source.name_any()).await?;
        if live.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(live);
        }

        let mut finalizers = live.finalizers().to_vec();
        finalizers.push(FINALIZER.to_owned());
        let patch = json!({
            "metadata": {
                "resourceVersion": live.resource_version(),
                "finalizers": finalizers,
            }
        });
        Ok(self
            .sources()
            .patch(&live.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn remove_finalizer(&self, source: &ClusterSecret) -> Result<()> {
        let Some(live) = self.sources().get_opt(&source.name_any()).await? else {
            return Ok(());
        };
        if live.uid() != source.uid() || !live.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }

        let finalizers: Vec<&String> = live
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .collect();
        let patch = json!({
            "metadata": {
                "resourceVersion": live.resource_version(),
                "finalizers": finalizers,
            }
        });
        match self
            .sources()
            .patch(&live.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match Error::from(e) {
                Error::NotFound(_) => Ok(()),
                e => Err(e),
            },
        }
    }

    async fn patch_status(&self, name: &str, status: &ClusterSecretStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.sources()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
