//! In-memory [`ClusterApi`] with failure injection and a write log.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::core::v1::{Namespace, NamespaceStatus, Secret},
};
use kube::{ResourceExt, api::ObjectMeta, error::ErrorResponse};

use crate::{
    cluster::{ClusterApi, FINALIZER},
    crds::{ClusterSecret, ClusterSecretSpec, ClusterSecretStatus, NamespaceRule},
    error::{Error, Result},
    replica::{MANAGED_BY_LABEL, MANAGER, OWNER_LABEL},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Create(String, String),
    Replace(String, String),
    Delete(String, String),
    Finalizer(String),
    Status(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Forbidden,
    Transient,
}

impl Failure {
    fn error(self, what: &str) -> Error {
        match self {
            Failure::Forbidden => Error::Forbidden(format!("{what} is forbidden")),
            Failure::Transient => Error::Transient(format!("{what} timed out")),
        }
    }
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    secrets: BTreeMap<(String, String), Secret>,
    sources: BTreeMap<String, ClusterSecret>,
    statuses: BTreeMap<String, ClusterSecretStatus>,
    writes: Vec<Write>,
    /// Namespace → failure and how many more writes should fail (`None` = forever).
    failures: BTreeMap<String, (Failure, Option<u32>)>,
    list_failures: u32,
    next_version: u64,
}

impl State {
    fn version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check_failure(&mut self, namespace: &str, what: &str) -> Result<()> {
        let Some(&(failure, remaining)) = self.failures.get(namespace) else {
            return Ok(());
        };
        match remaining {
            Some(0) => {
                self.failures.remove(namespace);
                Ok(())
            }
            Some(n) => {
                self.failures
                    .insert(namespace.to_owned(), (failure, Some(n - 1)));
                Err(failure.error(what))
            }
            None => Err(failure.error(what)),
        }
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    /// Held by a test to stall every secret create.
    gate: tokio::sync::Mutex<()>,
}

pub fn bytes(v: &str) -> ByteString {
    ByteString(v.as_bytes().to_vec())
}

pub fn source(
    name: &str,
    data: &[(&str, &str)],
    match_ns: Vec<NamespaceRule>,
    avoid: Vec<NamespaceRule>,
) -> ClusterSecret {
    let mut cs = ClusterSecret::new(
        name,
        ClusterSecretSpec {
            data: Some(data.iter().map(|(k, v)| (k.to_string(), bytes(v))).collect()),
            value_from: None,
            match_namespaces: match_ns,
            avoid_namespaces: avoid,
            type_: "Opaque".to_owned(),
        },
    );
    cs.metadata.uid = Some(format!("uid-{name}"));
    cs.metadata.generation = Some(1);
    cs.metadata.resource_version = Some("1".to_owned());
    cs
}

impl FakeCluster {
    pub fn with_namespaces(names: &[&str]) -> Self {
        let fake = Self::default();
        for name in names {
            fake.add_namespace(name);
        }
        fake
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_namespace(&self, name: &str) -> Namespace {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..ObjectMeta::default()
            },
            status: Some(NamespaceStatus {
                phase: Some("Active".to_owned()),
                ..NamespaceStatus::default()
            }),
            ..Namespace::default()
        };
        self.put_namespace(ns.clone());
        ns
    }

    pub fn put_namespace(&self, ns: Namespace) {
        self.state().namespaces.insert(ns.name_any(), ns);
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.state().namespaces.values().cloned().collect()
    }

    /// Removes the namespace along with every secret in it.
    pub fn remove_namespace(&self, name: &str) {
        let mut state = self.state();
        state.namespaces.remove(name);
        state.secrets.retain(|(ns, _), _| ns != name);
    }

    pub fn put_source(&self, source: &ClusterSecret) {
        self.state().sources.insert(source.name_any(), source.clone());
    }

    pub fn remove_source(&self, name: &str) {
        self.state().sources.remove(name);
    }

    /// The source as stored, including finalizers and status written so far.
    pub fn source(&self, name: &str) -> Option<ClusterSecret> {
        self.state().sources.get(name).cloned()
    }

    pub fn sources(&self) -> Vec<ClusterSecret> {
        self.state().sources.values().cloned().collect()
    }

    pub async fn hold_creates(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Stores a secret as-is, as another actor would.
    pub fn put_secret(&self, mut secret: Secret) {
        let mut state = self.state();
        secret.metadata.resource_version = Some(state.version());
        let name = secret.name_any();
        secret.metadata.uid.get_or_insert_with(|| format!("uid-{name}"));
        let key = (secret.namespace().unwrap_or_default(), name);
        state.secrets.insert(key, secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state()
            .secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Namespaces holding a secret owned by `source`.
    pub fn replica_namespaces(&self, source: &str) -> BTreeSet<String> {
        self.state()
            .secrets
            .iter()
            .filter(|(_, s)| s.labels().get(OWNER_LABEL).map(String::as_str) == Some(source))
            .map(|((ns, _), _)| ns.clone())
            .collect()
    }

    pub fn fail(&self, namespace: &str, failure: Failure, times: Option<u32>) {
        self.state().failures.insert(namespace.to_owned(), (failure, times));
    }

    pub fn fail_listing(&self, times: u32) {
        self.state().list_failures = times;
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    pub fn status(&self, name: &str) -> Option<ClusterSecretStatus> {
        self.state().statuses.get(name).cloned()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_replicas(&self, source: Option<&str>) -> Result<Vec<Secret>> {
        let mut state = self.state();
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(Error::Transient("list timed out".to_owned()));
        }
        Ok(state
            .secrets
            .values()
            .filter(|s| s.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGER))
            .filter(|s| {
                source.is_none_or(|src| {
                    s.labels().get(OWNER_LABEL).map(String::as_str) == Some(src)
                })
            })
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let _open = self.gate.lock().await;
        let mut state = self.state();
        let ns = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        state.check_failure(&ns, &format!("create {ns}/{name}"))?;
        if !state.namespaces.contains_key(&ns) {
            return Err(Error::NotFound(format!("namespace {ns}")));
        }
        let key = (ns.clone(), name.clone());
        if state.secrets.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("secret {ns}/{name}")));
        }
        let mut stored = secret.clone();
        stored.metadata.resource_version = Some(state.version());
        stored.metadata.uid = Some(format!("uid-{ns}-{name}-{}", state.next_version));
        state.secrets.insert(key, stored.clone());
        state.writes.push(Write::Create(ns, name));
        Ok(stored)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret> {
        let mut state = self.state();
        let ns = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        state.check_failure(&ns, &format!("replace {ns}/{name}"))?;
        let key = (ns.clone(), name.clone());
        let Some(live) = state.secrets.get(&key) else {
            return Err(Error::NotFound(format!("secret {ns}/{name}")));
        };
        if live.metadata.resource_version != secret.metadata.resource_version {
            return Err(Error::Transient(format!("conflict on {ns}/{name}")));
        }
        if live.type_ != secret.type_ {
            return Err(Error::from(kube::Error::Api(ErrorResponse {
                status: "Failure".to_owned(),
                message: format!("Secret \"{name}\" is invalid: type: field is immutable"),
                reason: "Invalid".to_owned(),
                code: 422,
            })));
        }
        let mut stored = secret.clone();
        stored.metadata.uid = live.metadata.uid.clone();
        stored.metadata.resource_version = Some(state.version());
        state.secrets.insert(key, stored.clone());
        state.writes.push(Write::Replace(ns, name));
        Ok(stored)
    }

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        uid: Option<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_failure(namespace, &format!("delete {namespace}/{name}"))?;
        let key = (namespace.to_owned(), name.to_owned());
        let Some(live) = state.secrets.get(&key) else {
            return Ok(());
        };
        if (uid.is_some() && live.metadata.uid != uid)
            || (resource_version.is_some() && live.metadata.resource_version != resource_version)
        {
            return Err(Error::Transient(format!("precondition failed on {namespace}/{name}")));
        }
        state.secrets.remove(&key);
        state.writes.push(Write::Delete(namespace.to_owned(), name.to_owned()));
        Ok(())
    }

    async fn add_finalizer(&self, source: &ClusterSecret) -> Result<ClusterSecret> {
        let mut state = self.state();
        let Some(mut updated) = state.sources.get(&source.name_any()).cloned() else {
            return Err(Error::NotFound(format!("clustersecret {}", source.name_any())));
        };
        if updated.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(updated);
        }
        updated.finalizers_mut().push(FINALIZER.to_owned());
        state.sources.insert(source.name_any(), updated.clone());
        state.writes.push(Write::Finalizer(source.name_any()));
        Ok(updated)
    }

    async fn remove_finalizer(&self, source: &ClusterSecret) -> Result<()> {
        let mut state = self.state();
        if state.sources.remove(&source.name_any()).is_some() {
            state.writes.push(Write::Finalizer(source.name_any()));
        }
        Ok(())
    }

    async fn patch_status(&self, name: &str, status: &ClusterSecretStatus) -> Result<()> {
        let mut state = self.state();
        state.check_failure(&format!("status/{name}"), "status patch")?;
        state.statuses.insert(name.to_owned(), status.clone());
        if let Some(source) = state.sources.get_mut(name) {
            source.status = Some(status.clone());
        }
        state.writes.push(Write::Status(name.to_owned()));
        Ok(())
    }
}
