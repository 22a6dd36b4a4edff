use std::collections::BTreeMap;

use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use sha2::{Digest, Sha256};

use crate::crds::ClusterSecret;

pub const OWNER_LABEL: &str = "homerow.ca/cluster-secret";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "cluster-secret-controller";
pub const CONTENT_HASH_ANNOTATION: &str = "homerow.ca/content-hash";

/// The replica every target namespace should hold for one source.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredReplica {
    pub source: String,
    pub type_: String,
    pub data: BTreeMap<String, ByteString>,
    pub hash: String,
    owner_ref: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>,
}

impl DesiredReplica {
    pub fn new(source: &ClusterSecret, data: BTreeMap<String, ByteString>) -> Self {
        let type_ = source.spec.type_.clone();
        Self {
            source: source.name_any(),
            hash: content_hash(&type_, &data),
            type_,
            data,
            owner_ref: source.controller_owner_ref(&()),
        }
    }

    /// Target set is empty during teardown so the payload is irrelevant.
    pub fn teardown(source: &str) -> Self {
        Self {
            source: source.to_owned(),
            type_: String::new(),
            data: BTreeMap::new(),
            hash: String::new(),
            owner_ref: None,
        }
    }

    pub fn to_secret(&self, namespace: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_owned()),
                name: Some(self.source.clone()),
                labels: Some(BTreeMap::from([
                    (OWNER_LABEL.to_owned(), self.source.clone()),
                    (MANAGED_BY_LABEL.to_owned(), MANAGER.to_owned()),
                ])),
                annotations: Some(BTreeMap::from([(
                    CONTENT_HASH_ANNOTATION.to_owned(),
                    self.hash.clone(),
                )])),
                owner_references: self.owner_ref.clone().map(|r| vec![r]),
                ..ObjectMeta::default()
            },
            data: Some(self.data.clone()),
            type_: Some(self.type_.clone()),
            ..Secret::default()
        }
    }

    /// Whether a live replica differs from what this desired state would write.
    pub fn drifted(&self, live: &Secret) -> bool {
        live.data.as_ref().map_or(!self.data.is_empty(), |d| d != &self.data)
            || live.type_.as_deref() != Some(self.type_.as_str())
            || owner_of(live) != Some(self.source.as_str())
            || hash_of(live) != Some(self.hash.as_str())
    }
}

/// SHA-256 over the type tag and every key/value pair in key order.
pub fn content_hash(type_: &str, data: &BTreeMap<String, ByteString>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_.as_bytes());
    for (k, v) in data {
        hasher.update([0]);
        hasher.update(k.as_bytes());
        hasher.update([0]);
        hasher.update(&v.0);
    }
    format!("{:x}", hasher.finalize())
}

pub fn owner_of(secret: &Secret) -> Option<&str> {
    secret.labels().get(OWNER_LABEL).map(String::as_str)
}

pub fn hash_of(secret: &Secret) -> Option<&str> {
    secret
        .annotations()
        .get(CONTENT_HASH_ANNOTATION)
        .map(String::as_str)
}

pub fn is_managed(secret: &Secret) -> bool {
    secret.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGER)
}

/// Secrets that churn constantly and never feed a ClusterSecret.
pub fn is_noise(secret: &Secret) -> bool {
    let name = secret.name_any();
    name.starts_with("sh.helm.release.v1.")
        || secret.labels().get("owner").map(String::as_str) == Some("helm")
        || (name.starts_with("runner-")
            && name.contains("-project-")
            && name.contains("-concurrent-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn hash_tracks_content_and_type() {
        let a = content_hash("Opaque", &data(&[("user", "admin")]));
        assert_eq!(a, content_hash("Opaque", &data(&[("user", "admin")])));
        assert_ne!(a, content_hash("Opaque", &data(&[("user", "root")])));
        assert_ne!(a, content_hash("kubernetes.io/basic-auth", &data(&[("user", "admin")])));
        // key/value boundaries are part of the hash
        assert_ne!(
            content_hash("Opaque", &data(&[("ab", "c")])),
            content_hash("Opaque", &data(&[("a", "bc")]))
        );
    }

    #[test]
    fn replica_carries_markers() {
        let desired = DesiredReplica {
            source: "s1".into(),
            type_: "Opaque".into(),
            data: data(&[("k", "v")]),
            hash: content_hash("Opaque", &data(&[("k", "v")])),
            owner_ref: None,
        };
        let secret = desired.to_secret("team-a");

        assert_eq!(secret.namespace().as_deref(), Some("team-a"));
        assert_eq!(secret.name_any(), "s1");
        assert_eq!(owner_of(&secret), Some("s1"));
        assert_eq!(hash_of(&secret), Some(desired.hash.as_str()));
        assert!(is_managed(&secret));
        assert!(!desired.drifted(&secret));

        let mut edited = secret.clone();
        edited.data = Some(data(&[("k", "tampered")]));
        assert!(desired.drifted(&edited));
    }

    #[test]
    fn noise_secrets() {
        let named = |name: &str| Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };

        assert!(is_noise(&named("sh.helm.release.v1.app.v3")));
        assert!(is_noise(&named("runner-abc-project-12-concurrent-0")));
        assert!(!is_noise(&named("db-credentials")));
    }
}
