use std::collections::BTreeMap;

use k8s_openapi::{ByteString, apimachinery::pkg::apis::meta::v1::LabelSelector};
use kube_derive::CustomResource;
use schemars::{
    JsonSchema,
    r#gen::SchemaGenerator,
    schema::{InstanceType, ObjectValidation, Schema, SchemaObject},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SECRET_TYPE: &str = "Opaque";

/// A single namespace selection rule. Exactly one kind per rule.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum NamespaceRule {
    Exact(String),
    /// `*` matches any run of characters, `?` a single one.
    Glob(String),
    Regex(String),
    LabelSelector(LabelSelector),
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub namespace: String,
    /// Keys to clone. Every key is cloned when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    pub secret_key_ref: SecretKeyRef,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "homerow.ca",
    version = "v1",
    kind = "ClusterSecret",
    shortname = "csec",
    status = "ClusterSecretStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Synced","type":"integer","jsonPath":".status.syncedCount"}"#
)]
pub struct ClusterSecretSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "secret_data_schema")]
    pub data: Option<BTreeMap<String, ByteString>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
    pub match_namespaces: Vec<NamespaceRule>,
    #[serde(default)]
    pub avoid_namespaces: Vec<NamespaceRule>,
    #[serde(default = "default_secret_type", rename = "type")]
    pub type_: String,
}

/// Same shape as `Secret.data`: base64 values keyed by name.
fn secret_data_schema(_: &mut SchemaGenerator) -> Schema {
    let value = SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        format: Some("byte".to_owned()),
        ..SchemaObject::default()
    };
    SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        object: Some(Box::new(ObjectValidation {
            additional_properties: Some(Box::new(value.into())),
            ..ObjectValidation::default()
        })),
        ..SchemaObject::default()
    }
    .into()
}

fn default_secret_type() -> String {
    DEFAULT_SECRET_TYPE.to_owned()
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Pending,
    Succeeded,
    PartiallyFailed,
    Failed,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceFailure {
    pub namespace: String,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecretStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub synced_namespaces: Vec<String>,
    #[serde(default)]
    pub synced_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub failed_namespaces: Vec<NamespaceFailure>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub last_sync_time: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
