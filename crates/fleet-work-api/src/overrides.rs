//! Override snapshots: cluster-parameterized transformations applied to a
//! manifest before it reaches the applier.
//!
//! Snapshots are produced by upstream controllers and consumed read-only.
//! Cluster-resource snapshots target cluster-scoped resources (and
//! namespaces, in which case they govern the resources inside); resource
//! snapshots target namespaced resources in their own namespace.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Frozen revision of a cluster-scoped override.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "placement.kubefleet.dev",
    version = "v1beta1",
    kind = "ClusterResourceOverrideSnapshot"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceOverrideSnapshotSpec {
    /// The cluster-scoped resources this override targets.
    #[serde(default)]
    pub cluster_resource_selectors: Vec<ResourceSelector>,

    pub policy: OverridePolicy,
}

/// Frozen revision of a namespaced override. Targets resources in the
/// snapshot's own namespace.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "placement.kubefleet.dev",
    version = "v1beta1",
    kind = "ResourceOverrideSnapshot",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrideSnapshotSpec {
    /// The namespaced resources this override targets.
    #[serde(default)]
    pub resource_selectors: Vec<ResourceSelector>,

    pub policy: OverridePolicy,
}

/// Selects one resource by group, version, kind and name.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverridePolicy {
    /// Rules evaluated in declaration order.
    #[serde(default)]
    pub override_rules: Vec<OverrideRule>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRule {
    /// Which member clusters the rule applies to. See the engine for the
    /// missing-selector semantics, which differ between cluster-resource
    /// and resource overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<ClusterSelector>,

    #[serde(default)]
    pub override_type: OverrideType,

    /// RFC-6902 operations, applied in order. Ignored for `Delete` rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_patch_overrides: Vec<JsonPatchOverride>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum OverrideType {
    /// Transform the manifest with the rule's JSON patch operations.
    #[default]
    JsonPatch,

    /// The manifest must not exist on the matched clusters.
    Delete,
}

/// Matches member clusters by label. A cluster matches when any term
/// matches; a term with an empty selector matches every cluster.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSelector {
    #[serde(default)]
    pub selector_terms: Vec<ClusterSelectorTerm>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSelectorTerm {
    #[serde(default)]
    pub label_selector: LabelSelector,
}

/// One RFC-6902 operation. Kept schema-typed (rather than an opaque patch
/// document) so the API server can validate override specs.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonPatchOverride {
    pub op: JsonPatchOverrideOp,

    /// JSON pointer into the manifest.
    pub path: String,

    /// Operand for `Add` and `Replace`. Template tokens in string values are
    /// substituted with member-cluster properties before application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JsonPatchOverrideOp {
    #[default]
    Add,
    Replace,
    Remove,
}

impl JsonPatchOverride {
    /// The operation in the wire form `json_patch` expects.
    pub fn to_operation(&self) -> serde_json::Value {
        let mut operation = serde_json::json!({
            "op": self.op.to_string(),
            "path": self.path,
        });
        if let Some(value) = &self.value {
            operation["value"] = value.clone();
        }
        operation
    }
}
