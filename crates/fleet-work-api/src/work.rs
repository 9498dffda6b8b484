//! The hub-side Work: a bundle of manifests destined for one member cluster.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::strategy::ApplyStrategy;

/// A bundle of manifests to be materialized on one member cluster.
///
/// Works live in the hub namespace reserved for the target member cluster.
/// The upstream rollout controller owns the spec; the member agent owns the
/// cleanup finalizer and the status.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "placement.kubefleet.dev",
    version = "v1beta1",
    kind = "Work",
    namespaced,
    status = "WorkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkSpec {
    /// The ordered list of manifests to apply. Each entry is an opaque
    /// Kubernetes object in JSON form.
    #[serde(default)]
    pub workload: Workload,

    /// How the manifests are applied and reconciled on the member cluster.
    pub apply_strategy: Option<ApplyStrategy>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    #[serde(default)]
    pub manifests: Vec<Manifest>,
}

/// One encoded manifest. Kept opaque: decoding happens in the applier so
/// that a malformed entry degrades into a per-manifest condition instead of
/// failing the whole Work.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Manifest(pub serde_json::Value);

impl Work {
    /// The effective apply strategy, falling back to the defaults when the
    /// spec carries none.
    pub fn effective_apply_strategy(&self) -> ApplyStrategy {
        self.spec.apply_strategy.clone().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkStatus {
    /// Aggregate conditions: `Applied`, `Available`, `DiffReported`. Only
    /// authoritative when `observedGeneration` matches the Work generation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-manifest conditions in ordinal order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifest_conditions: Vec<ManifestCondition>,
}

/// Status of a single manifest within a Work.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCondition {
    pub identifier: WorkResourceIdentifier,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Present while the live object has drifted from the last apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_details: Option<DriftDetails>,

    /// Present while the live object differs from the desired manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_details: Option<DiffDetails>,
}

/// Identity of a manifest within a Work.
///
/// The ordinal is the manifest's index in the Work and disambiguates
/// duplicates as well as manifests whose identity never became known (for
/// example a decode failure before a name could be read).
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResourceIdentifier {
    pub ordinal: usize,

    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    /// The plural resource name, filled in once REST mapping succeeded.
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl WorkResourceIdentifier {
    /// Whether both identifiers point at the same cluster object,
    /// disregarding the position within the Work.
    pub fn same_object(&self, other: &Self) -> bool {
        self.group == other.group
            && self.version == other.version
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

impl std::fmt::Display for WorkResourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(
                f,
                "[{ordinal}] {group}/{version}/{kind}/{name}",
                ordinal = self.ordinal,
                group = self.group,
                version = self.version,
                kind = self.kind,
                name = self.name,
            )
        } else {
            write!(
                f,
                "[{ordinal}] {group}/{version}/{kind}/{namespace}/{name}",
                ordinal = self.ordinal,
                group = self.group,
                version = self.version,
                kind = self.kind,
                namespace = self.namespace,
                name = self.name,
            )
        }
    }
}

/// Deviation between the live object and the most recent successful apply,
/// observed once the object is under fleet ownership.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftDetails {
    /// Refreshed on every cycle the drift is still present.
    pub observation_time: Time,

    /// Set when the drift is first seen, preserved until it disappears.
    pub first_drifted_observed_time: Time,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed_drifts: Vec<PatchDetail>,
}

/// Deviation between the live object and the desired (post-override)
/// manifest, observed before takeover and in ReportDiff mode.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffDetails {
    /// Refreshed on every cycle the diff is still present.
    pub observation_time: Time,

    /// Set when the diff is first seen, preserved until it disappears.
    pub first_diffed_observed_time: Time,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed_diffs: Vec<PatchDetail>,
}

/// One differing field, addressed by its JSON pointer.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDetail {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_in_hub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_in_member: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_decodes_with_opaque_manifests() {
        let work: Work = serde_yaml::from_str(
            "
apiVersion: placement.kubefleet.dev/v1beta1
kind: Work
metadata:
  name: work-1
  namespace: fleet-member-cluster-1
spec:
  workload:
    manifests:
      - apiVersion: v1
        kind: Namespace
        metadata:
          name: ns-x
      - apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: d
          namespace: ns-x
",
        )
        .expect("valid Work YAML");

        let manifests = &work.spec.workload.manifests;
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].0["kind"], "Namespace");
        assert_eq!(manifests[1].0["metadata"]["namespace"], "ns-x");
        assert_eq!(
            work.effective_apply_strategy(),
            ApplyStrategy::default(),
            "a missing strategy falls back to the defaults"
        );
    }

    #[test]
    fn identifier_display_and_identity() {
        let deployment = WorkResourceIdentifier {
            ordinal: 1,
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
            resource: "deployments".into(),
            namespace: "ns-x".into(),
            name: "d".into(),
        };

        assert_eq!(deployment.to_string(), "[1] apps/v1/Deployment/ns-x/d");

        let same_object_later_ordinal = WorkResourceIdentifier {
            ordinal: 7,
            resource: String::new(),
            ..deployment.clone()
        };
        assert!(deployment.same_object(&same_object_later_ordinal));

        let namespace = WorkResourceIdentifier {
            ordinal: 0,
            group: String::new(),
            version: "v1".into(),
            kind: "Namespace".into(),
            resource: "namespaces".into(),
            namespace: String::new(),
            name: "ns-x".into(),
        };
        assert_eq!(namespace.to_string(), "[0] /v1/Namespace/ns-x");
        assert!(!deployment.same_object(&namespace));
    }
}
