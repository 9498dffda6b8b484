//! The override engine: deterministic, cluster-parameterized transformation
//! of a manifest before it reaches the applier.
//!
//! Pure function of (manifest, member cluster, override snapshots). Cluster
//! overrides are evaluated before resource overrides, snapshots in name
//! order, rules in declaration order, so resource overrides win on
//! conflict. A matched `Delete` rule short-circuits into a skip verdict:
//! the manifest must not exist on this cluster.

use serde_json::Value;
use snafu::{ResultExt, Snafu};

use fleet_work_api::{
    overrides::{
        ClusterResourceOverrideSnapshot, OverrideRule, OverrideType, ResourceOverrideSnapshot,
        ResourceSelector,
    },
    work::WorkResourceIdentifier,
};
use kube::ResourceExt;

use crate::member::MemberCluster;

pub mod selector;
pub mod template;

use selector::cluster_selector_matches;
use template::substitute;

type Result<T, E = EngineError> = std::result::Result<T, E>;

/// All engine failures are user errors: the override spec referenced
/// something that does not exist or produced an invalid patch. They are
/// surfaced in per-manifest conditions and not retried until the spec
/// changes.
#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("failed to evaluate the cluster selector of an override rule"))]
    EvaluateSelector { source: selector::SelectorError },

    #[snafu(display("failed to substitute member-cluster tokens in an override value"))]
    SubstituteTemplate { source: template::TemplateError },

    #[snafu(display("the override rule is not a valid JSON patch document"))]
    DeserializePatch { source: serde_json::Error },

    #[snafu(display("failed to apply a JSON patch override to the manifest"))]
    ApplyPatch { source: json_patch::PatchError },
}

/// Whether the manifest is kept (possibly transformed) or must not exist on
/// this cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverrideVerdict {
    Keep,
    Skip,
}

/// The override snapshots visible to one reconciliation, ordered for
/// deterministic evaluation.
#[derive(Clone, Debug, Default)]
pub struct OverrideIndex {
    cluster_snapshots: Vec<ClusterResourceOverrideSnapshot>,
    resource_snapshots: Vec<ResourceOverrideSnapshot>,
}

impl OverrideIndex {
    pub fn new(
        mut cluster_snapshots: Vec<ClusterResourceOverrideSnapshot>,
        mut resource_snapshots: Vec<ResourceOverrideSnapshot>,
    ) -> Self {
        cluster_snapshots.sort_by_key(kube::ResourceExt::name_any);
        resource_snapshots.sort_by_key(kube::ResourceExt::name_any);

        Self {
            cluster_snapshots,
            resource_snapshots,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cluster_snapshots.is_empty() && self.resource_snapshots.is_empty()
    }

    /// Cluster-override rules applicable to the identified resource. A
    /// cluster-scoped resource is matched directly; a namespaced resource
    /// is matched through a selector targeting its namespace, so that an
    /// override on a Namespace governs everything inside it.
    fn cluster_rules_for(&self, identifier: &WorkResourceIdentifier) -> Vec<&OverrideRule> {
        self.cluster_snapshots
            .iter()
            .filter(|snapshot| {
                snapshot
                    .spec
                    .cluster_resource_selectors
                    .iter()
                    .any(|selector| cluster_selector_targets(selector, identifier))
            })
            .flat_map(|snapshot| &snapshot.spec.policy.override_rules)
            .collect()
    }

    /// Resource-override rules applicable to the identified resource:
    /// snapshots in the resource's namespace selecting its group, version,
    /// kind and name.
    fn resource_rules_for(&self, identifier: &WorkResourceIdentifier) -> Vec<&OverrideRule> {
        self.resource_snapshots
            .iter()
            .filter(|snapshot| {
                snapshot.namespace().as_deref() == Some(identifier.namespace.as_str())
                    && snapshot
                        .spec
                        .resource_selectors
                        .iter()
                        .any(|selector| selector_targets(selector, identifier))
            })
            .flat_map(|snapshot| &snapshot.spec.policy.override_rules)
            .collect()
    }
}

fn selector_targets(selector: &ResourceSelector, identifier: &WorkResourceIdentifier) -> bool {
    selector.group == identifier.group
        && selector.version == identifier.version
        && selector.kind == identifier.kind
        && selector.name == identifier.name
}

fn cluster_selector_targets(
    selector: &ResourceSelector,
    identifier: &WorkResourceIdentifier,
) -> bool {
    if identifier.namespace.is_empty() {
        return selector_targets(selector, identifier);
    }

    // Namespaced resource: governed through its namespace.
    selector.group.is_empty()
        && selector.version == "v1"
        && selector.kind == "Namespace"
        && selector.name == identifier.namespace
}

/// Runs all applicable override rules against `manifest`, in place.
///
/// Idempotent and deterministic for a given input tuple. Returns
/// [`OverrideVerdict::Skip`] as soon as a `Delete` rule matches; later
/// rules are not evaluated.
pub fn apply_overrides(
    manifest: &mut Value,
    identifier: &WorkResourceIdentifier,
    cluster: &MemberCluster,
    index: &OverrideIndex,
) -> Result<OverrideVerdict> {
    let cluster_rules = index.cluster_rules_for(identifier);
    let resource_rules = index.resource_rules_for(identifier);

    for (rule, selector_required) in cluster_rules
        .into_iter()
        .zip(std::iter::repeat(true))
        .chain(resource_rules.into_iter().zip(std::iter::repeat(false)))
    {
        if !rule_applies(rule, cluster, selector_required)? {
            continue;
        }

        if rule.override_type == OverrideType::Delete {
            return Ok(OverrideVerdict::Skip);
        }

        apply_rule(manifest, rule, cluster)?;
    }

    Ok(OverrideVerdict::Keep)
}

/// Whether the rule's cluster selector matches this member cluster.
///
/// A missing selector on a cluster-override rule matches nothing (an
/// explicit selector is required); on a resource-override rule it means the
/// rule applies to every cluster.
fn rule_applies(
    rule: &OverrideRule,
    cluster: &MemberCluster,
    selector_required: bool,
) -> Result<bool> {
    match &rule.cluster_selector {
        Some(selector) => {
            cluster_selector_matches(selector, &cluster.labels).context(EvaluateSelectorSnafu)
        }
        None => Ok(!selector_required),
    }
}

fn apply_rule(manifest: &mut Value, rule: &OverrideRule, cluster: &MemberCluster) -> Result<()> {
    let operations = rule
        .json_patch_overrides
        .iter()
        .map(|patch_override| {
            let mut operation = patch_override.to_operation();
            if let Some(value) = operation.get_mut("value") {
                substitute(value, cluster).context(SubstituteTemplateSnafu)?;
            }
            Ok(operation)
        })
        .collect::<Result<Vec<_>>>()?;

    let patch: json_patch::Patch =
        serde_json::from_value(Value::Array(operations)).context(DeserializePatchSnafu)?;

    json_patch::patch(manifest, &patch).context(ApplyPatchSnafu)
}
