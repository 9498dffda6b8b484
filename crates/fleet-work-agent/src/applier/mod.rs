//! The Work applier: end-to-end reconciliation of one Work against the
//! member cluster.
//!
//! Per-manifest failures never abort a cycle; every manifest is attempted
//! and degrades into its own condition. The pipeline per cycle: finalize,
//! ensure the AppliedWork mirror, decode, override, take-over gate, drift
//! gate, apply, availability, garbage collection, status.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DynamicObject, ListParams, Patch, PatchParams, PostParams},
    discovery::{ApiResource, Scope},
    runtime::controller::Action,
};
use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};

use fleet_work_api::{
    applied_work::{AppliedResourceMeta, AppliedWork, AppliedWorkSpec},
    condition::{self, CONDITION_TYPE_APPLIED},
    constants::{DELETE_DEPENDENTS_FINALIZER, WORK_CLEANUP_FINALIZER, WORK_FIELD_MANAGER},
    overrides::{ClusterResourceOverrideSnapshot, ResourceOverrideSnapshot},
    strategy::{ApplyStrategy, ApplyStrategyType, ComparisonOption, WhenToApply, WhenToTakeOver},
    work::{PatchDetail, Work, WorkResourceIdentifier, WorkStatus},
};

use crate::{
    discovery::RestMapper,
    member::MemberCluster,
    override_engine::{OverrideIndex, OverrideVerdict, apply_overrides},
    tracker::{ResourceTracker, fleet_owner_reference, is_fleet_owner, merged_owner_references},
};

pub mod apply;
pub mod availability;
pub mod cleanup;
pub mod compare;
pub mod preprocess;
pub mod status;

use apply::{claim_ownership, client_side_apply, last_applied_of, last_applied_snapshot, server_side_apply};
use availability::check_availability;
use compare::{full_compare, manager_fields_mask, masked_compare};
use preprocess::{DecodeFailure, DecodeOutcome, DecodedManifest};
use status::{ManifestOutcome, OutcomeKind, StatusBuilder};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to add the cleanup finalizer to Work {name:?}"))]
    AddFinalizer { source: kube::Error, name: String },

    #[snafu(display("failed to remove the cleanup finalizer from Work {name:?}"))]
    RemoveFinalizer { source: kube::Error, name: String },

    #[snafu(display("failed to fetch or create the AppliedWork for Work {name:?}"))]
    EnsureAppliedWork { source: kube::Error, name: String },

    #[snafu(display("failed to list override snapshots from the hub"))]
    ListOverrides { source: kube::Error },

    #[snafu(display("failed to update the status of Work {name:?}"))]
    UpdateWorkStatus { source: kube::Error, name: String },

    #[snafu(display("failed to update the status of AppliedWork {name:?}"))]
    UpdateAppliedWorkStatus { source: kube::Error, name: String },

    #[snafu(display("failed to serialize a status document"))]
    SerializeStatus { source: serde_json::Error },

    #[snafu(display("failed to clean up resources no longer produced by Work {name:?}"))]
    RemoveLeftOvers {
        source: crate::tracker::Error,
        name: String,
    },

    #[snafu(display("failed to delete the AppliedWork for Work {name:?}"))]
    DeleteAppliedWork { source: kube::Error, name: String },

    #[snafu(display(
        "failed to remove the delete-dependents finalizer from AppliedWork {name:?}"
    ))]
    ReleaseAppliedWork { source: kube::Error, name: String },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AddFinalizer { source, .. }
            | Self::RemoveFinalizer { source, .. }
            | Self::EnsureAppliedWork { source, .. }
            | Self::ListOverrides { source }
            | Self::UpdateWorkStatus { source, .. }
            | Self::UpdateAppliedWorkStatus { source, .. }
            | Self::DeleteAppliedWork { source, .. }
            | Self::ReleaseAppliedWork { source, .. } => kube_error_is_transient(source),
            Self::SerializeStatus { .. } => false,
            Self::RemoveLeftOvers { .. } => true,
        }
    }
}

fn kube_error_is_transient(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => matches!(response.code, 409 | 429 | 500 | 503 | 504),
        _ => true,
    }
}

/// Flattens an error and its sources into one message for a condition.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(current) = source {
        message.push_str(": ");
        message.push_str(&current.to_string());
        source = current.source();
    }
    message
}

/// Outcome of the take-over gate for one manifest.
enum TakeoverGate {
    /// No live object, or the live object is already owned.
    NotNeeded,
    /// Adoption may proceed under the chosen apply method.
    Allowed,
    RefusedNever,
    RefusedDiff(Vec<PatchDetail>),
    RefusedCoOwnership,
}

pub struct WorkApplier {
    pub hub_client: Client,
    pub member_client: Client,
    /// The hub namespace reserved for this member cluster.
    pub work_namespace: String,
    pub cluster: MemberCluster,
    pub mapper: RestMapper,
    /// Re-enqueue interval driving continuous drift detection.
    pub sync_interval: Duration,
}

impl WorkApplier {
    pub fn works(&self) -> Api<Work> {
        Api::namespaced(self.hub_client.clone(), &self.work_namespace)
    }

    pub fn applied_works(&self) -> Api<AppliedWork> {
        Api::all(self.member_client.clone())
    }

    #[tracing::instrument(skip_all, fields(work = %work.name_any()))]
    pub async fn reconcile(&self, work: Arc<Work>) -> Result<Action> {
        if work.meta().deletion_timestamp.is_some() {
            return cleanup::run(self, &work).await;
        }

        self.ensure_finalizer(&work).await?;
        let applied_work = self.ensure_applied_work(&work).await?;

        let strategy = work.effective_apply_strategy();
        let index = self.load_override_index().await?;
        let generation = work.meta().generation.unwrap_or_default();

        let mut outcomes = Vec::new();
        let mut applied_resources = Vec::new();
        for decode_outcome in preprocess::decode_manifests(&work.spec.workload.manifests) {
            match decode_outcome {
                DecodeOutcome::Failed {
                    identifier,
                    failure,
                } => outcomes.push(ManifestOutcome {
                    identifier,
                    kind: match failure {
                        DecodeFailure::DecodingErred { message } => {
                            OutcomeKind::DecodingErred { message }
                        }
                        DecodeFailure::FoundGenerateName => OutcomeKind::FoundGenerateName,
                    },
                }),
                DecodeOutcome::Decoded(decoded) => {
                    let (outcome, applied) = self
                        .process_manifest(
                            decoded,
                            &strategy,
                            &applied_work,
                            &index,
                            work.status.as_ref(),
                            generation,
                        )
                        .await;
                    outcomes.push(outcome);
                    applied_resources.extend(applied);
                }
            }
        }

        let previously_applied = applied_work
            .status
            .clone()
            .unwrap_or_default()
            .applied_resources;
        let tracker = ResourceTracker {
            member_client: &self.member_client,
            mapper: &self.mapper,
        };
        tracker
            .remove_left_overs(&applied_work, &previously_applied, &applied_resources)
            .await
            .context(RemoveLeftOversSnafu {
                name: work.name_any(),
            })?;
        self.update_applied_work_status(&applied_work, applied_resources)
            .await?;

        let report_diff = strategy.type_ == ApplyStrategyType::ReportDiff;
        let transient_failure = outcomes.iter().any(|outcome| outcome.kind.is_transient());
        let new_status = StatusBuilder::new(
            work.status.as_ref(),
            generation,
            report_diff,
            Time(Utc::now()),
        )
        .build(&outcomes);
        self.update_work_status(&work, new_status).await?;

        if transient_failure {
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        Ok(Action::requeue(self.sync_interval))
    }

    async fn ensure_finalizer(&self, work: &Work) -> Result<()> {
        if work
            .finalizers()
            .iter()
            .any(|finalizer| finalizer == WORK_CLEANUP_FINALIZER)
        {
            return Ok(());
        }

        let mut finalizers = work.finalizers().to_vec();
        finalizers.push(WORK_CLEANUP_FINALIZER.to_owned());

        // The resourceVersion turns the merge patch into an optimistic
        // update; a concurrent finalizer change surfaces as a conflict and
        // re-runs the cycle.
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": work.resource_version(),
            },
        });
        self.works()
            .patch(&work.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(AddFinalizerSnafu {
                name: work.name_any(),
            })?;

        Ok(())
    }

    async fn ensure_applied_work(&self, work: &Work) -> Result<AppliedWork> {
        let name = work.name_any();
        let api = self.applied_works();

        if let Some(existing) = api.get_opt(&name).await.context(EnsureAppliedWorkSnafu {
            name: name.clone(),
        })? {
            if existing.spec.work_name != name
                || existing.spec.work_namespace != self.work_namespace
            {
                // Invariant violation: an AppliedWork of this name mirrors a
                // different Work. Keep reconciling; the next cycles converge
                // once the conflicting object is gone.
                tracing::error!(
                    applied_work = %name,
                    work_name = %existing.spec.work_name,
                    work_namespace = %existing.spec.work_namespace,
                    "AppliedWork mirrors a different Work"
                );
            }
            return Ok(existing);
        }

        // The delete-dependents finalizer holds the AppliedWork until every
        // listed resource has been released or removed, whichever path its
        // deletion comes from.
        let mut applied_work = AppliedWork::new(
            &name,
            AppliedWorkSpec {
                work_name: name.clone(),
                work_namespace: self.work_namespace.clone(),
            },
        );
        applied_work.metadata.finalizers = Some(vec![DELETE_DEPENDENTS_FINALIZER.to_owned()]);
        api.create(&PostParams::default(), &applied_work)
            .await
            .context(EnsureAppliedWorkSnafu { name })
    }

    async fn load_override_index(&self) -> Result<OverrideIndex> {
        let cluster_snapshots = Api::<ClusterResourceOverrideSnapshot>::all(self.hub_client.clone())
            .list(&ListParams::default())
            .await
            .context(ListOverridesSnafu)?;
        let resource_snapshots = Api::<ResourceOverrideSnapshot>::all(self.hub_client.clone())
            .list(&ListParams::default())
            .await
            .context(ListOverridesSnafu)?;

        Ok(OverrideIndex::new(
            cluster_snapshots.items,
            resource_snapshots.items,
        ))
    }

    async fn process_manifest(
        &self,
        decoded: DecodedManifest,
        strategy: &ApplyStrategy,
        applied_work: &AppliedWork,
        index: &OverrideIndex,
        previous_status: Option<&WorkStatus>,
        generation: i64,
    ) -> (ManifestOutcome, Option<AppliedResourceMeta>) {
        let DecodedManifest {
            mut identifier,
            gvk,
            mut manifest,
        } = decoded;

        match apply_overrides(&mut manifest, &identifier, &self.cluster, index) {
            Ok(OverrideVerdict::Keep) => {}
            Ok(OverrideVerdict::Skip) => {
                return (outcome(identifier, OutcomeKind::OverrideSkipped), None);
            }
            Err(error) => {
                return (
                    outcome(
                        identifier,
                        OutcomeKind::OverrideFailed {
                            message: error_chain(&error),
                        },
                    ),
                    None,
                );
            }
        }

        // REST mapping. A kind the member cluster does not serve cannot be
        // decoded into an applicable object; the periodic re-enqueue
        // retries in case a CRD is still registering.
        let (api_resource, scope) = match self.mapper.resolve(&gvk).await {
            Ok(resolved) => resolved,
            Err(error) => {
                return (
                    outcome(
                        identifier,
                        OutcomeKind::DecodingErred {
                            message: error_chain(&error),
                        },
                    ),
                    None,
                );
            }
        };
        identifier.resource = api_resource.plural.clone();
        let namespaced = matches!(scope, Scope::Namespaced);
        if namespaced {
            if identifier.namespace.is_empty() {
                identifier.namespace = "default".to_owned();
                manifest["metadata"]["namespace"] = json!("default");
            }
        } else {
            identifier.namespace.clear();
        }
        let api = self.dynamic_api(&api_resource, namespaced, &identifier.namespace);

        let live = match api.get_opt(&identifier.name).await {
            Ok(live) => live,
            Err(error) => {
                return (
                    outcome(
                        identifier,
                        OutcomeKind::FailedToApply {
                            message: error_chain(&error),
                            transient: kube_error_is_transient(&error),
                        },
                    ),
                    None,
                );
            }
        };

        let applied_work_uid = applied_work.uid().unwrap_or_default();
        let owned = live.as_ref().is_some_and(|live| {
            live.owner_references()
                .iter()
                .any(|reference| is_fleet_owner(reference) && reference.uid == applied_work_uid)
        });

        let gate = self.takeover_gate(strategy, live.as_ref(), owned, &manifest);

        if strategy.type_ == ApplyStrategyType::ReportDiff {
            return self
                .report_diff(
                    &api, identifier, &manifest, live.as_ref(), strategy, applied_work, owned,
                    &gate,
                )
                .await;
        }

        match gate {
            TakeoverGate::NotNeeded | TakeoverGate::Allowed => {}
            TakeoverGate::RefusedNever => {
                return (outcome(identifier, OutcomeKind::NotTakenOver), None);
            }
            TakeoverGate::RefusedDiff(diffs) => {
                return (outcome(identifier, OutcomeKind::FailedToTakeOver { diffs }), None);
            }
            TakeoverGate::RefusedCoOwnership => {
                return (
                    outcome(
                        identifier,
                        OutcomeKind::FailedToApply {
                            message: "the live object is owned by other controllers and the \
                                      strategy does not allow co-ownership"
                                .to_owned(),
                            transient: false,
                        },
                    ),
                    None,
                );
            }
        }

        // Co-ownership is also policed on resources already owned: foreign
        // references appearing later violate the strategy just the same.
        if owned && !strategy.allow_co_ownership {
            let has_foreign_owners = live.as_ref().is_some_and(|live| {
                live.owner_references()
                    .iter()
                    .any(|reference| !is_fleet_owner(reference))
            });
            if has_foreign_owners {
                return (
                    outcome(
                        identifier,
                        OutcomeKind::FailedToApply {
                            message: "the applied object gained owner references from other \
                                      controllers and the strategy does not allow co-ownership"
                                .to_owned(),
                            transient: false,
                        },
                    ),
                    None,
                );
            }
        }

        // Drift gate: hold the apply while the live object deviates from
        // the last apply, unless the Work spec changed since.
        if owned
            && strategy.when_to_apply == WhenToApply::IfNotDrifted
            && generation_unchanged(previous_status, &identifier, generation)
        {
            if let Some(live_object) = &live {
                let drifts = drift_details(&manifest, live_object, strategy);
                if !drifts.is_empty() {
                    return (outcome(identifier, OutcomeKind::FoundDrifts { drifts }), None);
                }
            }
        }

        let live_references = live
            .as_ref()
            .map(|live| live.owner_references().to_vec())
            .unwrap_or_default();
        let references =
            merged_owner_references(&live_references, fleet_owner_reference(applied_work));
        let mut desired = manifest;
        match serde_json::to_value(&references) {
            Ok(value) => desired["metadata"]["ownerReferences"] = value,
            Err(error) => {
                return (
                    outcome(
                        identifier,
                        OutcomeKind::FailedToApply {
                            message: error_chain(&error),
                            transient: false,
                        },
                    ),
                    None,
                );
            }
        }

        let applied = match strategy.type_ {
            ApplyStrategyType::ClientSideApply => {
                client_side_apply(&api, &identifier.name, &desired, live.as_ref())
                    .await
                    .map(|(applied, _method)| applied)
            }
            ApplyStrategyType::ServerSideApply => {
                server_side_apply(&api, &identifier.name, &desired).await
            }
            ApplyStrategyType::ReportDiff => unreachable!("handled before the apply branch"),
        };

        match applied {
            Ok(applied_object) => {
                let availability = check_availability(&applied_object);
                let applied_meta = AppliedResourceMeta {
                    identifier: identifier.clone(),
                    uid: applied_object.uid().unwrap_or_default(),
                };
                (
                    outcome(identifier, OutcomeKind::Applied { availability }),
                    Some(applied_meta),
                )
            }
            Err(error) => {
                let transient = error.is_transient();
                (
                    outcome(
                        identifier,
                        OutcomeKind::FailedToApply {
                            message: error_chain(&error),
                            transient,
                        },
                    ),
                    None,
                )
            }
        }
    }

    fn takeover_gate(
        &self,
        strategy: &ApplyStrategy,
        live: Option<&DynamicObject>,
        owned: bool,
        manifest: &Value,
    ) -> TakeoverGate {
        let Some(live_object) = live else {
            return TakeoverGate::NotNeeded;
        };
        if owned {
            return TakeoverGate::NotNeeded;
        }

        if strategy.when_to_take_over == WhenToTakeOver::Never {
            return TakeoverGate::RefusedNever;
        }

        let has_foreign_owners = live_object
            .owner_references()
            .iter()
            .any(|reference| !is_fleet_owner(reference));
        if has_foreign_owners && !strategy.allow_co_ownership {
            return TakeoverGate::RefusedCoOwnership;
        }

        if strategy.when_to_take_over == WhenToTakeOver::IfNoDiff {
            let diffs = diff_details(manifest, live_object, strategy);
            if diffs.is_empty() {
                TakeoverGate::Allowed
            } else {
                TakeoverGate::RefusedDiff(diffs)
            }
        } else {
            TakeoverGate::Allowed
        }
    }

    /// ReportDiff mode: never mutate, but claim ownership where takeover is
    /// permitted so that a later strategy switch can garbage collect.
    #[allow(clippy::too_many_arguments)]
    async fn report_diff(
        &self,
        api: &Api<DynamicObject>,
        identifier: WorkResourceIdentifier,
        manifest: &Value,
        live: Option<&DynamicObject>,
        strategy: &ApplyStrategy,
        applied_work: &AppliedWork,
        owned: bool,
        gate: &TakeoverGate,
    ) -> (ManifestOutcome, Option<AppliedResourceMeta>) {
        let diffs = match live {
            Some(live_object) => diff_details(manifest, live_object, strategy),
            // The object does not exist at all: everything the manifest
            // carries is missing.
            None => full_compare(
                &last_applied_snapshot(manifest),
                &Value::Object(serde_json::Map::new()),
            ),
        };

        let mut applied_meta = None;
        if let Some(live_object) = live {
            if owned {
                applied_meta = Some(AppliedResourceMeta {
                    identifier: identifier.clone(),
                    uid: live_object.uid().unwrap_or_default(),
                });
            } else if matches!(gate, TakeoverGate::Allowed) {
                let namespace =
                    (!identifier.namespace.is_empty()).then_some(identifier.namespace.as_str());
                let api_version = if identifier.group.is_empty() {
                    identifier.version.clone()
                } else {
                    format!("{}/{}", identifier.group, identifier.version)
                };
                match claim_ownership(
                    api,
                    &api_version,
                    &identifier.kind,
                    &identifier.name,
                    namespace,
                    &fleet_owner_reference(applied_work),
                )
                .await
                {
                    Ok(claimed) => {
                        applied_meta = Some(AppliedResourceMeta {
                            identifier: identifier.clone(),
                            uid: claimed.uid().unwrap_or_default(),
                        });
                    }
                    Err(error) => {
                        let transient = error.is_transient();
                        return (
                            outcome(
                                identifier,
                                OutcomeKind::FailedToApply {
                                    message: error_chain(&error),
                                    transient,
                                },
                            ),
                            None,
                        );
                    }
                }
            }
        }

        (
            outcome(identifier, OutcomeKind::DiffReported { diffs }),
            applied_meta,
        )
    }

    fn dynamic_api(
        &self,
        api_resource: &ApiResource,
        namespaced: bool,
        namespace: &str,
    ) -> Api<DynamicObject> {
        if namespaced {
            Api::namespaced_with(self.member_client.clone(), namespace, api_resource)
        } else {
            Api::all_with(self.member_client.clone(), api_resource)
        }
    }

    async fn update_work_status(&self, work: &Work, new_status: WorkStatus) -> Result<()> {
        if work.status.as_ref() == Some(&new_status) {
            return Ok(());
        }

        let mut updated = work.clone();
        updated.status = Some(new_status);
        updated.metadata.managed_fields = None;

        let data = serde_json::to_vec(&updated).context(SerializeStatusSnafu)?;
        self.works()
            .replace_status(&work.name_any(), &PostParams::default(), data)
            .await
            .context(UpdateWorkStatusSnafu {
                name: work.name_any(),
            })?;

        Ok(())
    }

    async fn update_applied_work_status(
        &self,
        applied_work: &AppliedWork,
        applied: Vec<AppliedResourceMeta>,
    ) -> Result<()> {
        let new_status = crate::tracker::build_applied_work_status(applied);
        if applied_work.status.as_ref() == Some(&new_status) {
            return Ok(());
        }

        let mut updated = applied_work.clone();
        updated.status = Some(new_status);
        updated.metadata.managed_fields = None;

        let data = serde_json::to_vec(&updated).context(SerializeStatusSnafu)?;
        self.applied_works()
            .replace_status(&applied_work.name_any(), &PostParams::default(), data)
            .await
            .context(UpdateAppliedWorkStatusSnafu {
                name: applied_work.name_any(),
            })?;

        Ok(())
    }
}

fn outcome(identifier: WorkResourceIdentifier, kind: OutcomeKind) -> ManifestOutcome {
    ManifestOutcome { identifier, kind }
}

/// Whether the Work spec is unchanged since this manifest was last
/// reconciled; a changed generation overrides the drift gate.
fn generation_unchanged(
    previous_status: Option<&WorkStatus>,
    identifier: &WorkResourceIdentifier,
    generation: i64,
) -> bool {
    previous_status
        .and_then(|status| {
            status.manifest_conditions.iter().find(|candidate| {
                candidate.identifier.ordinal == identifier.ordinal
                    && candidate.identifier.same_object(identifier)
            })
        })
        .and_then(|manifest_condition| {
            condition::find_condition(&manifest_condition.conditions, CONDITION_TYPE_APPLIED)
        })
        .and_then(|applied| applied.observed_generation)
        == Some(generation)
}

/// Diff: live against the desired (post-override) manifest.
fn diff_details(
    desired: &Value,
    live: &DynamicObject,
    strategy: &ApplyStrategy,
) -> Vec<PatchDetail> {
    let live_value = serde_json::to_value(live).unwrap_or_default();
    let baseline = last_applied_snapshot(desired);

    match strategy.comparison_option {
        ComparisonOption::PartialComparison => masked_compare(&baseline, &live_value, &baseline),
        ComparisonOption::FullComparison => full_compare(&baseline, &live_value),
    }
}

/// Drift: live against the most recent successful apply.
fn drift_details(
    desired: &Value,
    live: &DynamicObject,
    strategy: &ApplyStrategy,
) -> Vec<PatchDetail> {
    let live_value = serde_json::to_value(live).unwrap_or_default();

    // The client-side path records its last apply in the annotation; the
    // server-side path expresses it through managed fields against the
    // current desired state.
    let recorded = last_applied_of(live);
    let baseline = if strategy.type_ == ApplyStrategyType::ClientSideApply
        && recorded.as_object().is_some_and(|entries| !entries.is_empty())
    {
        recorded
    } else {
        last_applied_snapshot(desired)
    };

    match strategy.comparison_option {
        ComparisonOption::PartialComparison => {
            let mask = if strategy.type_ == ApplyStrategyType::ServerSideApply {
                manager_fields_mask(&live_value, WORK_FIELD_MANAGER).unwrap_or_else(|| baseline.clone())
            } else {
                baseline.clone()
            };
            masked_compare(&baseline, &live_value, &mask)
        }
        ComparisonOption::FullComparison => full_compare(&baseline, &live_value),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use fleet_work_api::{constants::LAST_APPLIED_CONFIG_ANNOTATION, work::ManifestCondition};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

    use super::*;

    fn identifier(ordinal: usize) -> WorkResourceIdentifier {
        WorkResourceIdentifier {
            ordinal,
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
            resource: "deployments".into(),
            namespace: "ns-x".into(),
            name: "d".into(),
        }
    }

    fn status_with_applied_at(generation: i64) -> WorkStatus {
        WorkStatus {
            conditions: vec![],
            manifest_conditions: vec![ManifestCondition {
                identifier: identifier(0),
                conditions: vec![Condition {
                    type_: CONDITION_TYPE_APPLIED.into(),
                    status: "True".into(),
                    reason: "ManifestApplied".into(),
                    message: String::new(),
                    observed_generation: Some(generation),
                    last_transition_time: Time(chrono::DateTime::from_timestamp(0, 0).unwrap()),
                }],
                drift_details: None,
                diff_details: None,
            }],
        }
    }

    #[test]
    fn unchanged_generation_keeps_the_drift_gate_closed() {
        let status = status_with_applied_at(3);

        assert!(generation_unchanged(Some(&status), &identifier(0), 3));
        assert!(!generation_unchanged(Some(&status), &identifier(0), 4));
        assert!(!generation_unchanged(None, &identifier(0), 3));
    }

    #[test]
    fn drift_prefers_the_last_applied_annotation_for_csa() {
        let strategy = ApplyStrategy::default();
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns-x"},
            "data": {"key": "desired"},
        });
        let snapshot = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns-x"},
            "data": {"key": "applied"},
        });
        let live: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "ns-x",
                "annotations": {
                    LAST_APPLIED_CONFIG_ANNOTATION: serde_json::to_string(&snapshot).unwrap(),
                },
            },
            "data": {"key": "drifted"},
        }))
        .expect("valid object");

        let drifts = drift_details(&desired, &live, &strategy);

        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].path, "/data/key");
        // Drift is measured against the recorded apply, not the new spec.
        assert_eq!(drifts[0].value_in_hub.as_deref(), Some("applied"));
        assert_eq!(drifts[0].value_in_member.as_deref(), Some("drifted"));
    }

    #[test]
    fn diff_partial_comparison_ignores_server_defaults() {
        let strategy = ApplyStrategy::default();
        let desired = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "ns-x"},
            "spec": {"replicas": 1},
        });
        let live: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "ns-x", "uid": "123"},
            "spec": {"replicas": 2, "progressDeadlineSeconds": 600},
        }))
        .expect("valid object");

        let diffs = diff_details(&desired, &live, &strategy);

        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "/spec/replicas");
        assert_eq!(diffs[0].value_in_hub.as_deref(), Some("1"));
        assert_eq!(diffs[0].value_in_member.as_deref(), Some("2"));
    }
}
