//! Builds Work status from the per-manifest outcomes of one cycle.
//!
//! Conditions are stamped with the Work generation they were observed at;
//! transition times carry over while status and reason stay unchanged, and
//! drift/diff first-observed times survive as long as the deviation stays
//! present.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use fleet_work_api::{
    condition::{
        self, CONDITION_TYPE_APPLIED, CONDITION_TYPE_AVAILABLE, CONDITION_TYPE_DIFF_REPORTED,
        REASON_DECODING_ERRED, REASON_FAILED_TO_APPLY, REASON_FAILED_TO_TAKE_OVER,
        REASON_FOUND_DIFF, REASON_FOUND_DRIFTS, REASON_FOUND_GENERATE_NAME,
        REASON_MANIFEST_APPLIED, REASON_MANIFEST_AVAILABLE, REASON_MANIFEST_NOT_YET_AVAILABLE,
        REASON_MANIFEST_UNTRACKABLE, REASON_NOT_TAKEN_OVER, REASON_NO_DIFF_FOUND,
        REASON_OVERRIDE_FAILED, REASON_OVERRIDE_SKIPPED, REASON_WORK_APPLIED,
        REASON_WORK_AVAILABLE, REASON_WORK_DIFF_NOT_REPORTED, REASON_WORK_DIFF_REPORTED,
        REASON_WORK_NOT_APPLIED, REASON_WORK_NOT_AVAILABLE,
    },
    work::{
        DiffDetails, DriftDetails, ManifestCondition, PatchDetail, WorkResourceIdentifier,
        WorkStatus,
    },
};

use super::availability::Availability;

/// What happened to one manifest during a cycle.
#[derive(Clone, Debug)]
pub struct ManifestOutcome {
    pub identifier: WorkResourceIdentifier,
    pub kind: OutcomeKind,
}

#[derive(Clone, Debug)]
pub enum OutcomeKind {
    /// The manifest could not be decoded; terminal until the spec changes.
    DecodingErred { message: String },

    /// The manifest relies on `generateName`; terminal until the spec
    /// changes.
    FoundGenerateName,

    /// A delete override removed the manifest from this cluster.
    OverrideSkipped,

    /// An override rule failed; user error, not retried.
    OverrideFailed { message: String },

    /// A live, unowned object exists and the strategy forbids takeover.
    NotTakenOver,

    /// Takeover was gated on an empty diff and the diff was not empty.
    FailedToTakeOver { diffs: Vec<PatchDetail> },

    FailedToApply { message: String, transient: bool },

    /// The strategy holds the apply while the live object has drifted.
    FoundDrifts { drifts: Vec<PatchDetail> },

    Applied { availability: Availability },

    /// ReportDiff mode: the live object was compared but never mutated.
    DiffReported { diffs: Vec<PatchDetail> },
}

impl OutcomeKind {
    /// Skipped manifests are excluded from aggregate accounting.
    fn counts_toward_aggregate(&self) -> bool {
        !matches!(self, Self::OverrideSkipped)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FailedToApply { transient: true, .. })
    }
}

pub struct StatusBuilder<'a> {
    previous: Option<&'a WorkStatus>,
    generation: i64,
    report_diff: bool,
    now: Time,
}

impl<'a> StatusBuilder<'a> {
    pub fn new(
        previous: Option<&'a WorkStatus>,
        generation: i64,
        report_diff: bool,
        now: Time,
    ) -> Self {
        Self {
            previous,
            generation,
            report_diff,
            now,
        }
    }

    pub fn build(&self, outcomes: &[ManifestOutcome]) -> WorkStatus {
        WorkStatus {
            conditions: self.aggregate_conditions(outcomes),
            manifest_conditions: outcomes
                .iter()
                .map(|outcome| self.manifest_condition(outcome))
                .collect(),
        }
    }

    fn manifest_condition(&self, outcome: &ManifestOutcome) -> ManifestCondition {
        let previous = self.previous.and_then(|status| {
            status.manifest_conditions.iter().find(|candidate| {
                candidate.identifier.ordinal == outcome.identifier.ordinal
                    && candidate.identifier.same_object(&outcome.identifier)
            })
        });

        let mut conditions = previous
            .map(|previous| previous.conditions.clone())
            .unwrap_or_default();
        let mut drift_details = None;
        let mut diff_details = None;
        let mut set_types = Vec::new();

        match &outcome.kind {
            OutcomeKind::DecodingErred { message } => {
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_DECODING_ERRED,
                    message.clone(),
                );
            }
            OutcomeKind::FoundGenerateName => {
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_FOUND_GENERATE_NAME,
                    "the manifest uses generateName without a name; a stable identity is \
                     required for drift detection and garbage collection"
                        .to_owned(),
                );
            }
            OutcomeKind::OverrideSkipped => {
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_OVERRIDE_SKIPPED,
                    "a delete override excludes this manifest from this cluster".to_owned(),
                );
            }
            OutcomeKind::OverrideFailed { message } => {
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_OVERRIDE_FAILED,
                    message.clone(),
                );
            }
            OutcomeKind::NotTakenOver => {
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_NOT_TAKEN_OVER,
                    "an unowned object with this identity already exists and the strategy \
                     forbids takeover"
                        .to_owned(),
                );
            }
            OutcomeKind::FailedToTakeOver { diffs } => {
                diff_details =
                    self.carried_diff_details(previous.and_then(|p| p.diff_details.as_ref()), diffs);
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_FAILED_TO_TAKE_OVER,
                    format!(
                        "the pre-existing object differs from the manifest in {} field(s)",
                        diffs.len()
                    ),
                );
            }
            OutcomeKind::FailedToApply { message, .. } => {
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_FAILED_TO_APPLY,
                    message.clone(),
                );
            }
            OutcomeKind::FoundDrifts { drifts } => {
                drift_details = self
                    .carried_drift_details(previous.and_then(|p| p.drift_details.as_ref()), drifts);
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    false,
                    REASON_FOUND_DRIFTS,
                    format!(
                        "the live object has drifted in {} field(s); the strategy holds the \
                         apply until the Work spec changes",
                        drifts.len()
                    ),
                );
            }
            OutcomeKind::Applied { availability } => {
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_APPLIED,
                    true,
                    REASON_MANIFEST_APPLIED,
                    "the manifest was applied to the member cluster".to_owned(),
                );
                let (available, reason, message) = match availability {
                    Availability::Available => (
                        true,
                        REASON_MANIFEST_AVAILABLE,
                        "the applied resource is available",
                    ),
                    Availability::NotYetAvailable => (
                        false,
                        REASON_MANIFEST_NOT_YET_AVAILABLE,
                        "the applied resource has not reached its desired state yet",
                    ),
                    Availability::Untrackable => (
                        true,
                        REASON_MANIFEST_UNTRACKABLE,
                        "the resource kind reports no readiness; it is available once applied",
                    ),
                };
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_AVAILABLE,
                    available,
                    reason,
                    message.to_owned(),
                );
            }
            OutcomeKind::DiffReported { diffs } => {
                diff_details =
                    self.carried_diff_details(previous.and_then(|p| p.diff_details.as_ref()), diffs);
                let (reason, message) = if diffs.is_empty() {
                    (
                        REASON_NO_DIFF_FOUND,
                        "the live object matches the manifest".to_owned(),
                    )
                } else {
                    (
                        REASON_FOUND_DIFF,
                        format!(
                            "the live object differs from the manifest in {} field(s)",
                            diffs.len()
                        ),
                    )
                };
                self.set(
                    &mut conditions,
                    &mut set_types,
                    CONDITION_TYPE_DIFF_REPORTED,
                    true,
                    reason,
                    message,
                );
            }
        }

        conditions.retain(|candidate| set_types.contains(&candidate.type_));

        ManifestCondition {
            identifier: outcome.identifier.clone(),
            conditions,
            drift_details,
            diff_details,
        }
    }

    fn aggregate_conditions(&self, outcomes: &[ManifestOutcome]) -> Vec<Condition> {
        let mut conditions = self
            .previous
            .map(|status| status.conditions.clone())
            .unwrap_or_default();
        let mut set_types = Vec::new();

        let counted: Vec<_> = outcomes
            .iter()
            .filter(|outcome| outcome.kind.counts_toward_aggregate())
            .collect();

        if self.report_diff {
            let reported = counted
                .iter()
                .filter(|outcome| matches!(outcome.kind, OutcomeKind::DiffReported { .. }))
                .count();
            let all_reported = reported == counted.len();
            let (reason, message) = if all_reported {
                (
                    REASON_WORK_DIFF_REPORTED,
                    format!("diffs reported for all {reported} manifest(s)"),
                )
            } else {
                (
                    REASON_WORK_DIFF_NOT_REPORTED,
                    format!(
                        "diffs reported for {reported} of {total} manifest(s)",
                        total = counted.len()
                    ),
                )
            };
            self.set(
                &mut conditions,
                &mut set_types,
                CONDITION_TYPE_DIFF_REPORTED,
                all_reported,
                reason,
                message,
            );
        } else {
            let applied = counted
                .iter()
                .filter(|outcome| matches!(outcome.kind, OutcomeKind::Applied { .. }))
                .count();
            let all_applied = applied == counted.len();
            let (reason, message) = if all_applied {
                (
                    REASON_WORK_APPLIED,
                    format!("all {applied} manifest(s) are applied"),
                )
            } else {
                (
                    REASON_WORK_NOT_APPLIED,
                    format!(
                        "{applied} of {total} manifest(s) are applied",
                        total = counted.len()
                    ),
                )
            };
            self.set(
                &mut conditions,
                &mut set_types,
                CONDITION_TYPE_APPLIED,
                all_applied,
                reason,
                message,
            );

            let available = counted
                .iter()
                .filter(|outcome| {
                    matches!(
                        outcome.kind,
                        OutcomeKind::Applied {
                            availability: Availability::Available | Availability::Untrackable
                        }
                    )
                })
                .count();
            let all_available = all_applied && available == counted.len();
            let (reason, message) = if all_available {
                (
                    REASON_WORK_AVAILABLE,
                    format!("all {available} applied resource(s) are available"),
                )
            } else {
                (
                    REASON_WORK_NOT_AVAILABLE,
                    format!(
                        "{available} of {total} applied resource(s) are available",
                        total = counted.len()
                    ),
                )
            };
            self.set(
                &mut conditions,
                &mut set_types,
                CONDITION_TYPE_AVAILABLE,
                all_available,
                reason,
                message,
            );
        }

        conditions.retain(|candidate| set_types.contains(&candidate.type_));
        conditions
    }

    fn set(
        &self,
        conditions: &mut Vec<Condition>,
        set_types: &mut Vec<String>,
        type_: &str,
        status: bool,
        reason: &str,
        message: String,
    ) {
        condition::set_condition(
            conditions,
            Condition {
                type_: type_.to_owned(),
                status: if status { "True" } else { "False" }.to_owned(),
                reason: reason.to_owned(),
                message,
                observed_generation: Some(self.generation),
                last_transition_time: self.now.clone(),
            },
        );
        set_types.push(type_.to_owned());
    }

    fn carried_drift_details(
        &self,
        previous: Option<&DriftDetails>,
        drifts: &[PatchDetail],
    ) -> Option<DriftDetails> {
        if drifts.is_empty() {
            return None;
        }

        Some(DriftDetails {
            observation_time: self.now.clone(),
            first_drifted_observed_time: previous
                .map(|previous| previous.first_drifted_observed_time.clone())
                .unwrap_or_else(|| self.now.clone()),
            observed_drifts: drifts.to_vec(),
        })
    }

    fn carried_diff_details(
        &self,
        previous: Option<&DiffDetails>,
        diffs: &[PatchDetail],
    ) -> Option<DiffDetails> {
        if diffs.is_empty() {
            return None;
        }

        Some(DiffDetails {
            observation_time: self.now.clone(),
            first_diffed_observed_time: previous
                .map(|previous| previous.first_diffed_observed_time.clone())
                .unwrap_or_else(|| self.now.clone()),
            observed_diffs: diffs.to_vec(),
        })
    }
}
