//! Condition types and reasons reported on Work and per-manifest status.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

/// Condition type: the manifests of a Work (or a single manifest) have been
/// applied to the member cluster.
pub const CONDITION_TYPE_APPLIED: &str = "Applied";

/// Condition type: the applied resources (or a single resource) are
/// available according to their kind-specific availability check.
pub const CONDITION_TYPE_AVAILABLE: &str = "Available";

/// Condition type: diff reporting has completed for the Work (or a single
/// manifest) while the ReportDiff strategy is in effect.
pub const CONDITION_TYPE_DIFF_REPORTED: &str = "DiffReported";

// Per-manifest condition reasons. `DecodingErred` and `FoundGenerateName`
// stay terminal until the Work spec changes; everything else is re-evaluated
// on every cycle.
pub const REASON_MANIFEST_APPLIED: &str = "ManifestApplied";
pub const REASON_MANIFEST_AVAILABLE: &str = "ManifestAvailable";
pub const REASON_MANIFEST_NOT_YET_AVAILABLE: &str = "ManifestNotYetAvailable";
pub const REASON_MANIFEST_UNTRACKABLE: &str = "ManifestAvailabilityUntrackable";
pub const REASON_DECODING_ERRED: &str = "DecodingErred";
pub const REASON_FOUND_GENERATE_NAME: &str = "FoundGenerateName";
pub const REASON_NOT_TAKEN_OVER: &str = "NotTakenOver";
pub const REASON_FAILED_TO_TAKE_OVER: &str = "FailedToTakeOver";
pub const REASON_FAILED_TO_APPLY: &str = "FailedToApply";
pub const REASON_FOUND_DRIFTS: &str = "FoundDrifts";
pub const REASON_FOUND_DIFF: &str = "FoundDiff";
pub const REASON_NO_DIFF_FOUND: &str = "NoDiffFound";
pub const REASON_OVERRIDE_SKIPPED: &str = "Overridden";
pub const REASON_OVERRIDE_FAILED: &str = "FailedToApplyOverrides";

// Aggregate Work condition reasons.
pub const REASON_WORK_APPLIED: &str = "AllManifestsApplied";
pub const REASON_WORK_NOT_APPLIED: &str = "SomeManifestsNotApplied";
pub const REASON_WORK_AVAILABLE: &str = "AllManifestsAvailable";
pub const REASON_WORK_NOT_AVAILABLE: &str = "SomeManifestsNotAvailable";
pub const REASON_WORK_DIFF_REPORTED: &str = "AllManifestDiffsReported";
pub const REASON_WORK_DIFF_NOT_REPORTED: &str = "SomeManifestDiffsNotReported";

/// Looks up a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

/// Returns whether `conditions` contains a condition of the given type with
/// status `True` that was observed at `generation`. Conditions stamped with
/// an older generation are stale and treated as unknown.
pub fn is_condition_true_at(conditions: &[Condition], type_: &str, generation: i64) -> bool {
    find_condition(conditions, type_).is_some_and(|condition| {
        condition.status == "True" && condition.observed_generation == Some(generation)
    })
}

/// Replaces the condition of the same type in `conditions`, or appends it.
/// `last_transition_time` is carried over when neither status nor reason
/// changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions
        .iter_mut()
        .find(|existing| existing.type_ == condition.type_)
    {
        Some(existing) => {
            let transition_time = if existing.status == condition.status
                && existing.reason == condition.reason
            {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..condition
            };
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn condition(type_: &str, status: &str, reason: &str, seconds: i64) -> Condition {
        Condition {
            type_: type_.to_owned(),
            status: status.to_owned(),
            reason: reason.to_owned(),
            message: String::new(),
            observed_generation: Some(1),
            last_transition_time: Time(
                chrono::DateTime::from_timestamp(seconds, 0).expect("valid timestamp"),
            ),
        }
    }

    #[test]
    fn transition_time_kept_when_status_unchanged() {
        let mut conditions = vec![condition(
            CONDITION_TYPE_APPLIED,
            "True",
            REASON_WORK_APPLIED,
            100,
        )];

        set_condition(
            &mut conditions,
            condition(CONDITION_TYPE_APPLIED, "True", REASON_WORK_APPLIED, 200),
        );

        assert_eq!(
            conditions[0].last_transition_time,
            Time(chrono::DateTime::from_timestamp(100, 0).unwrap())
        );
    }

    #[test]
    fn transition_time_updated_on_status_change() {
        let mut conditions = vec![condition(
            CONDITION_TYPE_APPLIED,
            "True",
            REASON_WORK_APPLIED,
            100,
        )];

        set_condition(
            &mut conditions,
            condition(
                CONDITION_TYPE_APPLIED,
                "False",
                REASON_WORK_NOT_APPLIED,
                200,
            ),
        );

        assert_eq!(
            conditions[0].last_transition_time,
            Time(chrono::DateTime::from_timestamp(200, 0).unwrap())
        );
        assert_eq!(conditions[0].status, "False");
    }

    #[test]
    fn stale_generation_is_not_true() {
        let conditions = vec![condition(
            CONDITION_TYPE_APPLIED,
            "True",
            REASON_WORK_APPLIED,
            100,
        )];

        assert!(is_condition_true_at(&conditions, CONDITION_TYPE_APPLIED, 1));
        assert!(!is_condition_true_at(&conditions, CONDITION_TYPE_APPLIED, 2));
    }
}
