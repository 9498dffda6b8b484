//! The apply strategy: how manifests reach the member cluster and how the
//! agent reacts to pre-existing or drifted objects.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Policy for one Work describing the apply method, the comparison scope for
/// drift and diff detection, and the takeover behavior for pre-existing
/// objects.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyStrategy {
    /// The apply method, or diff-only reporting.
    #[serde(default, rename = "type")]
    pub type_: ApplyStrategyType,

    /// Which fields participate in drift and diff comparison.
    #[serde(default)]
    pub comparison_option: ComparisonOption,

    /// Whether a detected drift blocks re-apply.
    #[serde(default)]
    pub when_to_apply: WhenToApply,

    /// Whether and when a pre-existing, unowned object is adopted.
    #[serde(default)]
    pub when_to_take_over: WhenToTakeOver,

    /// Whether applied resources may carry owner references besides the
    /// AppliedWork.
    #[serde(default)]
    pub allow_co_ownership: bool,
}

impl Default for ApplyStrategy {
    fn default() -> Self {
        Self {
            type_: ApplyStrategyType::default(),
            comparison_option: ComparisonOption::default(),
            when_to_apply: WhenToApply::default(),
            when_to_take_over: WhenToTakeOver::default(),
            allow_co_ownership: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ApplyStrategyType {
    /// Three-way merge between the last applied configuration, the live
    /// object, and the desired manifest. Falls back to server-side apply
    /// when the manifest exceeds the annotation size budget.
    #[default]
    ClientSideApply,

    /// Server-side apply with the agent's field manager and `force=true`.
    ServerSideApply,

    /// Never mutate the live object; only report the diff between live and
    /// desired state.
    ReportDiff,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ComparisonOption {
    /// Compare only the fields the agent would set.
    #[default]
    PartialComparison,

    /// Compare the full object apart from system-managed metadata.
    FullComparison,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum WhenToApply {
    /// Apply on every cycle, overwriting drift in managed fields.
    #[default]
    Always,

    /// Hold the apply while a drift is present; a Work spec change (new
    /// generation) overwrites regardless.
    IfNotDrifted,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum WhenToTakeOver {
    /// Adopt pre-existing objects unconditionally.
    #[default]
    Always,

    /// Adopt only when the live object matches the desired manifest under
    /// the comparison option.
    IfNoDiff,

    /// Never adopt pre-existing objects.
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_strategy_uses_defaults() {
        let strategy: ApplyStrategy = serde_yaml::from_str("{}").expect("valid YAML");

        assert_eq!(strategy.type_, ApplyStrategyType::ClientSideApply);
        assert_eq!(strategy.comparison_option, ComparisonOption::PartialComparison);
        assert_eq!(strategy.when_to_apply, WhenToApply::Always);
        assert_eq!(strategy.when_to_take_over, WhenToTakeOver::Always);
        assert!(!strategy.allow_co_ownership);
    }

    #[test]
    fn strategy_round_trips_in_camel_case() {
        let strategy: ApplyStrategy = serde_yaml::from_str(
            "
type: ReportDiff
comparisonOption: FullComparison
whenToApply: IfNotDrifted
whenToTakeOver: IfNoDiff
allowCoOwnership: true
",
        )
        .expect("valid YAML");

        assert_eq!(strategy.type_, ApplyStrategyType::ReportDiff);
        assert_eq!(strategy.comparison_option, ComparisonOption::FullComparison);
        assert_eq!(strategy.when_to_apply, WhenToApply::IfNotDrifted);
        assert_eq!(strategy.when_to_take_over, WhenToTakeOver::IfNoDiff);
        assert!(strategy.allow_co_ownership);

        let serialized = serde_json::to_value(&strategy).expect("serializable");
        assert_eq!(serialized["type"], "ReportDiff");
        assert_eq!(serialized["whenToTakeOver"], "IfNoDiff");
    }
}
