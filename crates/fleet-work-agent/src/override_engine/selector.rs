//! Client-side evaluation of [`LabelSelector`]s against a member cluster's
//! label set.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use snafu::Snafu;

use fleet_work_api::overrides::ClusterSelector;

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    BinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    UnaryOperatorWithValues { operator: String },

    #[snafu(display("label selector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },
}

/// Whether `labels` satisfies `selector`. An empty selector (no match
/// labels, no expressions) matches everything.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(requirements) = &selector.match_expressions {
        for requirement in requirements {
            let values = requirement.values.as_deref().unwrap_or_default();
            let actual = labels.get(&requirement.key);

            let matches = match requirement.operator.as_str() {
                operator @ ("In" | "NotIn") => {
                    if values.is_empty() {
                        return BinaryOperatorWithoutValuesSnafu {
                            operator: operator.to_owned(),
                        }
                        .fail();
                    }
                    let contained = actual.is_some_and(|actual| values.contains(actual));
                    match operator {
                        "In" => contained,
                        // A missing key satisfies NotIn.
                        _ => !contained,
                    }
                }
                operator @ ("Exists" | "DoesNotExist") => {
                    if !values.is_empty() {
                        return UnaryOperatorWithValuesSnafu {
                            operator: operator.to_owned(),
                        }
                        .fail();
                    }
                    match operator {
                        "Exists" => actual.is_some(),
                        _ => actual.is_none(),
                    }
                }
                operator => {
                    return InvalidOperatorSnafu {
                        operator: operator.to_owned(),
                    }
                    .fail();
                }
            };

            if !matches {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

/// Whether the member cluster matches the [`ClusterSelector`]. The cluster
/// matches when any term matches; a selector without terms matches every
/// cluster.
pub fn cluster_selector_matches(
    selector: &ClusterSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    if selector.selector_terms.is_empty() {
        return Ok(true);
    }

    for term in &selector.selector_terms {
        if selector_matches(&term.label_selector, labels)? {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use rstest::rstest;

    use fleet_work_api::overrides::ClusterSelectorTerm;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_owned(),
            operator: operator.to_owned(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|value| (*value).to_owned()).collect())
            },
        }
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();

        assert!(selector_matches(&selector, &labels(&[])).unwrap());
        assert!(selector_matches(&selector, &labels(&[("a", "b")])).unwrap());
    }

    #[test]
    fn match_labels_require_exact_values() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("region", "east")])),
            match_expressions: None,
        };

        assert!(selector_matches(&selector, &labels(&[("region", "east")])).unwrap());
        assert!(!selector_matches(&selector, &labels(&[("region", "west")])).unwrap());
        assert!(!selector_matches(&selector, &labels(&[])).unwrap());
    }

    #[rstest]
    #[case::in_hit("In", &["east", "west"], &[("region", "east")], true)]
    #[case::in_miss("In", &["east"], &[("region", "west")], false)]
    #[case::in_missing_key("In", &["east"], &[], false)]
    #[case::not_in_hit("NotIn", &["west"], &[("region", "east")], true)]
    #[case::not_in_missing_key("NotIn", &["east"], &[], true)]
    #[case::exists_hit("Exists", &[], &[("region", "east")], true)]
    #[case::exists_miss("Exists", &[], &[], false)]
    #[case::does_not_exist_hit("DoesNotExist", &[], &[], true)]
    #[case::does_not_exist_miss("DoesNotExist", &[], &[("region", "east")], false)]
    fn expressions_evaluate(
        #[case] operator: &str,
        #[case] values: &[&str],
        #[case] cluster_labels: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("region", operator, values)]),
        };

        assert_eq!(
            selector_matches(&selector, &labels(cluster_labels)).unwrap(),
            expected
        );
    }

    #[test]
    fn binary_operator_without_values_errors() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("region", "In", &[])]),
        };

        assert_eq!(
            selector_matches(&selector, &labels(&[])).unwrap_err(),
            SelectorError::BinaryOperatorWithoutValues {
                operator: "In".into()
            }
        );
    }

    #[test]
    fn unknown_operator_errors() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("region", "Near", &["east"])]),
        };

        assert_eq!(
            selector_matches(&selector, &labels(&[])).unwrap_err(),
            SelectorError::InvalidOperator {
                operator: "Near".into()
            }
        );
    }

    #[test]
    fn cluster_selector_any_term_matches() {
        let selector = ClusterSelector {
            selector_terms: vec![
                ClusterSelectorTerm {
                    label_selector: LabelSelector {
                        match_labels: Some(labels(&[("region", "west")])),
                        match_expressions: None,
                    },
                },
                ClusterSelectorTerm {
                    label_selector: LabelSelector {
                        match_labels: Some(labels(&[("tier", "prod")])),
                        match_expressions: None,
                    },
                },
            ],
        };

        assert!(cluster_selector_matches(&selector, &labels(&[("tier", "prod")])).unwrap());
        assert!(!cluster_selector_matches(&selector, &labels(&[("tier", "dev")])).unwrap());
    }

    #[test]
    fn cluster_selector_without_terms_matches_all() {
        let selector = ClusterSelector::default();

        assert!(cluster_selector_matches(&selector, &labels(&[])).unwrap());
    }
}
