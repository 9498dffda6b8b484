//! Template substitution over patch values.
//!
//! Two tokens are recognized inside string values:
//! - `${MEMBER-CLUSTER-NAME}` expands to the member cluster's name,
//! - `${MEMBER-CLUSTER-LABEL-KEY-<key>}` expands to the value of `<key>` in
//!   the member cluster's label set.
//!
//! Only exactly these bracketed forms are substituted; anything else passes
//! through unchanged. Referencing an absent label key is a user error.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use snafu::Snafu;

use crate::member::MemberCluster;

pub const MEMBER_CLUSTER_NAME_TOKEN: &str = "${MEMBER-CLUSTER-NAME}";

static LABEL_KEY_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{MEMBER-CLUSTER-LABEL-KEY-([^}]+)\}").expect("the token pattern is valid")
});

#[derive(Debug, PartialEq, Snafu)]
pub enum TemplateError {
    #[snafu(display("member cluster has no label {key:?} referenced by an override"))]
    UnresolvedLabelKey { key: String },
}

/// Substitutes all tokens in the string values of `value`, in place.
pub fn substitute(value: &mut Value, cluster: &MemberCluster) -> Result<(), TemplateError> {
    match value {
        Value::String(text) => {
            if text.contains(MEMBER_CLUSTER_NAME_TOKEN) || LABEL_KEY_TOKEN.is_match(text) {
                *text = substitute_str(text, cluster)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(|item| substitute(item, cluster)),
        Value::Object(entries) => entries
            .values_mut()
            .try_for_each(|entry| substitute(entry, cluster)),
        _ => Ok(()),
    }
}

fn substitute_str(text: &str, cluster: &MemberCluster) -> Result<String, TemplateError> {
    let named = text.replace(MEMBER_CLUSTER_NAME_TOKEN, &cluster.name);

    let mut result = String::with_capacity(named.len());
    let mut last_end = 0;
    for captures in LABEL_KEY_TOKEN.captures_iter(&named) {
        let token = captures.get(0).expect("capture 0 always exists");
        let key = &captures[1];
        let value =
            cluster
                .labels
                .get(key)
                .ok_or_else(|| TemplateError::UnresolvedLabelKey {
                    key: key.to_owned(),
                })?;

        result.push_str(&named[last_end..token.start()]);
        result.push_str(value);
        last_end = token.end();
    }
    result.push_str(&named[last_end..]);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cluster() -> MemberCluster {
        MemberCluster::from_cli("cluster-1".into(), &["region=east".into()])
            .expect("valid labels")
    }

    #[test]
    fn cluster_name_token_is_substituted() {
        let mut value = json!("${MEMBER-CLUSTER-NAME}");

        substitute(&mut value, &cluster()).unwrap();

        assert_eq!(value, json!("cluster-1"));
    }

    #[test]
    fn label_key_token_is_substituted_inside_nested_values() {
        let mut value = json!({
            "labels": {
                "app": "prefix-${MEMBER-CLUSTER-LABEL-KEY-region}-suffix",
            },
            "clusters": ["${MEMBER-CLUSTER-NAME}", 7, null],
        });

        substitute(&mut value, &cluster()).unwrap();

        assert_eq!(value["labels"]["app"], "prefix-east-suffix");
        assert_eq!(value["clusters"][0], "cluster-1");
    }

    #[test]
    fn absent_label_key_is_a_user_error() {
        let mut value = json!("${MEMBER-CLUSTER-LABEL-KEY-missing}");

        assert_eq!(
            substitute(&mut value, &cluster()).unwrap_err(),
            TemplateError::UnresolvedLabelKey {
                key: "missing".into()
            }
        );
    }

    #[test]
    fn malformed_tokens_pass_through() {
        let mut value = json!({
            "a": "${MEMBER-CLUSTER-NAME",
            "b": "$MEMBER-CLUSTER-NAME}",
            "c": "${MEMBER-CLUSTER-LABEL-KEY-}",
        });

        // `${MEMBER-CLUSTER-LABEL-KEY-}` has an empty key, which the token
        // pattern does not match; it passes through like the other two.
        substitute(&mut value, &cluster()).unwrap();

        assert_eq!(value["a"], "${MEMBER-CLUSTER-NAME");
        assert_eq!(value["b"], "$MEMBER-CLUSTER-NAME}");
        assert_eq!(value["c"], "${MEMBER-CLUSTER-LABEL-KEY-}");
    }
}
