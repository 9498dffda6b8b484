//! Drift and diff computation.
//!
//! A *diff* compares the live object against the current desired manifest;
//! a *drift* compares the live object against the most recent successful
//! apply. Both produce sorted JSON-pointer [`PatchDetail`] lists. Under
//! partial comparison the live object is first pruned to the fields the
//! agent would set: the desired manifest's shape (pre-takeover diffs), the
//! last-applied snapshot (client-side apply) or the agent's managed-fields
//! entry (server-side apply).

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use fleet_work_api::{constants::LAST_APPLIED_CONFIG_ANNOTATION, work::PatchDetail};

/// Metadata written by the API server; never part of any comparison.
const IGNORED_METADATA_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "managedFields",
    "generation",
    "selfLink",
];

/// Compares both sides restricted to `mask`. Fields outside the mask
/// (server defaults, other managers' fields) are ignored.
pub fn masked_compare(hub: &Value, member: &Value, mask: &Value) -> Vec<PatchDetail> {
    compare(&prune_to_mask(hub, mask), &prune_to_mask(member, mask))
}

/// Compares the whole objects minus server-managed metadata, `status`, and
/// the agent's own bookkeeping (owner references, last-applied annotation).
pub fn full_compare(hub: &Value, member: &Value) -> Vec<PatchDetail> {
    compare(&scrub(hub), &scrub(member))
}

fn scrub(object: &Value) -> Value {
    let mut scrubbed = object.clone();

    if let Some(root) = scrubbed.as_object_mut() {
        root.remove("status");

        if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in IGNORED_METADATA_FIELDS {
                metadata.remove(*field);
            }
            metadata.remove("ownerReferences");

            let drop_annotations = match metadata
                .get_mut("annotations")
                .and_then(Value::as_object_mut)
            {
                Some(annotations) => {
                    annotations.remove(LAST_APPLIED_CONFIG_ANNOTATION);
                    annotations.is_empty()
                }
                None => false,
            };
            if drop_annotations {
                metadata.remove("annotations");
            }
        }
    }

    scrubbed
}

/// Restricts `value` to the shape of `mask`.
///
/// Object masks select their keys recursively; any other mask (scalars,
/// arrays, empty objects) selects the whole value at that position. Lists
/// are atomic: a list-valued mask keeps the entire live list.
pub fn prune_to_mask(value: &Value, mask: &Value) -> Value {
    match (value, mask) {
        (Value::Object(entries), Value::Object(mask_entries)) if !mask_entries.is_empty() => {
            let mut pruned = Map::new();
            for (key, mask_child) in mask_entries {
                if let Some(child) = entries.get(key) {
                    pruned.insert(key.clone(), prune_to_mask(child, mask_child));
                }
            }
            Value::Object(pruned)
        }
        _ => value.clone(),
    }
}

/// Converts a managed-fields `fieldsV1` document into a pruning mask.
///
/// `f:`-prefixed keys become object entries; `.` markers carry no children
/// of their own; `k:`/`v:`/`i:` item keys mean the list is managed
/// per-item, which promotes the whole list into the mask.
pub fn mask_from_fields_v1(fields_v1: &Value) -> Value {
    let Some(entries) = fields_v1.as_object() else {
        return Value::Object(Map::new());
    };

    let mut mask = Map::new();
    for (key, child) in entries {
        if let Some(field) = key.strip_prefix("f:") {
            mask.insert(field.to_owned(), mask_from_fields_v1(child));
        } else if key.starts_with("k:") || key.starts_with("v:") || key.starts_with("i:") {
            // A per-item managed list: the caller compares the list whole.
            return Value::Object(Map::new());
        }
    }

    Value::Object(mask)
}

/// The union of all `fieldsV1` entries the given manager owns on `live`,
/// as a pruning mask. `None` when the manager owns nothing.
pub fn manager_fields_mask(live: &Value, manager: &str) -> Option<Value> {
    let entries = live
        .pointer("/metadata/managedFields")?
        .as_array()?
        .iter()
        .filter(|entry| entry["manager"].as_str() == Some(manager))
        .filter_map(|entry| entry.get("fieldsV1"))
        .map(mask_from_fields_v1)
        .collect::<Vec<_>>();

    entries.into_iter().reduce(|merged, next| mask_union(&merged, &next))
}

fn mask_union(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Object(left_entries), Value::Object(right_entries)) => {
            // An empty object is a take-the-whole-field leaf and absorbs
            // any finer-grained mask.
            if left_entries.is_empty() || right_entries.is_empty() {
                return Value::Object(Map::new());
            }
            let mut merged = left_entries.clone();
            for (key, right_child) in right_entries {
                match merged.get(key) {
                    Some(left_child) => {
                        let union = mask_union(left_child, right_child);
                        merged.insert(key.clone(), union);
                    }
                    None => {
                        merged.insert(key.clone(), right_child.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => Value::Object(Map::new()),
    }
}

/// Structural comparison producing one entry per differing leaf, sorted by
/// path. `hub` is the desired/last-applied side, `member` the live side.
pub fn compare(hub: &Value, member: &Value) -> Vec<PatchDetail> {
    let mut details = Vec::new();
    compare_into(String::new(), Some(hub), Some(member), &mut details);
    details.sort_by(|left, right| left.path.cmp(&right.path));
    details
}

fn compare_into(
    path: String,
    hub: Option<&Value>,
    member: Option<&Value>,
    details: &mut Vec<PatchDetail>,
) {
    match (hub, member) {
        (Some(Value::Object(hub_entries)), Some(Value::Object(member_entries))) => {
            let keys: BTreeSet<&String> =
                hub_entries.keys().chain(member_entries.keys()).collect();
            for key in keys {
                compare_into(
                    format!("{path}/{}", escape_pointer_segment(key)),
                    hub_entries.get(key),
                    member_entries.get(key),
                    details,
                );
            }
        }
        (Some(Value::Array(hub_items)), Some(Value::Array(member_items))) => {
            for index in 0..hub_items.len().max(member_items.len()) {
                compare_into(
                    format!("{path}/{index}"),
                    hub_items.get(index),
                    member_items.get(index),
                    details,
                );
            }
        }
        (Some(hub_value), Some(member_value)) => {
            if hub_value != member_value {
                details.push(PatchDetail {
                    path,
                    value_in_hub: Some(render(hub_value)),
                    value_in_member: Some(render(member_value)),
                });
            }
        }
        (Some(hub_value), None) => details.push(PatchDetail {
            path,
            value_in_hub: Some(render(hub_value)),
            value_in_member: None,
        }),
        (None, Some(member_value)) => details.push(PatchDetail {
            path,
            value_in_hub: None,
            value_in_member: Some(render(member_value)),
        }),
        (None, None) => {}
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape_pointer_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn identical_objects_produce_no_details() {
        let object = json!({"spec": {"replicas": 1, "paused": false}});

        assert!(compare(&object, &object).is_empty());
    }

    #[test]
    fn differing_scalar_is_reported_with_both_values() {
        let details = compare(
            &json!({"spec": {"replicas": 1}}),
            &json!({"spec": {"replicas": 2}}),
        );

        assert_eq!(
            details,
            vec![PatchDetail {
                path: "/spec/replicas".into(),
                value_in_hub: Some("1".into()),
                value_in_member: Some("2".into()),
            }]
        );
    }

    #[test]
    fn one_sided_fields_are_reported() {
        let details = compare(
            &json!({"spec": {"paused": true}}),
            &json!({"spec": {"replicas": 2}}),
        );

        assert_eq!(
            details,
            vec![
                PatchDetail {
                    path: "/spec/paused".into(),
                    value_in_hub: Some("true".into()),
                    value_in_member: None,
                },
                PatchDetail {
                    path: "/spec/replicas".into(),
                    value_in_hub: None,
                    value_in_member: Some("2".into()),
                },
            ]
        );
    }

    #[test]
    fn array_elements_compare_by_index() {
        let details = compare(
            &json!({"spec": {"args": ["a", "b"]}}),
            &json!({"spec": {"args": ["a", "c", "d"]}}),
        );

        assert_eq!(details.len(), 2);
        assert_eq!(details[0].path, "/spec/args/1");
        assert_eq!(details[1].path, "/spec/args/2");
        assert_eq!(details[1].value_in_hub, None);
    }

    #[test]
    fn pointer_segments_are_escaped() {
        let details = compare(
            &json!({"metadata": {"labels": {"app.kubernetes.io/name": "a", "til~de": "x"}}}),
            &json!({"metadata": {"labels": {"app.kubernetes.io/name": "b", "til~de": "y"}}}),
        );

        assert_eq!(details[0].path, "/metadata/labels/app.kubernetes.io~1name");
        assert_eq!(details[1].path, "/metadata/labels/til~0de");
    }

    #[test]
    fn masked_compare_ignores_fields_outside_the_mask() {
        let desired = json!({"spec": {"replicas": 1}});
        let live = json!({
            "spec": {"replicas": 2, "progressDeadlineSeconds": 600},
            "status": {"availableReplicas": 2},
        });

        let details = masked_compare(&desired, &live, &desired);

        assert_eq!(
            details,
            vec![PatchDetail {
                path: "/spec/replicas".into(),
                value_in_hub: Some("1".into()),
                value_in_member: Some("2".into()),
            }]
        );
    }

    #[test]
    fn full_compare_ignores_server_metadata_and_bookkeeping() {
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns-x"},
            "data": {"key": "value"},
        });
        let live = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "ns-x",
                "uid": "af9b8c",
                "resourceVersion": "4711",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "generation": 3,
                "managedFields": [{"manager": "work-api-agent"}],
                "ownerReferences": [{"kind": "AppliedWork", "name": "work-1"}],
                "annotations": {LAST_APPLIED_CONFIG_ANNOTATION: "{}"},
            },
            "data": {"key": "value"},
        });

        assert!(full_compare(&desired, &live).is_empty());
    }

    #[test]
    fn full_compare_still_reports_user_visible_changes() {
        let desired = json!({"metadata": {"name": "cm"}, "data": {"key": "value"}});
        let live = json!({"metadata": {"name": "cm"}, "data": {"key": "changed"}});

        let details = full_compare(&desired, &live);

        assert_eq!(details.len(), 1);
        assert_eq!(details[0].path, "/data/key");
    }

    #[test]
    fn fields_v1_converts_to_mask() {
        let fields_v1 = json!({
            "f:metadata": {"f:labels": {"f:app": {}}},
            "f:spec": {"f:replicas": {}},
        });

        assert_eq!(
            mask_from_fields_v1(&fields_v1),
            json!({"metadata": {"labels": {"app": {}}}, "spec": {"replicas": {}}})
        );
    }

    #[test]
    fn fields_v1_list_item_keys_promote_the_whole_list() {
        let fields_v1 = json!({
            "f:spec": {
                "f:ports": {
                    "k:{\"port\":443}": {"f:port": {}, "f:protocol": {}},
                },
            },
        });

        assert_eq!(
            mask_from_fields_v1(&fields_v1),
            json!({"spec": {"ports": {}}})
        );
    }

    #[test]
    fn manager_mask_unions_all_entries() {
        let live = json!({
            "metadata": {
                "managedFields": [
                    {"manager": "work-api-agent", "operation": "Apply", "fieldsV1": {"f:spec": {"f:replicas": {}}}},
                    {"manager": "work-api-agent", "operation": "Update", "fieldsV1": {"f:metadata": {"f:labels": {"f:app": {}}}}},
                    {"manager": "kubectl", "fieldsV1": {"f:spec": {"f:paused": {}}}},
                ],
            },
        });

        let mask = manager_fields_mask(&live, "work-api-agent").expect("manager owns fields");

        assert_eq!(
            mask,
            json!({"metadata": {"labels": {"app": {}}}, "spec": {"replicas": {}}})
        );
        assert!(manager_fields_mask(&live, "someone-else").is_none());
        assert!(manager_fields_mask(&json!({}), "work-api-agent").is_none());
    }

    #[test]
    fn ssa_drift_detection_through_manager_mask() {
        let desired = json!({"spec": {"replicas": 1, "paused": false}});
        let live = json!({
            "metadata": {
                "managedFields": [
                    {"manager": "work-api-agent", "fieldsV1": {"f:spec": {"f:replicas": {}}}},
                ],
            },
            "spec": {"replicas": 2, "paused": true},
        });

        let mask = manager_fields_mask(&live, "work-api-agent").expect("manager owns fields");
        let details = masked_compare(&desired, &live, &mask);

        // `paused` is outside the mask even though it differs.
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].path, "/spec/replicas");
    }
}
