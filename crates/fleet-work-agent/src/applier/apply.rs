//! The two apply methods and the ownership-claim patch.
//!
//! Client-side apply is a three-way JSON merge between the last-applied
//! snapshot, the desired manifest, and the live object, with the snapshot
//! recorded in an annotation. When the snapshot would not fit the
//! annotation size budget the apply transparently falls back to
//! server-side apply. Server-side apply always submits under the agent's
//! field manager with `force=true`.

use kube::{
    Api,
    api::{DynamicObject, Patch, PatchParams, PostParams},
};
use serde_json::{Map, Value, json};
use snafu::{ResultExt, Snafu};

use fleet_work_api::constants::{
    LAST_APPLIED_CONFIG_ANNOTATION, LAST_APPLIED_CONFIG_ANNOTATION_MAX_BYTES, WORK_FIELD_MANAGER,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the manifest does not deserialize into an object"))]
    ManifestNotAnObject { source: serde_json::Error },

    #[snafu(display("failed to serialize the manifest for the last-applied annotation"))]
    SerializeLastApplied { source: serde_json::Error },

    #[snafu(display("failed to create the resource on the member cluster"))]
    CreateResource { source: kube::Error },

    #[snafu(display("failed to patch the resource on the member cluster"))]
    PatchResource { source: kube::Error },
}

impl Error {
    /// Conflicts, throttling and server-side trouble deserve a retry;
    /// everything else needs a spec change first.
    pub fn is_transient(&self) -> bool {
        let source = match self {
            Self::CreateResource { source } | Self::PatchResource { source } => source,
            Self::ManifestNotAnObject { .. } | Self::SerializeLastApplied { .. } => return false,
        };
        match source {
            kube::Error::Api(response) => {
                matches!(response.code, 409 | 429 | 500 | 503 | 504)
            }
            _ => true,
        }
    }
}

/// Which method ended up writing the object; recorded so that status can
/// surface the fallback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppliedWith {
    ClientSideApply,
    ServerSideApply,
}

/// Applies `desired` with the client-side method. `live` is the current
/// object, if any.
pub async fn client_side_apply(
    api: &Api<DynamicObject>,
    name: &str,
    desired: &Value,
    live: Option<&DynamicObject>,
) -> Result<(DynamicObject, AppliedWith)> {
    let snapshot = last_applied_snapshot(desired);
    let encoded = serde_json::to_string(&snapshot).context(SerializeLastAppliedSnafu)?;
    if encoded.len() > LAST_APPLIED_CONFIG_ANNOTATION_MAX_BYTES {
        // Too big for the annotation; hand the object to the server-side
        // path instead.
        tracing::debug!(
            resource = name,
            size = encoded.len(),
            field_manager = WORK_FIELD_MANAGER,
            "manifest exceeds the annotation budget, falling back to server-side apply"
        );
        let applied = server_side_apply(api, name, desired).await?;
        return Ok((applied, AppliedWith::ServerSideApply));
    }

    let mut annotated = desired.clone();
    set_annotation(&mut annotated, LAST_APPLIED_CONFIG_ANNOTATION, &encoded);

    let applied = match live {
        None => {
            let object: DynamicObject =
                serde_json::from_value(annotated).context(ManifestNotAnObjectSnafu)?;
            api.create(&PostParams::default(), &object)
                .await
                .context(CreateResourceSnafu)?
        }
        Some(live) => {
            let live_value = serde_json::to_value(live).context(SerializeLastAppliedSnafu)?;
            let patch = three_way_merge_patch(&last_applied_of(live), &annotated, &live_value);
            if patch.as_object().is_some_and(Map::is_empty) {
                // Nothing to change; re-applying must not touch the object.
                live.clone()
            } else {
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .context(PatchResourceSnafu)?
            }
        }
    };

    Ok((applied, AppliedWith::ClientSideApply))
}

/// Applies `desired` with server-side apply under the agent's field
/// manager. `force=true`: the agent owns the fields it ships.
pub async fn server_side_apply(
    api: &Api<DynamicObject>,
    name: &str,
    desired: &Value,
) -> Result<DynamicObject> {
    api.patch(
        name,
        &PatchParams::apply(WORK_FIELD_MANAGER).force(),
        &Patch::Apply(desired),
    )
    .await
    .context(PatchResourceSnafu)
}

/// Adds the fleet owner reference to a live object without touching any
/// other field. Used for takeover and for ReportDiff mode, where ownership
/// must be claimed so that a later strategy switch can garbage collect.
pub async fn claim_ownership(
    api: &Api<DynamicObject>,
    api_version: &str,
    kind: &str,
    name: &str,
    namespace: Option<&str>,
    owner_reference: &OwnerReference,
) -> Result<DynamicObject> {
    let mut metadata = json!({
        "name": name,
        "ownerReferences": [owner_reference],
    });
    if let Some(namespace) = namespace {
        metadata["namespace"] = json!(namespace);
    }
    let claim = json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": metadata,
    });

    api.patch(
        name,
        &PatchParams::apply(WORK_FIELD_MANAGER).force(),
        &Patch::Apply(&claim),
    )
    .await
    .context(PatchResourceSnafu)
}

/// The manifest as recorded in the last-applied annotation: no status, no
/// managed fields, and not the annotation itself.
pub fn last_applied_snapshot(desired: &Value) -> Value {
    let mut snapshot = desired.clone();
    if let Some(root) = snapshot.as_object_mut() {
        root.remove("status");
        if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("managedFields");
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
    snapshot
}

/// The last-applied snapshot recorded on a live object, or an empty object
/// when the agent never applied it client-side.
pub fn last_applied_of(live: &DynamicObject) -> Value {
    live.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(LAST_APPLIED_CONFIG_ANNOTATION))
        .and_then(|encoded| serde_json::from_str(encoded).ok())
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn set_annotation(manifest: &mut Value, key: &str, value: &str) {
    let Some(root) = manifest.as_object_mut() else {
        return;
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(metadata) = metadata.as_object_mut() {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(key.to_owned(), Value::String(value.to_owned()));
        }
    }
}

/// The kubectl three-way merge, restated over JSON values: fields removed
/// since the last apply become explicit nulls, fields whose live value
/// disagrees with the desired manifest are overwritten, and everything the
/// agent never shipped is left alone. Lists are atomic.
pub fn three_way_merge_patch(last_applied: &Value, desired: &Value, live: &Value) -> Value {
    let mut patch = deletion_patch(last_applied, desired);
    let updates = update_patch(desired, live);
    overlay(&mut patch, updates);
    patch
}

/// Nulls for every field the last apply shipped that the desired manifest
/// no longer carries.
fn deletion_patch(last_applied: &Value, desired: &Value) -> Value {
    let (Some(last_entries), Some(desired_entries)) = (last_applied.as_object(), desired.as_object())
    else {
        return Value::Object(Map::new());
    };

    let mut patch = Map::new();
    for (key, last_child) in last_entries {
        match desired_entries.get(key) {
            None => {
                patch.insert(key.clone(), Value::Null);
            }
            Some(desired_child) if last_child.is_object() && desired_child.is_object() => {
                let nested = deletion_patch(last_child, desired_child);
                if nested.as_object().is_some_and(|entries| !entries.is_empty()) {
                    patch.insert(key.clone(), nested);
                }
            }
            Some(_) => {}
        }
    }
    Value::Object(patch)
}

/// Every desired field whose live value differs.
fn update_patch(desired: &Value, live: &Value) -> Value {
    let (Some(desired_entries), Some(live_entries)) = (desired.as_object(), live.as_object())
    else {
        return desired.clone();
    };

    let mut patch = Map::new();
    for (key, desired_child) in desired_entries {
        match live_entries.get(key) {
            None => {
                patch.insert(key.clone(), desired_child.clone());
            }
            Some(live_child) if desired_child.is_object() && live_child.is_object() => {
                let nested = update_patch(desired_child, live_child);
                if nested.as_object().is_some_and(|entries| !entries.is_empty()) {
                    patch.insert(key.clone(), nested);
                }
            }
            Some(live_child) => {
                if desired_child != live_child {
                    patch.insert(key.clone(), desired_child.clone());
                }
            }
        }
    }
    Value::Object(patch)
}

fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base_entries), Value::Object(layer_entries)) => {
            for (key, layer_child) in layer_entries {
                match base_entries.get_mut(&key) {
                    Some(base_child) if base_child.is_object() && layer_child.is_object() => {
                        overlay(base_child, layer_child);
                    }
                    _ => {
                        base_entries.insert(key, layer_child);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_strips_status_and_bookkeeping() {
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "annotations": {LAST_APPLIED_CONFIG_ANNOTATION: "old"},
                "managedFields": [],
            },
            "status": {"anything": true},
            "data": {"key": "value"},
        });

        let snapshot = last_applied_snapshot(&desired);

        assert!(snapshot.get("status").is_none());
        assert!(snapshot.pointer("/metadata/annotations").is_none());
        assert!(snapshot.pointer("/metadata/managedFields").is_none());
        assert_eq!(snapshot["data"]["key"], "value");
    }

    #[test]
    fn unchanged_object_yields_an_empty_patch() {
        let object = json!({"metadata": {"name": "cm"}, "data": {"key": "value"}});

        let patch = three_way_merge_patch(&object, &object, &object);

        assert_eq!(patch, json!({}));
    }

    #[test]
    fn live_drift_in_shipped_fields_is_overwritten() {
        let last_applied = json!({"spec": {"replicas": 1}});
        let desired = json!({"spec": {"replicas": 1}});
        let live = json!({"spec": {"replicas": 2, "progressDeadlineSeconds": 600}});

        let patch = three_way_merge_patch(&last_applied, &desired, &live);

        assert_eq!(patch, json!({"spec": {"replicas": 1}}));
    }

    #[test]
    fn fields_dropped_from_the_manifest_are_deleted() {
        let last_applied = json!({"data": {"kept": "a", "dropped": "b"}});
        let desired = json!({"data": {"kept": "a"}});
        let live = json!({"data": {"kept": "a", "dropped": "b"}});

        let patch = three_way_merge_patch(&last_applied, &desired, &live);

        assert_eq!(patch, json!({"data": {"dropped": null}}));
    }

    #[test]
    fn server_owned_fields_are_left_alone() {
        let last_applied = json!({"spec": {"replicas": 1}});
        let desired = json!({"spec": {"replicas": 1}});
        let live = json!({
            "metadata": {"uid": "1234", "resourceVersion": "99"},
            "spec": {"replicas": 1, "strategy": {"type": "RollingUpdate"}},
        });

        let patch = three_way_merge_patch(&last_applied, &desired, &live);

        assert_eq!(patch, json!({}));
    }

    #[test]
    fn deletion_and_update_compose() {
        let last_applied = json!({"data": {"dropped": "x"}, "spec": {"replicas": 2}});
        let desired = json!({"spec": {"replicas": 3}});
        let live = json!({"data": {"dropped": "x"}, "spec": {"replicas": 2}});

        let patch = three_way_merge_patch(&last_applied, &desired, &live);

        assert_eq!(
            patch,
            json!({"data": {"dropped": null}, "spec": {"replicas": 3}})
        );
    }

    #[test]
    fn lists_are_replaced_atomically() {
        let last_applied = json!({"spec": {"args": ["a"]}});
        let desired = json!({"spec": {"args": ["a", "b"]}});
        let live = json!({"spec": {"args": ["a"]}});

        let patch = three_way_merge_patch(&last_applied, &desired, &live);

        assert_eq!(patch, json!({"spec": {"args": ["a", "b"]}}));
    }

    #[test]
    fn last_applied_of_tolerates_missing_or_garbled_annotations() {
        let plain: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns-x"},
        }))
        .expect("valid object");
        assert_eq!(last_applied_of(&plain), json!({}));

        let garbled: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "ns-x",
                "annotations": {LAST_APPLIED_CONFIG_ANNOTATION: "{not json"},
            },
        }))
        .expect("valid object");
        assert_eq!(last_applied_of(&garbled), json!({}));
    }
}
