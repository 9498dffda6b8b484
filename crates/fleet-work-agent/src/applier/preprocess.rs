//! Manifest decoding and identity extraction.
//!
//! Decoding never fails a whole Work: each entry degrades into a
//! per-manifest outcome. Envelope ConfigMaps are expanded in place; their
//! payloads inherit the envelope's ordinal and are disambiguated by their
//! own group/version/kind/namespace/name.

use kube::core::GroupVersionKind;
use serde_json::Value;

use fleet_work_api::{
    constants::ENVELOPE_CONFIGMAP_ANNOTATION,
    work::{Manifest, WorkResourceIdentifier},
};

/// Result of structurally decoding one manifest.
#[derive(Clone, Debug)]
pub enum DecodeOutcome {
    Decoded(DecodedManifest),
    Failed {
        identifier: WorkResourceIdentifier,
        failure: DecodeFailure,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecodeFailure {
    /// Not a usable Kubernetes object; terminal until the spec changes.
    DecodingErred { message: String },

    /// Identity via `generateName` is refused: the applier needs a stable
    /// name for drift detection and garbage collection.
    FoundGenerateName,
}

#[derive(Clone, Debug)]
pub struct DecodedManifest {
    /// Identity without the REST mapping: `resource` stays empty until the
    /// GVK has been resolved against the member cluster.
    pub identifier: WorkResourceIdentifier,
    pub gvk: GroupVersionKind,
    pub manifest: Value,
}

/// Decodes every manifest of a Work, expanding envelopes.
pub fn decode_manifests(manifests: &[Manifest]) -> Vec<DecodeOutcome> {
    manifests
        .iter()
        .enumerate()
        .flat_map(|(ordinal, manifest)| {
            if is_envelope(&manifest.0) {
                expand_envelope(ordinal, &manifest.0)
            } else {
                vec![decode_single(ordinal, &manifest.0)]
            }
        })
        .collect()
}

fn decode_single(ordinal: usize, raw: &Value) -> DecodeOutcome {
    let identifier = partial_identifier(ordinal, raw);

    let Some(object) = raw.as_object() else {
        return DecodeOutcome::Failed {
            identifier,
            failure: DecodeFailure::DecodingErred {
                message: "the manifest is not a JSON object".to_owned(),
            },
        };
    };

    let api_version = object.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
    let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
    if api_version.is_empty() || kind.is_empty() {
        return DecodeOutcome::Failed {
            identifier,
            failure: DecodeFailure::DecodingErred {
                message: "the manifest carries no apiVersion or kind".to_owned(),
            },
        };
    }

    if identifier.name.is_empty() {
        let generate_name = raw
            .pointer("/metadata/generateName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let failure = if generate_name.is_empty() {
            DecodeFailure::DecodingErred {
                message: "the manifest has neither a name nor a generateName".to_owned(),
            }
        } else {
            DecodeFailure::FoundGenerateName
        };
        return DecodeOutcome::Failed {
            identifier,
            failure,
        };
    }

    let (group, version) = split_api_version(api_version);
    DecodeOutcome::Decoded(DecodedManifest {
        gvk: GroupVersionKind::gvk(group, version, kind),
        identifier,
        manifest: raw.clone(),
    })
}

/// Extracts whatever identity the raw value exposes, for error reporting.
fn partial_identifier(ordinal: usize, raw: &Value) -> WorkResourceIdentifier {
    let api_version = raw
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let (group, version) = split_api_version(api_version);

    WorkResourceIdentifier {
        ordinal,
        group: group.to_owned(),
        version: version.to_owned(),
        kind: raw.get("kind").and_then(Value::as_str).unwrap_or_default().to_owned(),
        resource: String::new(),
        namespace: raw
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        name: raw
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn is_envelope(raw: &Value) -> bool {
    raw.get("apiVersion").and_then(Value::as_str) == Some("v1")
        && raw.get("kind").and_then(Value::as_str) == Some("ConfigMap")
        && raw
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .and_then(|annotations| annotations.get(ENVELOPE_CONFIGMAP_ANNOTATION))
            .and_then(Value::as_str)
            == Some("true")
}

/// Decodes every `data` entry of an envelope ConfigMap as a manifest of its
/// own. Entries are processed in key order for deterministic status.
fn expand_envelope(ordinal: usize, envelope: &Value) -> Vec<DecodeOutcome> {
    let Some(data) = envelope.get("data").and_then(Value::as_object) else {
        return vec![DecodeOutcome::Failed {
            identifier: partial_identifier(ordinal, envelope),
            failure: DecodeFailure::DecodingErred {
                message: "the envelope ConfigMap has no data".to_owned(),
            },
        }];
    };

    data.iter()
        .map(|(key, payload)| {
            let Some(document) = payload.as_str() else {
                return DecodeOutcome::Failed {
                    identifier: partial_identifier(ordinal, envelope),
                    failure: DecodeFailure::DecodingErred {
                        message: format!("envelope entry {key:?} is not a string document"),
                    },
                };
            };

            match serde_yaml::from_str::<Value>(document) {
                Ok(parsed) => decode_single(ordinal, &parsed),
                Err(error) => DecodeOutcome::Failed {
                    identifier: partial_identifier(ordinal, envelope),
                    failure: DecodeFailure::DecodingErred {
                        message: format!("envelope entry {key:?} does not parse: {error}"),
                    },
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn manifest(value: Value) -> Manifest {
        Manifest(value)
    }

    #[test]
    fn well_formed_manifests_decode_in_order() {
        let outcomes = decode_manifests(&[
            manifest(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": "ns-x"},
            })),
            manifest(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "d", "namespace": "ns-x"},
            })),
        ]);

        assert_eq!(outcomes.len(), 2);
        let DecodeOutcome::Decoded(namespace) = &outcomes[0] else {
            panic!("namespace must decode");
        };
        assert_eq!(namespace.identifier.ordinal, 0);
        assert_eq!(namespace.gvk.kind, "Namespace");
        assert_eq!(namespace.gvk.group, "");

        let DecodeOutcome::Decoded(deployment) = &outcomes[1] else {
            panic!("deployment must decode");
        };
        assert_eq!(deployment.identifier.ordinal, 1);
        assert_eq!(deployment.gvk.group, "apps");
        assert_eq!(deployment.identifier.namespace, "ns-x");
    }

    #[test]
    fn missing_kind_fails_with_partial_identity() {
        let outcomes = decode_manifests(&[manifest(json!({
            "apiVersion": "v1",
            "metadata": {"name": "mystery", "namespace": "ns-x"},
        }))]);

        let DecodeOutcome::Failed {
            identifier,
            failure,
        } = &outcomes[0]
        else {
            panic!("must fail to decode");
        };
        assert!(matches!(failure, DecodeFailure::DecodingErred { .. }));
        assert_eq!(identifier.name, "mystery");
        assert_eq!(identifier.namespace, "ns-x");
        assert_eq!(identifier.kind, "");
    }

    #[test]
    fn generate_name_without_name_is_refused() {
        let outcomes = decode_manifests(&[manifest(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"generateName": "cm-", "namespace": "ns-x"},
        }))]);

        let DecodeOutcome::Failed { failure, .. } = &outcomes[0] else {
            panic!("must be refused");
        };
        assert_eq!(failure, &DecodeFailure::FoundGenerateName);
    }

    #[test]
    fn missing_name_and_generate_name_is_a_decode_error() {
        let outcomes = decode_manifests(&[manifest(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"namespace": "ns-x"},
        }))]);

        let DecodeOutcome::Failed { failure, .. } = &outcomes[0] else {
            panic!("must fail");
        };
        assert!(matches!(failure, DecodeFailure::DecodingErred { .. }));
    }

    #[test]
    fn envelope_expands_each_data_entry_with_the_envelope_ordinal() {
        let outcomes = decode_manifests(&[
            manifest(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": "ns-x"},
            })),
            manifest(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {
                    "name": "wrapper",
                    "namespace": "ns-x",
                    "annotations": {ENVELOPE_CONFIGMAP_ANNOTATION: "true"},
                },
                "data": {
                    "deployment.yaml": "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n  namespace: ns-x\n",
                    "service.yaml": "apiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n  namespace: ns-x\n",
                },
            })),
        ]);

        assert_eq!(outcomes.len(), 3);
        let DecodeOutcome::Decoded(deployment) = &outcomes[1] else {
            panic!("embedded deployment must decode");
        };
        assert_eq!(deployment.identifier.ordinal, 1);
        assert_eq!(deployment.identifier.kind, "Deployment");

        let DecodeOutcome::Decoded(service) = &outcomes[2] else {
            panic!("embedded service must decode");
        };
        assert_eq!(service.identifier.ordinal, 1);
        assert_eq!(service.identifier.kind, "Service");
    }

    #[test]
    fn malformed_envelope_entry_degrades_to_a_decode_error() {
        let outcomes = decode_manifests(&[manifest(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "wrapper",
                "namespace": "ns-x",
                "annotations": {ENVELOPE_CONFIGMAP_ANNOTATION: "true"},
            },
            "data": {
                "broken.yaml": "{not yaml: [",
            },
        }))]);

        let DecodeOutcome::Failed { failure, .. } = &outcomes[0] else {
            panic!("must fail");
        };
        assert!(matches!(failure, DecodeFailure::DecodingErred { .. }));
    }
}
