//! Wire-level constants. These are compatibility surface: annotation keys,
//! finalizers and the field manager name must not change between releases.

/// API group of all fleet placement types.
pub const FLEET_GROUP: &str = "placement.kubefleet.dev";

/// API version of all fleet placement types.
pub const FLEET_VERSION: &str = "v1beta1";

/// Annotation holding the JSON of the most recently applied manifest,
/// written by the client-side apply path.
pub const LAST_APPLIED_CONFIG_ANNOTATION: &str =
    "placement.kubefleet.dev/last-applied-configuration";

/// Annotation marking a ConfigMap as an envelope wrapping other manifests.
pub const ENVELOPE_CONFIGMAP_ANNOTATION: &str = "placement.kubefleet.dev/envelope-configmap";

/// Field manager used for all server-side apply operations by the member
/// agent.
pub const WORK_FIELD_MANAGER: &str = "work-api-agent";

/// Finalizer on the hub-side Work gating its deletion until member-side
/// cleanup has finished.
pub const WORK_CLEANUP_FINALIZER: &str = "placement.kubefleet.dev/work-cleanup";

/// Finalizer letting the member API server garbage collect dependents of an
/// AppliedWork before the AppliedWork itself disappears.
pub const DELETE_DEPENDENTS_FINALIZER: &str = "foregroundDeletion";

/// Maximum serialized manifest size that can be stored in the last-applied
/// annotation. Larger manifests fall back to server-side apply. This is the
/// API server's annotation size limit.
pub const LAST_APPLIED_CONFIG_ANNOTATION_MAX_BYTES: usize = 262_144;
