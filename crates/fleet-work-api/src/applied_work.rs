//! The member-side AppliedWork: mirror of one hub Work, owner of everything
//! that Work produced on the member cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::work::WorkResourceIdentifier;

/// Cluster-scoped record of the resources one Work applied here.
///
/// Every applied resource carries an owner reference pointing at this
/// object with `blockOwnerDeletion=true`; the status lists exactly the
/// resources for which that reference exists with a matching UID.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "placement.kubefleet.dev",
    version = "v1beta1",
    kind = "AppliedWork",
    status = "AppliedWorkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AppliedWorkSpec {
    /// Name of the hub-side Work this mirrors.
    pub work_name: String,

    /// Hub namespace the Work lives in.
    pub work_namespace: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedWorkStatus {
    /// Resources applied and owned by this AppliedWork, in ordinal order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_resources: Vec<AppliedResourceMeta>,
}

/// Identity and UID of one applied resource.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedResourceMeta {
    #[serde(flatten)]
    pub identifier: WorkResourceIdentifier,

    /// UID of the live object at the time it was applied.
    pub uid: String,
}
