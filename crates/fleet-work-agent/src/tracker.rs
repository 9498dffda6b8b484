//! The applied-resource tracker: the member-side record of what a Work
//! owns, and the deletion/release protocol that runs when a Work shrinks
//! or disappears.
//!
//! Ownership is expressed as a single owner reference per resource pointing
//! at the AppliedWork, non-controller, with `blockOwnerDeletion=true`. The
//! tracker is an index keyed by resource identity, not a pointer graph;
//! live objects are re-fetched by identity and matched by UID.

use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, DynamicObject, Patch, PatchParams, Preconditions},
    core::GroupVersionKind,
    discovery::Scope,
};
use serde_json::json;
use snafu::{ResultExt, Snafu};

use fleet_work_api::{
    applied_work::{AppliedResourceMeta, AppliedWork, AppliedWorkStatus},
    constants::{FLEET_GROUP, FLEET_VERSION},
    work::WorkResourceIdentifier,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::discovery::RestMapper;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve the REST mapping for {identifier}"))]
    ResolveMapping {
        source: crate::discovery::Error,
        identifier: WorkResourceIdentifier,
    },

    #[snafu(display("failed to fetch the live object for {identifier}"))]
    FetchResource {
        source: kube::Error,
        identifier: WorkResourceIdentifier,
    },

    #[snafu(display("failed to rewrite the owner references of {identifier}"))]
    RewriteOwners {
        source: kube::Error,
        identifier: WorkResourceIdentifier,
    },

    #[snafu(display("failed to delete {identifier}"))]
    DeleteResource {
        source: kube::Error,
        identifier: WorkResourceIdentifier,
    },
}

/// The owner reference every applied resource carries.
pub fn fleet_owner_reference(applied_work: &AppliedWork) -> OwnerReference {
    OwnerReference {
        api_version: format!("{FLEET_GROUP}/{FLEET_VERSION}"),
        kind: "AppliedWork".to_owned(),
        name: applied_work.name_any(),
        uid: applied_work.uid().unwrap_or_default(),
        block_owner_deletion: Some(true),
        controller: None,
    }
}

/// Whether a reference points at any AppliedWork.
pub fn is_fleet_owner(reference: &OwnerReference) -> bool {
    reference.kind == "AppliedWork"
        && reference.api_version == format!("{FLEET_GROUP}/{FLEET_VERSION}")
}

/// The owner list for an apply: all foreign references the live object
/// already carries plus exactly one fleet reference. Stale fleet
/// references (an earlier AppliedWork incarnation) are replaced.
pub fn merged_owner_references(
    live_references: &[OwnerReference],
    fleet_reference: OwnerReference,
) -> Vec<OwnerReference> {
    let mut references: Vec<OwnerReference> = live_references
        .iter()
        .filter(|reference| !is_fleet_owner(reference))
        .cloned()
        .collect();
    references.push(fleet_reference);
    references
}

/// What to do with a resource a Work no longer produces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetentionDecision {
    /// No (valid) foreign owner: the resource goes away with the Work.
    Delete,

    /// A valid foreign owner keeps the resource alive; only the fleet
    /// reference is removed.
    Release,
}

/// Decides retention from the live owner list. `owner_is_valid` reports
/// whether a foreign reference is correctly scoped: a cluster-scoped
/// resource may not be owned by a namespaced one, and an owner kind the
/// cluster does not serve cannot be a live owner. Invalid references are
/// ignored, as if not present.
pub fn retention_decision(
    owner_references: &[OwnerReference],
    owner_is_valid: impl Fn(&OwnerReference) -> bool,
) -> RetentionDecision {
    let has_valid_foreign_owner = owner_references
        .iter()
        .filter(|reference| !is_fleet_owner(reference))
        .any(owner_is_valid);

    if has_valid_foreign_owner {
        RetentionDecision::Release
    } else {
        RetentionDecision::Delete
    }
}

pub struct ResourceTracker<'a> {
    pub member_client: &'a Client,
    pub mapper: &'a RestMapper,
}

impl ResourceTracker<'_> {
    /// Applies the deletion/release protocol to every previously applied
    /// resource the current cycle no longer produced.
    pub async fn remove_left_overs(
        &self,
        applied_work: &AppliedWork,
        previous: &[AppliedResourceMeta],
        current: &[AppliedResourceMeta],
    ) -> Result<()> {
        for left_over in previous.iter().filter(|candidate| {
            !current
                .iter()
                .any(|kept| kept.identifier.same_object(&candidate.identifier))
        }) {
            self.release_or_delete(applied_work, left_over).await?;
        }

        Ok(())
    }

    async fn release_or_delete(
        &self,
        applied_work: &AppliedWork,
        meta: &AppliedResourceMeta,
    ) -> Result<()> {
        let identifier = &meta.identifier;

        let Ok((api, _)) = self.api_for(identifier).await else {
            // The kind is no longer served; nothing can be left to clean.
            tracing::info!(%identifier, "kind no longer served, skipping cleanup");
            return Ok(());
        };

        let Some(live) = api
            .get_opt(&identifier.name)
            .await
            .context(FetchResourceSnafu {
                identifier: identifier.clone(),
            })?
        else {
            return Ok(());
        };

        if live.uid().as_deref() != Some(meta.uid.as_str()) {
            tracing::info!(%identifier, "live object was replaced, leaving it alone");
            return Ok(());
        }

        let applied_work_uid = applied_work.uid().unwrap_or_default();
        let owner_references = live.owner_references();
        if !owner_references
            .iter()
            .any(|reference| is_fleet_owner(reference) && reference.uid == applied_work_uid)
        {
            tracing::warn!(
                %identifier,
                "tracked resource no longer carries this AppliedWork's owner reference"
            );
            return Ok(());
        }

        let mut validity = Vec::new();
        for reference in owner_references.iter().filter(|r| !is_fleet_owner(r)) {
            validity.push((reference.clone(), self.owner_is_valid(identifier, reference).await));
        }
        let decision = retention_decision(owner_references, |reference| {
            validity
                .iter()
                .find(|(candidate, _)| candidate == reference)
                .is_some_and(|(_, valid)| *valid)
        });

        // Stop blocking the owner's deletion before touching the resource,
        // whichever way it goes.
        let unblocked: Vec<OwnerReference> = owner_references
            .iter()
            .map(|reference| {
                if is_fleet_owner(reference) {
                    OwnerReference {
                        block_owner_deletion: Some(false),
                        ..reference.clone()
                    }
                } else {
                    reference.clone()
                }
            })
            .collect();
        self.rewrite_owners(&api, identifier, &unblocked).await?;

        match decision {
            RetentionDecision::Delete => {
                tracing::info!(%identifier, "deleting resource no longer produced by its Work");
                let params = DeleteParams {
                    preconditions: Some(Preconditions {
                        uid: Some(meta.uid.clone()),
                        resource_version: None,
                    }),
                    ..DeleteParams::default()
                };
                match api.delete(&identifier.name, &params).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(response)) if response.code == 404 || response.code == 409 => {
                        Ok(())
                    }
                    Err(source) => Err(Error::DeleteResource {
                        source,
                        identifier: identifier.clone(),
                    }),
                }
            }
            RetentionDecision::Release => {
                tracing::info!(%identifier, "releasing resource to its remaining owners");
                let released: Vec<OwnerReference> = unblocked
                    .into_iter()
                    .filter(|reference| !is_fleet_owner(reference))
                    .collect();
                self.rewrite_owners(&api, identifier, &released).await
            }
        }
    }

    async fn rewrite_owners(
        &self,
        api: &Api<DynamicObject>,
        identifier: &WorkResourceIdentifier,
        references: &[OwnerReference],
    ) -> Result<()> {
        let patch = json!({"metadata": {"ownerReferences": references}});
        api.patch(&identifier.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .context(RewriteOwnersSnafu {
                identifier: identifier.clone(),
            })
    }

    /// A foreign owner is valid when its kind is served and its scope can
    /// legally own this resource.
    async fn owner_is_valid(
        &self,
        owned: &WorkResourceIdentifier,
        reference: &OwnerReference,
    ) -> bool {
        let (group, version) = match reference.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", reference.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);

        match self.mapper.resolve(&gvk).await {
            Ok((_, owner_scope)) => {
                let owned_is_cluster_scoped = owned.namespace.is_empty();
                if owned_is_cluster_scoped {
                    matches!(owner_scope, Scope::Cluster)
                } else {
                    true
                }
            }
            Err(_) => false,
        }
    }

    async fn api_for(
        &self,
        identifier: &WorkResourceIdentifier,
    ) -> Result<(Api<DynamicObject>, Scope)> {
        let gvk = GroupVersionKind::gvk(&identifier.group, &identifier.version, &identifier.kind);
        let (api_resource, scope) =
            self.mapper
                .resolve(&gvk)
                .await
                .context(ResolveMappingSnafu {
                    identifier: identifier.clone(),
                })?;

        let api = match scope {
            Scope::Namespaced => Api::namespaced_with(
                self.member_client.clone(),
                &identifier.namespace,
                &api_resource,
            ),
            Scope::Cluster => Api::all_with(self.member_client.clone(), &api_resource),
        };
        Ok((api, scope))
    }
}

/// The AppliedWork status for the resources applied this cycle, in ordinal
/// order.
pub fn build_applied_work_status(mut applied: Vec<AppliedResourceMeta>) -> AppliedWorkStatus {
    applied.sort_by_key(|meta| meta.identifier.ordinal);
    AppliedWorkStatus {
        applied_resources: applied,
    }
}
