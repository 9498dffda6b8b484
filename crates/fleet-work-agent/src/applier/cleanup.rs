//! The cleanup path: runs when a Work carries a deletion timestamp.
//!
//! Every resource the Work applied goes through the tracker's
//! deletion/release protocol. The AppliedWork is marked for deletion but
//! held by its delete-dependents finalizer; only once the protocol has
//! finished for every listed resource is that finalizer removed, letting
//! the member API server collect the AppliedWork itself. Last, the cleanup
//! finalizer comes off the Work so the hub can delete it.

use kube::{
    Resource, ResourceExt,
    api::{DeleteParams, Patch, PatchParams},
    runtime::controller::Action,
};
use serde_json::json;
use snafu::ResultExt;

use fleet_work_api::{
    constants::{DELETE_DEPENDENTS_FINALIZER, WORK_CLEANUP_FINALIZER},
    work::Work,
};

use super::{
    DeleteAppliedWorkSnafu, Error, ReleaseAppliedWorkSnafu, RemoveFinalizerSnafu,
    RemoveLeftOversSnafu, Result, WorkApplier,
};
use crate::tracker::ResourceTracker;

pub(super) async fn run(applier: &WorkApplier, work: &Work) -> Result<Action> {
    let name = work.name_any();

    if !work
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == WORK_CLEANUP_FINALIZER)
    {
        // Nothing to clean: this agent never finished a first
        // reconciliation of the Work.
        return Ok(Action::await_change());
    }

    tracing::info!(work = %name, "cleaning up a deleted Work");

    if let Some(applied_work) = applier
        .applied_works()
        .get_opt(&name)
        .await
        .context(DeleteAppliedWorkSnafu { name: name.clone() })?
    {
        // Mark the AppliedWork for deletion up front. The delete-dependents
        // finalizer holds it until the protocol below has run for every
        // listed resource, no matter where the delete originated.
        if applied_work.meta().deletion_timestamp.is_none() {
            match applier
                .applied_works()
                .delete(&name, &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(source) => {
                    return Err(Error::DeleteAppliedWork { source, name });
                }
            }
        }

        let previously_applied = applied_work
            .status
            .clone()
            .unwrap_or_default()
            .applied_resources;

        let tracker = ResourceTracker {
            member_client: &applier.member_client,
            mapper: &applier.mapper,
        };
        tracker
            .remove_left_overs(&applied_work, &previously_applied, &[])
            .await
            .context(RemoveLeftOversSnafu { name: name.clone() })?;

        release_applied_work(applier, &name).await?;
    }

    remove_work_finalizer(applier, work).await?;

    Ok(Action::await_change())
}

/// Removes the delete-dependents finalizer, letting the member API server
/// collect the AppliedWork. Re-reads the object so the patch is guarded by
/// the current `resourceVersion`.
async fn release_applied_work(applier: &WorkApplier, name: &str) -> Result<()> {
    let Some(applied_work) = applier
        .applied_works()
        .get_opt(name)
        .await
        .context(ReleaseAppliedWorkSnafu {
            name: name.to_owned(),
        })?
    else {
        return Ok(());
    };

    if !applied_work
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == DELETE_DEPENDENTS_FINALIZER)
    {
        return Ok(());
    }

    let finalizers: Vec<&String> = applied_work
        .finalizers()
        .iter()
        .filter(|finalizer| *finalizer != DELETE_DEPENDENTS_FINALIZER)
        .collect();

    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": applied_work.resource_version(),
        },
    });
    applier
        .applied_works()
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map(|_| ())
        .context(ReleaseAppliedWorkSnafu {
            name: name.to_owned(),
        })
}

async fn remove_work_finalizer(applier: &WorkApplier, work: &Work) -> Result<()> {
    let finalizers: Vec<&String> = work
        .finalizers()
        .iter()
        .filter(|finalizer| *finalizer != WORK_CLEANUP_FINALIZER)
        .collect();

    // resourceVersion makes the merge patch conditional; a concurrent
    // update surfaces as a conflict and re-runs the cleanup.
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": work.resource_version(),
        },
    });
    applier
        .works()
        .patch(&work.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .context(RemoveFinalizerSnafu {
            name: work.name_any(),
        })?;

    Ok(())
}
