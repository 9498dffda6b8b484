//! Kind-aware availability checks for applied resources.
//!
//! Workload kinds are checked against their rollout status; kinds without a
//! meaningful readiness signal are treated as available the moment the
//! apply succeeded.

use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        batch::v1::Job,
        core::v1::Service,
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Availability {
    /// The kind-specific readiness signal is satisfied.
    Available,

    /// Applied, but the workload has not reached its desired state yet.
    NotYetAvailable,

    /// The kind has no readiness signal the agent tracks; available as soon
    /// as the apply succeeded.
    Untrackable,
}

/// Evaluates the availability of a live object by its GVK.
pub fn check_availability(object: &DynamicObject) -> Availability {
    let Some(types) = &object.types else {
        return Availability::Untrackable;
    };

    match (types.api_version.as_str(), types.kind.as_str()) {
        ("apps/v1", "Deployment") => check(object, deployment_available),
        ("apps/v1", "StatefulSet") => check(object, stateful_set_available),
        ("apps/v1", "DaemonSet") => check(object, daemon_set_available),
        ("batch/v1", "Job") => check(object, job_finished),
        ("v1", "Service") => check(object, service_available),
        ("apiextensions.k8s.io/v1", "CustomResourceDefinition") => check(object, crd_established),
        _ => Availability::Untrackable,
    }
}

fn check<T: DeserializeOwned>(object: &DynamicObject, predicate: fn(&T) -> bool) -> Availability {
    let Some(typed) = typed::<T>(object) else {
        return Availability::Untrackable;
    };

    if predicate(&typed) {
        Availability::Available
    } else {
        Availability::NotYetAvailable
    }
}

fn typed<T: DeserializeOwned>(object: &DynamicObject) -> Option<T> {
    serde_json::to_value(object)
        .ok()
        .and_then(|value| serde_json::from_value(value).ok())
}

fn deployment_available(deployment: &Deployment) -> bool {
    let Some(status) = &deployment.status else {
        return false;
    };
    if status.observed_generation != deployment.metadata.generation {
        return false;
    }

    let requested = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);

    status.available_replicas.unwrap_or_default() >= requested
}

fn stateful_set_available(stateful_set: &StatefulSet) -> bool {
    let Some(status) = &stateful_set.status else {
        return false;
    };
    if status.observed_generation != stateful_set.metadata.generation {
        return false;
    }

    let requested = stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);

    status.available_replicas.unwrap_or_default() >= requested
}

fn daemon_set_available(daemon_set: &DaemonSet) -> bool {
    let Some(status) = &daemon_set.status else {
        return false;
    };

    status.observed_generation == daemon_set.metadata.generation
        && status.number_available.unwrap_or_default() >= status.desired_number_scheduled
}

/// A Job counts as available once it ran to completion.
fn job_finished(job: &Job) -> bool {
    let Some(status) = &job.status else {
        return false;
    };

    let complete = status.conditions.as_ref().is_some_and(|conditions| {
        conditions
            .iter()
            .any(|condition| condition.type_ == "Complete" && condition.status == "True")
    });

    let completions = job
        .spec
        .as_ref()
        .and_then(|spec| spec.completions)
        .unwrap_or(1);

    complete || status.succeeded.unwrap_or_default() >= completions
}

fn service_available(service: &Service) -> bool {
    let Some(spec) = &service.spec else {
        return false;
    };

    match spec.type_.as_deref() {
        // Headless services have the literal cluster IP "None".
        None | Some("ClusterIP") => spec
            .cluster_ip
            .as_deref()
            .is_some_and(|cluster_ip| !cluster_ip.is_empty()),
        Some("LoadBalancer") => service
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|load_balancer| load_balancer.ingress.as_ref())
            .is_some_and(|ingress| !ingress.is_empty()),
        // NodePort, ExternalName: nothing further to wait for.
        Some(_) => true,
    }
}

fn crd_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Established" && condition.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).expect("valid object")
    }

    #[rstest]
    #[case::ready(1, 1, Availability::Available)]
    #[case::scaling(3, 1, Availability::NotYetAvailable)]
    fn deployment_availability(
        #[case] requested: i32,
        #[case] available: i32,
        #[case] expected: Availability,
    ) {
        let deployment = dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "ns-x", "generation": 2},
            "spec": {"replicas": requested},
            "status": {"observedGeneration": 2, "availableReplicas": available},
        }));

        assert_eq!(check_availability(&deployment), expected);
    }

    #[test]
    fn deployment_with_stale_observed_generation_is_not_available() {
        let deployment = dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "ns-x", "generation": 3},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 2, "availableReplicas": 1},
        }));

        assert_eq!(check_availability(&deployment), Availability::NotYetAvailable);
    }

    #[test]
    fn daemon_set_waits_for_all_scheduled_nodes() {
        let pending = dynamic(json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {"name": "ds", "namespace": "ns-x"},
            "status": {"desiredNumberScheduled": 3, "numberAvailable": 2,
                       "currentNumberScheduled": 3, "numberMisscheduled": 0, "numberReady": 2},
        }));

        assert_eq!(check_availability(&pending), Availability::NotYetAvailable);
    }

    #[test]
    fn job_is_available_once_complete() {
        let complete = dynamic(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "j", "namespace": "ns-x"},
            "status": {"conditions": [{"type": "Complete", "status": "True"}]},
        }));

        assert_eq!(check_availability(&complete), Availability::Available);
    }

    #[rstest]
    #[case::cluster_ip(json!({"clusterIP": "10.0.0.1"}), json!({}), Availability::Available)]
    #[case::headless(json!({"clusterIP": "None"}), json!({}), Availability::Available)]
    #[case::unassigned(json!({}), json!({}), Availability::NotYetAvailable)]
    #[case::load_balancer_pending(
        json!({"type": "LoadBalancer"}),
        json!({}),
        Availability::NotYetAvailable
    )]
    #[case::load_balancer_provisioned(
        json!({"type": "LoadBalancer"}),
        json!({"loadBalancer": {"ingress": [{"ip": "4.5.6.7"}]}}),
        Availability::Available
    )]
    fn service_availability(
        #[case] spec: serde_json::Value,
        #[case] status: serde_json::Value,
        #[case] expected: Availability,
    ) {
        let service = dynamic(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "ns-x"},
            "spec": spec,
            "status": status,
        }));

        assert_eq!(check_availability(&service), expected);
    }

    #[test]
    fn crd_is_available_once_established() {
        let crd = dynamic(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {
                "group": "example.com",
                "names": {"kind": "Widget", "plural": "widgets"},
                "scope": "Namespaced",
                "versions": [{"name": "v1", "served": true, "storage": true}],
            },
            "status": {"conditions": [{"type": "Established", "status": "True"}]},
        }));

        assert_eq!(check_availability(&crd), Availability::Available);
    }

    #[test]
    fn unknown_kinds_are_untrackable() {
        let config_map = dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns-x"},
            "data": {},
        }));

        assert_eq!(check_availability(&config_map), Availability::Untrackable);
    }
}
